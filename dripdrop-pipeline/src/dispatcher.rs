//! Entry point of the pipeline: turns upload notifications into
//! Segmentation work, one correlation id per image.

use dripdrop_core::{CorrelationId, ProcessingRecord, SegmentationRequest, UploadEvent};
use dripdrop_storage::Delivery;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, StageOutcome};
use crate::handoff::{decode_message, queues, Handoff};

/// What happened to one upload notification
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub message_id: String,
    pub correlation_id: Option<CorrelationId>,
    pub outcome: StageOutcome,
}

pub struct Dispatcher {
    handoff: Arc<Handoff>,
    max_concurrency: usize,
}

impl Dispatcher {
    pub fn new(handoff: Arc<Handoff>, max_concurrency: usize) -> Self {
        Self {
            handoff,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Validate one upload event, create its processing record and start
    /// Segmentation. Nothing is written when validation fails.
    pub async fn dispatch(&self, event: UploadEvent) -> Result<CorrelationId, PipelineError> {
        let upload = event.validate()?;
        let correlation_id = CorrelationId::generate();

        let record = ProcessingRecord::new(correlation_id.clone(), upload.image_path.clone(), upload.post_id);
        self.handoff.create_record(record).await?;

        let request = SegmentationRequest {
            correlation_id: correlation_id.clone(),
            image_path: upload.image_path,
            post_id: upload.post_id,
        };
        self.handoff.enqueue(queues::SEGMENTATION, &request).await?;

        info!(
            correlation_id = %correlation_id,
            image_path = %request.image_path,
            "dispatched image"
        );
        Ok(correlation_id)
    }

    /// Dispatch a raw message body
    pub async fn dispatch_message(&self, body: &[u8]) -> Result<CorrelationId, PipelineError> {
        let event: UploadEvent = decode_message(body)?;
        self.dispatch(event).await
    }

    /// Dispatch a batch of deliveries. Siblings run concurrently and
    /// independently; a message id seen twice in one batch is only
    /// dispatched once.
    pub async fn dispatch_batch(&self, deliveries: Vec<Delivery>) -> Vec<DispatchReport> {
        let mut seen = HashSet::with_capacity(deliveries.len());
        let mut reports = Vec::new();
        let mut unique = Vec::with_capacity(deliveries.len());

        for delivery in deliveries {
            if seen.insert(delivery.message_id.clone()) {
                unique.push(delivery);
            } else {
                debug!(message_id = %delivery.message_id, "duplicate delivery in batch");
                self.settle(&delivery, &Ok(())).await;
                reports.push(DispatchReport {
                    message_id: delivery.message_id,
                    correlation_id: None,
                    outcome: StageOutcome::ok("duplicate delivery"),
                });
            }
        }

        let dispatched: Vec<DispatchReport> = stream::iter(unique)
            .map(|delivery| async move {
                let result = self.dispatch_message(&delivery.body).await;
                let settled = result.as_ref().map(|_| ()).map_err(disposition);
                self.settle(&delivery, &settled).await;
                match result {
                    Ok(id) => DispatchReport {
                        message_id: delivery.message_id,
                        outcome: StageOutcome::ok(format!("dispatched {}", id)),
                        correlation_id: Some(id),
                    },
                    Err(e) => {
                        warn!(message_id = %delivery.message_id, error = %e, status = e.kind().status(), "upload rejected");
                        DispatchReport {
                            message_id: delivery.message_id,
                            correlation_id: None,
                            outcome: StageOutcome::from_error(&e),
                        }
                    }
                }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        reports.extend(dispatched);
        reports
    }

    /// Pull up to `max` upload notifications and dispatch them
    pub async fn consume(&self, max: usize, wait: Duration) -> Result<Vec<DispatchReport>, PipelineError> {
        let deliveries = self.handoff.queue().receive(queues::UPLOADS, max, wait).await?;
        if deliveries.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = deliveries.len(), "received upload notifications");
        Ok(self.dispatch_batch(deliveries).await)
    }

    /// Ack on success, redeliver retryable failures, dead-letter the rest
    async fn settle(&self, delivery: &Delivery, result: &Result<(), Settle>) {
        let queue = self.handoff.queue();
        let settled = match result {
            Ok(()) => queue.ack(queues::UPLOADS, delivery.receipt).await,
            Err(Settle::Retry) => queue.nack(queues::UPLOADS, delivery.receipt).await,
            Err(Settle::Drop(reason)) => queue.dead_letter(queues::UPLOADS, delivery.receipt, reason).await,
        };
        if let Err(e) = settled {
            warn!(message_id = %delivery.message_id, error = %e, "could not settle upload message");
        }
    }
}

/// Queue disposition of a failed message
#[derive(Debug, Clone, PartialEq, Eq)]
enum Settle {
    Retry,
    Drop(String),
}

fn disposition(error: &PipelineError) -> Settle {
    if error.kind().is_retryable() {
        Settle::Retry
    } else {
        Settle::Drop(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dripdrop_core::payloads::to_json;
    use dripdrop_core::{PostId, ProcessingState};
    use dripdrop_storage::{MemoryObjectStore, MemoryQueue, MemoryRecordTable, MessageQueue, RecordTable};

    fn setup() -> (Dispatcher, Arc<MemoryQueue>, Arc<MemoryRecordTable>) {
        let queue = Arc::new(MemoryQueue::new(3));
        let records = Arc::new(MemoryRecordTable::new());
        let handoff = Handoff::new(Arc::new(MemoryObjectStore::new()), records.clone(), queue.clone());
        (Dispatcher::new(Arc::new(handoff), 4), queue, records)
    }

    #[tokio::test]
    async fn test_dispatch_creates_record_and_enqueues() {
        let (dispatcher, queue, records) = setup();
        let id = dispatcher
            .dispatch(UploadEvent::new("images/a.jpg", Some(PostId(7))))
            .await
            .unwrap();

        let record = records.get(&id).await.unwrap().unwrap();
        assert_eq!(record.state, ProcessingState::Dispatched);
        assert_eq!(record.post_id, Some(PostId(7)));

        let delivery = queue
            .receive(queues::SEGMENTATION, 10, Duration::ZERO)
            .await
            .unwrap()
            .remove(0);
        let request: SegmentationRequest = decode_message(&delivery.body).unwrap();
        assert_eq!(request.correlation_id, id);
        assert_eq!(request.image_path, "images/a.jpg");
    }

    #[tokio::test]
    async fn test_missing_image_path_writes_nothing() {
        let (dispatcher, queue, records) = setup();
        let err = dispatcher.dispatch_message(br#"{"postID": 3}"#).await.unwrap_err();
        assert_eq!(err.kind().status(), 400);
        assert_eq!(records.count().await.unwrap(), 0);
        assert_eq!(queue.depth(queues::SEGMENTATION).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poison_message_does_not_abort_siblings() {
        let (dispatcher, queue, records) = setup();
        queue
            .send(queues::UPLOADS, Bytes::from(to_json(&UploadEvent::new("a.jpg", None)).unwrap()))
            .await
            .unwrap();
        queue.send(queues::UPLOADS, Bytes::from_static(br#"{"postID": 1}"#)).await.unwrap();
        queue
            .send(queues::UPLOADS, Bytes::from(to_json(&UploadEvent::new("b.jpg", None)).unwrap()))
            .await
            .unwrap();

        let reports = dispatcher.consume(10, Duration::ZERO).await.unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports.iter().filter(|r| r.outcome.is_success()).count(), 2);
        assert_eq!(reports.iter().filter(|r| r.outcome.status == 400).count(), 1);

        assert_eq!(records.count().await.unwrap(), 2);
        assert_eq!(queue.depth(queues::SEGMENTATION).await.unwrap(), 2);
        assert_eq!(queue.depth(queues::UPLOADS).await.unwrap(), 0);
        assert_eq!(queue.dead_letters(queues::UPLOADS).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_message_in_batch_dispatched_once() {
        let (dispatcher, queue, records) = setup();
        let body = Bytes::from(to_json(&UploadEvent::new("a.jpg", None)).unwrap());
        let delivery = Delivery { message_id: "msg-1".into(), receipt: 1, body: body.clone(), receive_count: 1 };
        let copy = Delivery { receipt: 2, ..delivery.clone() };

        let reports = dispatcher.dispatch_batch(vec![delivery, copy]).await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.outcome.is_success()));
        assert_eq!(records.count().await.unwrap(), 1);
        assert_eq!(queue.depth(queues::SEGMENTATION).await.unwrap(), 1);
    }
}
