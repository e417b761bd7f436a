use async_trait::async_trait;
use dripdrop_core::{
    ClassificationRequest, ProcessingState, SegmentationPayload, SegmentationRequest, Stage,
};
use dripdrop_eye::{Segmenter, VisionError};
use dripdrop_storage::ObjectStore;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::{PipelineError, StageOutcome};
use crate::handoff::{keys, queues, Handoff};
use crate::worker::StageHandler;

/// Fetches the uploaded image, runs detect+segment and hands the detected
/// items to Classification.
pub struct SegmentationStage {
    handoff: Arc<Handoff>,
    images: Arc<dyn ObjectStore>,
    segmenter: Arc<Segmenter>,
}

impl SegmentationStage {
    pub fn new(handoff: Arc<Handoff>, images: Arc<dyn ObjectStore>, segmenter: Arc<Segmenter>) -> Self {
        Self { handoff, images, segmenter }
    }

    async fn detect(&self, request: &SegmentationRequest) -> Result<SegmentationPayload, PipelineError> {
        let bytes = self
            .images
            .get(&request.image_path)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("image '{}'", request.image_path)))?;

        let clothing_items = self.segmenter.segment(&bytes).await.map_err(|e| match e {
            VisionError::Image(_) | VisionError::Processing(_) => PipelineError::Validation(format!(
                "image '{}' could not be decoded: {}",
                request.image_path, e
            )),
            other => other.into(),
        })?;
        Ok(SegmentationPayload { clothing_items })
    }
}

#[async_trait]
impl StageHandler for SegmentationStage {
    type Message = SegmentationRequest;

    fn stage(&self) -> Stage {
        Stage::Segmentation
    }

    fn queue(&self) -> &'static str {
        queues::SEGMENTATION
    }

    #[instrument(skip_all, fields(correlation_id = %request.correlation_id))]
    async fn handle(&self, request: &SegmentationRequest) -> Result<StageOutcome, PipelineError> {
        let id = &request.correlation_id;
        let record = self.handoff.load_record(id).await?;
        if record.is_persisted() {
            return Ok(StageOutcome::ok("already persisted"));
        }

        let key = keys::segmentation(id);
        let payload = match self.handoff.get_optional_payload::<SegmentationPayload>(&key).await? {
            Some(existing) => {
                debug!(key = %key, "reusing stored detections");
                existing
            }
            None => {
                let payload = self.detect(request).await?;
                self.handoff.put_payload(&key, &payload).await?;
                payload
            }
        };

        self.handoff.advance_record(id, ProcessingState::Segmented, &key).await?;
        self.handoff
            .enqueue(
                queues::CLASSIFICATION,
                &ClassificationRequest {
                    correlation_id: id.clone(),
                    image_path: request.image_path.clone(),
                    post_id: request.post_id,
                    detections_ref: key,
                },
            )
            .await?;

        let count = payload.clothing_items.len();
        info!(items = count, image_path = %request.image_path, "segmentation complete");
        Ok(StageOutcome::ok(format!("detected {} items", count)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::decode_message;
    use crate::stages::testing::{harness, sample_upload, FakeEndpoint, Harness};
    use bytes::Bytes;
    use dripdrop_core::{CorrelationId, ProcessingRecord};
    use dripdrop_eye::RawDetection;
    use std::time::Duration;

    async fn request(h: &Harness, path: &str) -> SegmentationRequest {
        let id = CorrelationId::generate();
        h.handoff
            .create_record(ProcessingRecord::new(id.clone(), path.to_string(), None))
            .await
            .unwrap();
        SegmentationRequest { correlation_id: id, image_path: path.to_string(), post_id: None }
    }

    fn detections() -> Vec<RawDetection> {
        vec![
            RawDetection { xyxy: [2.0, 2.0, 30.0, 60.0], confidence: 0.91, class_id: 6, mask: None },
            RawDetection { xyxy: [10.0, 10.0, 10.0, 20.0], confidence: 0.9, class_id: 1, mask: None },
            RawDetection { xyxy: [32.0, 32.0, 60.0, 60.0], confidence: 0.1, class_id: 2, mask: None },
        ]
    }

    #[tokio::test]
    async fn test_segments_stores_payload_and_enqueues() {
        let h = harness(FakeEndpoint::new(detections(), Vec::new()));
        h.images.put("images/a.jpg", Bytes::from(sample_upload())).await.unwrap();
        let req = request(&h, "images/a.jpg").await;

        let stage = h.segmentation();
        let outcome = stage.handle(&req).await.unwrap();
        assert_eq!(outcome.message, "detected 1 items");

        let payload: SegmentationPayload =
            h.handoff.get_payload(&keys::segmentation(&req.correlation_id)).await.unwrap();
        assert_eq!(payload.clothing_items.len(), 1);
        assert_eq!(payload.clothing_items[0].base.item, "pants");
        assert!(!payload.clothing_items[0].base.coordinates.is_degenerate());

        let record = h.handoff.load_record(&req.correlation_id).await.unwrap();
        assert_eq!(record.state, ProcessingState::Segmented);

        let delivery = h
            .handoff
            .queue()
            .receive(queues::CLASSIFICATION, 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0);
        let next: ClassificationRequest = decode_message(&delivery.body).unwrap();
        assert_eq!(next.detections_ref, keys::segmentation(&req.correlation_id));
    }

    #[tokio::test]
    async fn test_missing_image_is_not_found() {
        let h = harness(FakeEndpoint::new(detections(), Vec::new()));
        let req = request(&h, "images/missing.jpg").await;
        let err = h.segmentation().handle(&req).await.unwrap_err();
        assert_eq!(err.kind().status(), 404);
        let stored: Option<SegmentationPayload> = h
            .handoff
            .get_optional_payload(&keys::segmentation(&req.correlation_id))
            .await
            .unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_image_is_validation_error() {
        let h = harness(FakeEndpoint::new(detections(), Vec::new()));
        h.images.put("images/bad.jpg", Bytes::from_static(b"not an image")).await.unwrap();
        let req = request(&h, "images/bad.jpg").await;
        let err = h.segmentation().handle(&req).await.unwrap_err();
        assert_eq!(err.kind().status(), 400);
        assert_eq!(h.handoff.queue().depth(queues::CLASSIFICATION).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_redelivery_reuses_detections() {
        let endpoint = FakeEndpoint::new(detections(), Vec::new());
        let h = harness(endpoint.clone());
        h.images.put("images/a.jpg", Bytes::from(sample_upload())).await.unwrap();
        let req = request(&h, "images/a.jpg").await;

        let stage = h.segmentation();
        stage.handle(&req).await.unwrap();
        stage.handle(&req).await.unwrap();
        assert_eq!(endpoint.detect_calls(), 1);
        assert_eq!(h.handoff.queue().depth(queues::CLASSIFICATION).await.unwrap(), 2);
    }
}
