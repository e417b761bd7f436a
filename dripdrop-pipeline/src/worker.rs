//! Queue consumer wrapping one stage handler: decodes messages, bounds each
//! invocation by the stage deadline and turns the handler's result into an
//! ack, a redelivery or a dead-letter.

use async_trait::async_trait;
use dripdrop_core::config::{QueueConfig, WorkerConfig};
use dripdrop_core::Stage;
use dripdrop_storage::Delivery;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, StageOutcome};
use crate::handoff::{decode_message, Handoff, StageMessage};

/// Messages pulled per receive
const RECEIVE_BATCH: usize = 10;

#[async_trait]
pub trait StageHandler: Send + Sync {
    type Message: DeserializeOwned + StageMessage + Send + Sync;

    fn stage(&self) -> Stage;

    /// Input queue
    fn queue(&self) -> &'static str;

    async fn handle(&self, message: &Self::Message) -> Result<StageOutcome, PipelineError>;
}

pub struct Worker<H: StageHandler> {
    handler: Arc<H>,
    handoff: Arc<Handoff>,
    deadline: Duration,
    poll_wait: Duration,
    max_receives: u32,
}

impl<H: StageHandler> Worker<H> {
    pub fn new(handler: Arc<H>, handoff: Arc<Handoff>, worker: &WorkerConfig, queues: &QueueConfig) -> Self {
        Self {
            handler,
            handoff,
            deadline: worker.stage_deadline(),
            poll_wait: Duration::from_millis(queues.poll_wait_ms),
            max_receives: queues.max_receives,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Handle one delivery and settle it on the queue
    pub async fn process(&self, delivery: Delivery) -> StageOutcome {
        let queue = self.handler.queue();
        let stage = self.handler.stage();

        let message: H::Message = match decode_message(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(%stage, message_id = %delivery.message_id, error = %e, "undecodable stage message");
                self.settle(queue, &delivery, Settle::DeadLetter(e.to_string())).await;
                return StageOutcome::from_error(&e);
            }
        };
        let correlation_id = message.correlation_id().clone();

        let result = match tokio::time::timeout(self.deadline, self.handler.handle(&message)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::DeadlineExceeded(self.deadline.as_millis() as u64)),
        };

        match result {
            Ok(outcome) => {
                debug!(%stage, correlation_id = %correlation_id, status = outcome.status, message = %outcome.message, "stage finished");
                self.settle(queue, &delivery, Settle::Ack).await;
                outcome
            }
            Err(e) => {
                let outcome = StageOutcome::from_error(&e);
                let kind = e.kind();
                if !kind.is_retryable() {
                    error!(%stage, correlation_id = %correlation_id, status = outcome.status, error = %e, "stage failed, dropping message");
                    self.settle(queue, &delivery, Settle::DeadLetter(e.to_string())).await;
                    self.handoff.fail_record(&correlation_id, stage, &e.to_string()).await;
                } else if delivery.receive_count >= self.max_receives {
                    error!(
                        %stage,
                        correlation_id = %correlation_id,
                        receive_count = delivery.receive_count,
                        error = %e,
                        "stage retries exhausted"
                    );
                    self.handoff.fail_record(&correlation_id, stage, &e.to_string()).await;
                    self.settle(queue, &delivery, Settle::Redeliver).await;
                } else {
                    warn!(
                        %stage,
                        correlation_id = %correlation_id,
                        receive_count = delivery.receive_count,
                        error = %e,
                        "stage failed, message will be redelivered"
                    );
                    self.settle(queue, &delivery, Settle::Redeliver).await;
                }
                outcome
            }
        }
    }

    /// Receive and process one batch. Returns the number of messages handled.
    pub async fn run_once(&self, wait: Duration) -> Result<usize, PipelineError> {
        let deliveries = self
            .handoff
            .queue()
            .receive(self.handler.queue(), RECEIVE_BATCH, wait)
            .await?;
        let count = deliveries.len();
        for delivery in deliveries {
            self.process(delivery).await;
        }
        Ok(count)
    }

    /// Consume until `shutdown` flips to true. A batch in progress is always
    /// finished before the loop checks the signal again.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let stage = self.handler.stage();
        info!(%stage, queue = self.handler.queue(), "stage worker started");
        while !*shutdown.borrow() {
            match self.run_once(self.poll_wait).await {
                Ok(0) => tokio::task::yield_now().await,
                Ok(_) => {}
                Err(e) => {
                    error!(%stage, error = %e, "receive failed");
                    tokio::time::sleep(self.poll_wait).await;
                }
            }
        }
        info!(%stage, "stage worker stopped");
    }

    async fn settle(&self, queue: &str, delivery: &Delivery, settle: Settle) {
        let queues = self.handoff.queue();
        let result = match &settle {
            Settle::Ack => queues.ack(queue, delivery.receipt).await,
            Settle::Redeliver => queues.nack(queue, delivery.receipt).await,
            Settle::DeadLetter(reason) => queues.dead_letter(queue, delivery.receipt, reason).await,
        };
        if let Err(e) = result {
            warn!(queue, message_id = %delivery.message_id, error = %e, "could not settle message");
        }
    }
}

enum Settle {
    Ack,
    Redeliver,
    DeadLetter(String),
}
