//! Stage-to-stage handoff: payloads go to object storage, the processing
//! record points at the latest one, and a small message naming the payload
//! key is queued for the next stage.

use bytes::Bytes;
use dripdrop_core::payloads::{from_json, to_json};
use dripdrop_core::{
    ClassificationRequest, CorrelationId, MergeRequest, PersistenceRequest, ProcessingRecord,
    ProcessingState, SegmentationRequest, Stage,
};
use dripdrop_storage::{get_json, put_json, MessageQueue, ObjectStore, RecordTable};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::PipelineError;

/// Queue names, one per stage input
pub mod queues {
    pub const UPLOADS: &str = "uploads";
    pub const SEGMENTATION: &str = "segmentation";
    pub const CLASSIFICATION: &str = "classification";
    pub const MERGE: &str = "merge";
    pub const PERSISTENCE: &str = "persistence";

    pub const ALL: [&str; 5] = [UPLOADS, SEGMENTATION, CLASSIFICATION, MERGE, PERSISTENCE];
}

/// Object keys of the stage payloads
pub mod keys {
    use dripdrop_core::CorrelationId;

    pub fn segmentation(id: &CorrelationId) -> String {
        format!("segmentation/{}.json", id)
    }

    pub fn classification_prefix(id: &CorrelationId) -> String {
        format!("classification/{}/", id)
    }

    pub fn classification(id: &CorrelationId, branch: u32) -> String {
        format!("classification/{}/batch-{:04}.json", id, branch)
    }

    pub fn merge_state(id: &CorrelationId) -> String {
        format!("merge/{}.json", id)
    }

    pub fn merged(id: &CorrelationId) -> String {
        format!("merged/{}.json", id)
    }
}

/// A queued message addressed to one image's pipeline execution
pub trait StageMessage {
    fn correlation_id(&self) -> &CorrelationId;
}

macro_rules! stage_message {
    ($($ty:ty),* $(,)?) => {
        $(impl StageMessage for $ty {
            fn correlation_id(&self) -> &CorrelationId {
                &self.correlation_id
            }
        })*
    };
}

stage_message!(SegmentationRequest, ClassificationRequest, MergeRequest, PersistenceRequest);

pub struct Handoff {
    payloads: Arc<dyn ObjectStore>,
    records: Arc<dyn RecordTable>,
    queue: Arc<dyn MessageQueue>,
}

impl Handoff {
    pub fn new(
        payloads: Arc<dyn ObjectStore>,
        records: Arc<dyn RecordTable>,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self { payloads, records, queue }
    }

    pub fn payloads(&self) -> &dyn ObjectStore {
        self.payloads.as_ref()
    }

    pub fn records(&self) -> &dyn RecordTable {
        self.records.as_ref()
    }

    pub fn queue(&self) -> &dyn MessageQueue {
        self.queue.as_ref()
    }

    pub async fn create_record(&self, record: ProcessingRecord) -> Result<(), PipelineError> {
        self.records.create(record).await?;
        Ok(())
    }

    pub async fn load_record(&self, id: &CorrelationId) -> Result<ProcessingRecord, PipelineError> {
        self.records
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("processing record {}", id)))
    }

    /// Point the record at a stage's output. A redelivered stage never
    /// moves the record backwards.
    pub async fn advance_record(
        &self,
        id: &CorrelationId,
        state: ProcessingState,
        result_ref: &str,
    ) -> Result<(), PipelineError> {
        let mut record = self.load_record(id).await?;
        if record.has_reached(&state) {
            debug!(correlation_id = %id, state = ?record.state, "record already past this stage");
            return Ok(());
        }
        record.record_result(state, result_ref);
        self.records.put(record).await?;
        Ok(())
    }

    /// Mark the record failed. Errors are logged, never returned, so the
    /// original failure is what gets reported. A persisted record stays
    /// persisted.
    pub async fn fail_record(&self, id: &CorrelationId, stage: Stage, reason: &str) {
        let result = async {
            let mut record = self.load_record(id).await?;
            if record.is_persisted() {
                return Ok(false);
            }
            record.mark_failed(stage, reason);
            self.records.put(record).await?;
            Ok::<_, PipelineError>(true)
        }
        .await;

        match result {
            Ok(false) => debug!(correlation_id = %id, %stage, reason, "late failure ignored, record already persisted"),
            Ok(true) => warn!(correlation_id = %id, %stage, reason, "processing record marked failed"),
            Err(e) => warn!(correlation_id = %id, %stage, error = %e, "could not mark record failed"),
        }
    }

    pub async fn put_payload<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), PipelineError> {
        put_json(self.payloads.as_ref(), key, value).await?;
        debug!(key, "stored stage payload");
        Ok(())
    }

    /// Load a payload that an earlier stage must have written
    pub async fn get_payload<T: DeserializeOwned>(&self, key: &str) -> Result<T, PipelineError> {
        get_json(self.payloads.as_ref(), key)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("stage payload '{}'", key)))
    }

    pub async fn get_optional_payload<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PipelineError> {
        Ok(get_json(self.payloads.as_ref(), key).await?)
    }

    pub async fn enqueue<T: Serialize + Sync>(&self, queue: &str, message: &T) -> Result<String, PipelineError> {
        let body = to_json(message)?;
        let id = self.queue.send(queue, Bytes::from(body)).await?;
        debug!(queue, message_id = %id, "handed off to next stage");
        Ok(id)
    }
}

/// Decode a queue message body
pub fn decode_message<T: DeserializeOwned>(body: &[u8]) -> Result<T, PipelineError> {
    Ok(from_json(body)?)
}
