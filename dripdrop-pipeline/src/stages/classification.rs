use async_trait::async_trait;
use dripdrop_core::{
    ClassificationPayload, ClassificationRequest, DetectedItem, MergeRequest, ProcessingState,
    SegmentationPayload, Stage,
};
use dripdrop_eye::Classifier;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{PipelineError, StageOutcome};
use crate::handoff::{keys, queues, Handoff};
use crate::worker::StageHandler;

/// Classifies detected items in fixed-size batches. Every batch becomes one
/// merge branch; the raster crops stop here.
pub struct ClassificationStage {
    handoff: Arc<Handoff>,
    classifier: Arc<Classifier>,
}

impl ClassificationStage {
    pub fn new(handoff: Arc<Handoff>, classifier: Arc<Classifier>) -> Self {
        Self { handoff, classifier }
    }

    /// Classify one batch. A failed inference call only empties this batch,
    /// unless the endpoint is unreachable or turning requests away.
    async fn classify_branch(&self, branch: u32, batch: Vec<DetectedItem>) -> Result<ClassificationPayload, PipelineError> {
        if batch.is_empty() {
            return Ok(ClassificationPayload::default());
        }
        let size = batch.len();
        match self.classifier.classify_batch(batch).await {
            Ok(outcome) => Ok(ClassificationPayload {
                clothing_items: outcome.items,
                failed_items: outcome.failed_items,
            }),
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                warn!(branch, items = size, error = %e, "classification batch failed");
                Ok(ClassificationPayload { clothing_items: Vec::new(), failed_items: size })
            }
        }
    }
}

#[async_trait]
impl StageHandler for ClassificationStage {
    type Message = ClassificationRequest;

    fn stage(&self) -> Stage {
        Stage::Classification
    }

    fn queue(&self) -> &'static str {
        queues::CLASSIFICATION
    }

    #[instrument(skip_all, fields(correlation_id = %request.correlation_id))]
    async fn handle(&self, request: &ClassificationRequest) -> Result<StageOutcome, PipelineError> {
        let id = &request.correlation_id;
        let record = self.handoff.load_record(id).await?;
        if record.is_persisted() {
            return Ok(StageOutcome::ok("already persisted"));
        }

        let detections: SegmentationPayload = self.handoff.get_payload(&request.detections_ref).await?;
        let mut batches = self.classifier.batches(detections.clothing_items);
        if batches.is_empty() {
            // still one branch, so the image reaches Persistence
            batches.push(Vec::new());
        }
        let expected_branches = batches.len() as u32;

        let mut classified = 0;
        let mut failed = 0;
        let mut partial_refs = Vec::with_capacity(batches.len());
        for (branch, batch) in (0u32..).zip(batches) {
            let key = keys::classification(id, branch);
            let partial = match self.handoff.get_optional_payload::<ClassificationPayload>(&key).await? {
                Some(existing) => {
                    debug!(branch, "reusing stored partial");
                    existing
                }
                None => {
                    let partial = self.classify_branch(branch, batch).await?;
                    self.handoff.put_payload(&key, &partial).await?;
                    partial
                }
            };
            classified += partial.clothing_items.len();
            failed += partial.failed_items;
            partial_refs.push(key);
        }

        self.handoff
            .advance_record(id, ProcessingState::Classified, &keys::classification_prefix(id))
            .await?;

        for (branch, partial_ref) in (0u32..).zip(partial_refs) {
            self.handoff
                .enqueue(
                    queues::MERGE,
                    &MergeRequest {
                        correlation_id: id.clone(),
                        image_path: request.image_path.clone(),
                        post_id: request.post_id,
                        partial_ref,
                        branch,
                        expected_branches,
                    },
                )
                .await?;
        }

        info!(classified, failed, branches = expected_branches, "classification complete");
        Ok(StageOutcome::ok(format!(
            "classified {} items in {} batches ({} failed)",
            classified, expected_branches, failed
        )))
    }
}
