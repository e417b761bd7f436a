use async_trait::async_trait;
use dashmap::DashMap;
use dripdrop_core::{
    ClassificationPayload, CorrelationId, MergeRequest, MergedItem, MergedPayload, PersistenceRequest,
    ProcessingState, Stage,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{PipelineError, StageOutcome};
use crate::handoff::{keys, queues, Handoff};
use crate::reconcile::merge_into;
use crate::worker::StageHandler;

/// Fan-in progress for one image, stored next to the partial payloads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeState {
    pub expected_branches: u32,
    pub reported: BTreeSet<u32>,
    pub items: Vec<MergedItem>,
    pub failed_items: usize,
    /// Set once the merged payload has been handed to Persistence
    pub finalized: bool,
}

impl MergeState {
    pub fn new(expected_branches: u32) -> Self {
        Self { expected_branches, ..Self::default() }
    }

    pub fn is_complete(&self) -> bool {
        self.reported.len() as u32 == self.expected_branches
    }
}

/// Fan-in point: folds classification partials into one canonical item
/// list and releases it to Persistence once every branch has reported.
pub struct MergeStage {
    handoff: Arc<Handoff>,
    locks: DashMap<CorrelationId, Arc<Mutex<()>>>,
}

impl MergeStage {
    pub fn new(handoff: Arc<Handoff>) -> Self {
        Self { handoff, locks: DashMap::new() }
    }

    fn lock_for(&self, id: &CorrelationId) -> Arc<Mutex<()>> {
        self.locks.entry(id.clone()).or_default().value().clone()
    }

    async fn finalize(&self, request: &MergeRequest, state: &mut MergeState) -> Result<(), PipelineError> {
        let id = &request.correlation_id;
        let merged_key = keys::merged(id);
        let payload = MergedPayload {
            image_id: id.clone(),
            image_path: request.image_path.clone(),
            post_id: request.post_id,
            clothing_items: state.items.clone(),
        };
        self.handoff.put_payload(&merged_key, &payload).await?;
        self.handoff.advance_record(id, ProcessingState::Merged, &merged_key).await?;
        self.handoff
            .enqueue(
                queues::PERSISTENCE,
                &PersistenceRequest {
                    correlation_id: id.clone(),
                    image_path: request.image_path.clone(),
                    post_id: request.post_id,
                    merged_ref: merged_key,
                },
            )
            .await?;

        state.finalized = true;
        self.handoff.put_payload(&keys::merge_state(id), state).await?;
        Ok(())
    }

    /// Drop the image's lock once nobody holds or waits on it
    fn release_lock(&self, id: &CorrelationId) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Fold one branch into the stored state. Runs under the image's lock.
    async fn merge_branch(&self, request: &MergeRequest) -> Result<StageOutcome, PipelineError> {
        let id = &request.correlation_id;
        let record = self.handoff.load_record(id).await?;
        if record.is_persisted() {
            return Ok(StageOutcome::ok("already persisted"));
        }

        let state_key = keys::merge_state(id);
        let mut state = self
            .handoff
            .get_optional_payload::<MergeState>(&state_key)
            .await?
            .unwrap_or_else(|| MergeState::new(request.expected_branches));
        if state.expected_branches != request.expected_branches {
            return Err(PipelineError::Validation(format!(
                "expected {} branches, earlier partials announced {}",
                request.expected_branches, state.expected_branches
            )));
        }

        if state.reported.contains(&request.branch) {
            debug!("branch already merged");
        } else {
            let partial: ClassificationPayload = self.handoff.get_payload(&request.partial_ref).await?;
            state.items = merge_into(&state.items, &partial.clothing_items)?;
            state.failed_items += partial.failed_items;
            state.reported.insert(request.branch);
            self.handoff.put_payload(&state_key, &state).await?;
        }

        if !state.is_complete() {
            return Ok(StageOutcome::ok(format!(
                "waiting for {} of {} branches",
                state.expected_branches as usize - state.reported.len(),
                state.expected_branches
            )));
        }
        if state.finalized {
            return Ok(StageOutcome::ok("already merged"));
        }

        self.finalize(request, &mut state).await?;
        info!(
            items = state.items.len(),
            failed_items = state.failed_items,
            branches = state.expected_branches,
            "merge complete"
        );
        Ok(StageOutcome::ok(format!("merged {} items", state.items.len())))
    }
}

#[async_trait]
impl StageHandler for MergeStage {
    type Message = MergeRequest;

    fn stage(&self) -> Stage {
        Stage::Merge
    }

    fn queue(&self) -> &'static str {
        queues::MERGE
    }

    #[instrument(skip_all, fields(correlation_id = %request.correlation_id, branch = request.branch))]
    async fn handle(&self, request: &MergeRequest) -> Result<StageOutcome, PipelineError> {
        if request.expected_branches == 0 || request.branch >= request.expected_branches {
            return Err(PipelineError::Validation(format!(
                "branch {} out of range for {} expected branches",
                request.branch, request.expected_branches
            )));
        }

        let id = &request.correlation_id;
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.merge_branch(request).await
        };
        drop(lock);
        self.release_lock(id);
        result
    }
}
