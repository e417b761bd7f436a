use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{CorrelationId, PostId};

/// Pipeline stage names, used in logs and failure records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Dispatch,
    Segmentation,
    Classification,
    Merge,
    Persistence,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Dispatch => "dispatch",
            Stage::Segmentation => "segmentation",
            Stage::Classification => "classification",
            Stage::Merge => "merge",
            Stage::Persistence => "persistence",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessingState {
    Dispatched,
    Segmented,
    Classified,
    Merged,
    Persisted,
    Failed { stage: Stage, reason: String },
}

impl ProcessingState {
    /// Position along the happy path; `None` once failed
    pub fn progress(&self) -> Option<u8> {
        match self {
            ProcessingState::Dispatched => Some(0),
            ProcessingState::Segmented => Some(1),
            ProcessingState::Classified => Some(2),
            ProcessingState::Merged => Some(3),
            ProcessingState::Persisted => Some(4),
            ProcessingState::Failed { .. } => None,
        }
    }
}

/// One per image being processed. Never deleted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub correlation_id: CorrelationId,
    pub image_path: String,
    #[serde(default)]
    pub post_id: Option<PostId>,
    /// Key of the latest stage's durable output
    #[serde(default)]
    pub stage_result_ref: Option<String>,
    #[serde(flatten)]
    pub state: ProcessingState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingRecord {
    pub fn new(correlation_id: CorrelationId, image_path: String, post_id: Option<PostId>) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            image_path,
            post_id,
            stage_result_ref: None,
            state: ProcessingState::Dispatched,
            created_at: now,
            updated_at: now,
        }
    }

    /// Point the record at a stage's output
    pub fn record_result(&mut self, state: ProcessingState, result_ref: impl Into<String>) {
        self.state = state;
        self.stage_result_ref = Some(result_ref.into());
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, stage: Stage, reason: impl Into<String>) {
        self.state = ProcessingState::Failed { stage, reason: reason.into() };
        self.updated_at = Utc::now();
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, ProcessingState::Failed { .. })
    }

    pub fn is_persisted(&self) -> bool {
        self.state == ProcessingState::Persisted
    }

    /// Whether the record has already reached `state`. A failed record has
    /// reached nothing, so a redelivered stage may move it forward again.
    pub fn has_reached(&self, state: &ProcessingState) -> bool {
        match (self.state.progress(), state.progress()) {
            (Some(current), Some(target)) => current >= target,
            _ => false,
        }
    }
}
