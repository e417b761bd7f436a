//! Orchestration of the clothing-item pipeline: dispatch, the four stage
//! handlers, the handoff protocol between them and the queue workers that
//! drive them.

pub mod error;
pub mod handoff;
pub mod reconcile;
pub mod dispatcher;
pub mod stages;
pub mod worker;
pub mod pipeline;

pub use error::{ErrorKind, PipelineError, StageOutcome};
pub use handoff::{keys, queues, Handoff, StageMessage};
pub use reconcile::{merge_into, merge_partials, ItemSet};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use stages::{
    ClassificationStage, ItemWrite, MergeStage, MergeState, PersistenceStage, SegmentationStage,
};
pub use worker::{StageHandler, Worker};
pub use pipeline::{Pipeline, Stores};
