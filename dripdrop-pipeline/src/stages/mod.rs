//! Stage handlers. Each consumes one queue and hands off to the next.

pub mod segmentation;
pub mod classification;
pub mod merge;
pub mod persistence;

pub use segmentation::SegmentationStage;
pub use classification::ClassificationStage;
pub use merge::{MergeStage, MergeState};
pub use persistence::{ItemWrite, PersistenceStage};
