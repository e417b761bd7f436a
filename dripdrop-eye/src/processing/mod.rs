//! Stage compute built on the inference client

pub mod segmentation;
pub mod classification;

pub use segmentation::Segmenter;
pub use classification::{Classifier, BatchOutcome};
