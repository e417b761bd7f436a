//! Vision side of the pipeline: the remote inference boundary, raster
//! helpers, label tables and the per-stage compute built on them.

pub mod error;
pub mod endpoint;
pub mod client;
pub mod imaging;
pub mod labels;
pub mod processing;

pub use error::VisionError;
pub use endpoint::{
    InferenceEndpoint, HttpInferenceEndpoint, EndpointStatus, RawDetection, RawMask,
    DetectionResponse, Prediction, ClassificationResponse,
};
pub use client::InferenceClient;
pub use labels::LabelTable;
pub use processing::{Segmenter, Classifier, BatchOutcome};
