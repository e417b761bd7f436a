pub mod types;
pub mod error;
pub mod items;
pub mod payloads;
pub mod record;
pub mod post;
pub mod config;

pub use error::{Error, Result};
pub use types::{CorrelationId, ImageId, PostId, ClothingItemId, CoordinateId, TagId};
pub use items::{
    BoundingBox, Rgb, ItemBase, CroppedImage, DetectedItem, ClassifiedItem, MergedItem,
    ItemFingerprint,
};
pub use payloads::{
    UploadEvent, DispatchedUpload, SegmentationPayload, ClassificationPayload, MergedPayload,
    SegmentationRequest, ClassificationRequest, MergeRequest, PersistenceRequest,
};
pub use record::{ProcessingRecord, ProcessingState, Stage};
pub use post::PostStatus;
pub use config::{PipelineConfig, ConfigError};
