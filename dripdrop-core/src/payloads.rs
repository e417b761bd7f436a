//! Inter-stage contract: the ingress event, the stage result payloads kept in
//! object storage, and the small pointer messages that travel on the queues.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::items::{ClassifiedItem, DetectedItem, MergedItem};
use crate::types::{CorrelationId, PostId};
use crate::{Error, Result};

/// Upload-completed notification consumed by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadEvent {
    #[serde(rename = "imagePath", alias = "image_path", default)]
    pub image_path: Option<String>,
    #[serde(rename = "postID", alias = "post_id", default)]
    pub post_id: Option<PostId>,
}

/// An upload event that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedUpload {
    pub image_path: String,
    pub post_id: Option<PostId>,
}

impl UploadEvent {
    pub fn new(image_path: impl Into<String>, post_id: Option<PostId>) -> Self {
        Self { image_path: Some(image_path.into()), post_id }
    }

    /// Reject events without a usable image path
    pub fn validate(self) -> Result<DispatchedUpload> {
        let image_path = self
            .image_path
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::Validation("Missing 'imagePath'".to_string()))?;

        if image_path.len() > 1024 {
            return Err(Error::Validation("imagePath too long (max 1024)".to_string()));
        }

        Ok(DispatchedUpload { image_path, post_id: self.post_id })
    }
}

/// Segmentation -> Classification handoff
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SegmentationPayload {
    pub clothing_items: Vec<DetectedItem>,
}

/// One classification branch's output (Merge input)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassificationPayload {
    pub clothing_items: Vec<ClassifiedItem>,
    /// Items of this branch lost to a failed inference call
    #[serde(default)]
    pub failed_items: usize,
}

/// Merge output / Persistence input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedPayload {
    pub image_id: CorrelationId,
    pub image_path: String,
    #[serde(default)]
    pub post_id: Option<PostId>,
    pub clothing_items: Vec<MergedItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationRequest {
    pub correlation_id: CorrelationId,
    pub image_path: String,
    #[serde(default)]
    pub post_id: Option<PostId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRequest {
    pub correlation_id: CorrelationId,
    pub image_path: String,
    #[serde(default)]
    pub post_id: Option<PostId>,
    /// Object key of the [`SegmentationPayload`]
    pub detections_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub correlation_id: CorrelationId,
    pub image_path: String,
    #[serde(default)]
    pub post_id: Option<PostId>,
    /// Object key of the [`ClassificationPayload`] for this branch
    pub partial_ref: String,
    pub branch: u32,
    pub expected_branches: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceRequest {
    pub correlation_id: CorrelationId,
    pub image_path: String,
    #[serde(default)]
    pub post_id: Option<PostId>,
    /// Object key of the [`MergedPayload`]
    pub merged_ref: String,
}

pub fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

pub fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}
