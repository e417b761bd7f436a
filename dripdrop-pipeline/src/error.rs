use dripdrop_core::Error as CoreError;
use dripdrop_eye::VisionError;
use dripdrop_storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Vision error: {0}")]
    Vision(#[from] VisionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Stage deadline of {0}ms exceeded")]
    DeadlineExceeded(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How the queue consumer treats a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: reported and dropped
    Validation,
    /// Referenced image, post or payload does not exist: reported and dropped
    NotFound,
    /// Redelivered until the receive bound, then dead-lettered
    Transient,
    /// Unexpected failure, retried like a transient one
    Internal,
}

impl ErrorKind {
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Transient => 503,
            ErrorKind::Internal => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Internal)
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::Vision(e) => match e {
                VisionError::EndpointUnavailable { .. } | VisionError::Overloaded { .. } | VisionError::Network(_) => {
                    ErrorKind::Transient
                }
                VisionError::Image(_) => ErrorKind::Validation,
                VisionError::Core(core) => core_kind(core),
                _ => ErrorKind::Internal,
            },
            PipelineError::Storage(e) => match e {
                StorageError::NotFound(_) => ErrorKind::NotFound,
                StorageError::InvalidKey(_) => ErrorKind::Validation,
                StorageError::Backend(_) | StorageError::Io(_) => ErrorKind::Transient,
                StorageError::Core(core) => core_kind(core),
                _ => ErrorKind::Internal,
            },
            PipelineError::Core(core) => core_kind(core),
            PipelineError::DeadlineExceeded(_) => ErrorKind::Transient,
            PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }
}

fn core_kind(error: &CoreError) -> ErrorKind {
    match error {
        CoreError::Validation(_) | CoreError::Deserialization(_) => ErrorKind::Validation,
        CoreError::Io(_) => ErrorKind::Transient,
        _ => ErrorKind::Internal,
    }
}

/// Status + message reported for every handled message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub status: u16,
    pub message: String,
}

impl StageOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { status: 200, message: message.into() }
    }

    pub fn from_error(error: &PipelineError) -> Self {
        Self { status: error.kind().status(), message: error.to_string() }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
