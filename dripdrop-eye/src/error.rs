//! Error types for dripdrop-eye

use dripdrop_core::Error as CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Model error: {0}")]
    Model(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Endpoint '{endpoint}' not ready after {waited_ms}ms")]
    EndpointUnavailable { endpoint: String, waited_ms: u64 },

    #[error("Endpoint '{endpoint}' answered HTTP {status}")]
    Overloaded { endpoint: String, status: u16 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl VisionError {
    /// Failures that may clear up if the whole stage is retried later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VisionError::EndpointUnavailable { .. } | VisionError::Overloaded { .. } | VisionError::Network(_)
        )
    }
}

/// Replies meaning the endpoint is up but cannot take the request right now
pub fn is_overload_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vision_error_display() {
        let err = VisionError::EndpointUnavailable {
            endpoint: "clothing-segmentation".to_string(),
            waited_ms: 1500,
        };
        assert!(err.to_string().contains("clothing-segmentation"));
        assert!(err.to_string().contains("1500ms"));
        assert!(err.is_transient());
        assert!(!VisionError::Processing("x".to_string()).is_transient());
    }

    #[test]
    fn test_overloaded_is_transient() {
        let err = VisionError::Overloaded { endpoint: "clothing-attributes".to_string(), status: 503 };
        assert!(err.is_transient());
        assert!(err.to_string().contains("HTTP 503"));
        assert!(!VisionError::InvalidResponse("HTTP 500".to_string()).is_transient());
    }

    #[test]
    fn test_overload_statuses() {
        for status in [429, 502, 503, 504] {
            assert!(is_overload_status(status), "{}", status);
        }
        for status in [400, 404, 500, 501] {
            assert!(!is_overload_status(status), "{}", status);
        }
    }

    #[test]
    fn test_vision_error_from_core() {
        let err: VisionError = CoreError::Validation("bad".to_string()).into();
        match err {
            VisionError::Core(_) => {}
            _ => panic!("Expected Core error"),
        }
    }
}
