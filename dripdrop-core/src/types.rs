use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Error, Result};

/// Identifier threaded through every stage of one image's pipeline execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier, rejecting values that cannot be used as a storage key
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::Validation("correlation id cannot be empty".to_string()));
        }
        if value.len() > 128 {
            return Err(Error::Validation("correlation id too long (max 128)".to_string()));
        }
        if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(Error::Validation(format!(
                "correlation id contains invalid characters: '{}'",
                value
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Row id of an image in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(pub u64);

/// Row id of the post owning one or more images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClothingItemId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoordinateId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagId(pub u64);

macro_rules! display_id {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_id!(ImageId, PostId, ClothingItemId, CoordinateId, TagId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_generate_unique() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
        assert!(CorrelationId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn test_correlation_id_parse_rejects_bad_values() {
        assert!(CorrelationId::parse("").is_err());
        assert!(CorrelationId::parse("   ").is_err());
        assert!(CorrelationId::parse("../etc/passwd").is_err());
        assert!(CorrelationId::parse(&"a".repeat(129)).is_err());
        assert!(CorrelationId::parse("abc-123_x").is_ok());
    }

    #[test]
    fn test_correlation_id_serde_transparent() {
        let id = CorrelationId::parse("abc").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    #[test]
    fn test_id_display() {
        assert_eq!(PostId(7).to_string(), "7");
        assert_eq!(TagId(42).to_string(), "42");
    }
}
