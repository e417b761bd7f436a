use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unique constraint violated on {table}: {key}")]
    UniqueViolation { table: &'static str, key: String },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] dripdrop_core::Error),
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        StorageError::Backend(format!("Sled error: {}", e))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl StorageError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StorageError::UniqueViolation { .. })
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
