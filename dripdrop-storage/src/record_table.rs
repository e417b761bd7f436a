//! Lookup table of processing records keyed by correlation id

use async_trait::async_trait;
use dripdrop_core::{CorrelationId, ProcessingRecord};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, StorageError};

const TABLE: &str = "processing_record";

#[async_trait]
pub trait RecordTable: Send + Sync {
    /// Insert a new record. Fails with `UniqueViolation` if the id is taken.
    async fn create(&self, record: ProcessingRecord) -> Result<()>;

    async fn get(&self, id: &CorrelationId) -> Result<Option<ProcessingRecord>>;

    /// Overwrite an existing record
    async fn put(&self, record: ProcessingRecord) -> Result<()>;

    async fn count(&self) -> Result<usize>;
}

pub struct MemoryRecordTable {
    records: Arc<RwLock<HashMap<CorrelationId, ProcessingRecord>>>,
}

impl MemoryRecordTable {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryRecordTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordTable for MemoryRecordTable {
    async fn create(&self, record: ProcessingRecord) -> Result<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.correlation_id) {
            return Err(StorageError::UniqueViolation {
                table: TABLE,
                key: record.correlation_id.to_string(),
            });
        }
        records.insert(record.correlation_id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &CorrelationId) -> Result<Option<ProcessingRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn put(&self, record: ProcessingRecord) -> Result<()> {
        let mut records = self.records.write();
        match records.get_mut(&record.correlation_id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "processing record {}",
                record.correlation_id
            ))),
        }
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.read().len())
    }
}

/// Records serialized as JSON in a sled tree
pub struct SledRecordTable {
    tree: sled::Tree,
}

impl SledRecordTable {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self { tree: db.open_tree("records")? })
    }
}

#[async_trait]
impl RecordTable for SledRecordTable {
    async fn create(&self, record: ProcessingRecord) -> Result<()> {
        let value = serde_json::to_vec(&record)?;
        let key = record.correlation_id.as_str().as_bytes();
        match self.tree.compare_and_swap(key, None as Option<&[u8]>, Some(value))? {
            Ok(()) => {
                self.tree.flush_async().await?;
                Ok(())
            }
            Err(_) => Err(StorageError::UniqueViolation {
                table: TABLE,
                key: record.correlation_id.to_string(),
            }),
        }
    }

    async fn get(&self, id: &CorrelationId) -> Result<Option<ProcessingRecord>> {
        match self.tree.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, record: ProcessingRecord) -> Result<()> {
        let key = record.correlation_id.as_str().as_bytes();
        if !self.tree.contains_key(key)? {
            return Err(StorageError::NotFound(format!(
                "processing record {}",
                record.correlation_id
            )));
        }
        self.tree.insert(key, serde_json::to_vec(&record)?)?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.tree.len())
    }
}
