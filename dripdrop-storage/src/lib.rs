pub mod error;
pub mod object_store;
pub mod record_table;
pub mod queue;
pub mod catalog;

pub use error::{StorageError, Result};
pub use object_store::{
    ObjectStore, MemoryObjectStore, FsObjectStore, SledObjectStore, put_json, get_json,
};
pub use record_table::{RecordTable, MemoryRecordTable, SledRecordTable};
pub use queue::{MessageQueue, MemoryQueue, Delivery, DeadLetter};
pub use catalog::{
    Catalog, InMemoryCatalog, CatalogStats, ImageRow, PostRow, CoordinateRow, ClothingItemRow,
    ItemDetails, TagRow, ImageItemLink, ItemWriteSet, PostTransition, Sequence,
};

/// Open (or create) the sled database backing the durable stores
pub fn open_sled(path: impl AsRef<std::path::Path>) -> Result<sled::Db> {
    sled::open(path.as_ref()).map_err(StorageError::from)
}
