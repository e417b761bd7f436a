//! Relational write surface: images, posts, clothing items, coordinates, tags
//! and their link tables.

use async_trait::async_trait;
use dripdrop_core::{
    ClothingItemId, CoordinateId, Error as CoreError, ImageId, ItemFingerprint, PostId, PostStatus,
    TagId,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, StorageError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRow {
    pub id: ImageId,
    pub path: String,
    pub post_id: Option<PostId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRow {
    pub id: PostId,
    pub status: PostStatus,
}

/// Item midpoint in normalized image space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateRow {
    pub id: CoordinateId,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemDetails {
    pub name: String,
    pub category: String,
    pub brand: Option<String>,
    pub price: Option<String>,
    pub url: Option<String>,
    pub size: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClothingItemRow {
    pub id: ClothingItemId,
    pub fingerprint: ItemFingerprint,
    pub details: ItemDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRow {
    pub id: TagId,
    /// Always lowercase
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageItemLink {
    pub image: ImageId,
    pub item: ClothingItemId,
    pub coordinate: CoordinateId,
}

/// Every row belonging to one persisted item, committed together
#[derive(Debug, Clone)]
pub struct ItemWriteSet {
    pub coordinate: CoordinateRow,
    pub item: ClothingItemRow,
    pub tags: Vec<TagId>,
    pub link: ImageItemLink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostTransition {
    Advanced { from: PostStatus, to: PostStatus },
    /// Already at or past the requested status
    Unchanged(PostStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sequence {
    ClothingItem,
    Coordinate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub images: usize,
    pub posts: usize,
    pub clothing_items: usize,
    pub coordinates: usize,
    pub tags: usize,
    pub item_tags: usize,
    pub image_items: usize,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn insert_post(&self, status: PostStatus) -> Result<PostId>;

    async fn find_post(&self, id: PostId) -> Result<Option<PostRow>>;

    /// Register an uploaded image. Paths are unique.
    async fn insert_image(&self, path: &str, post_id: Option<PostId>) -> Result<ImageId>;

    async fn find_image_by_path(&self, path: &str) -> Result<Option<ImageRow>>;

    /// Reserve the next id of a sequence before its row is written
    async fn next_id(&self, sequence: Sequence) -> Result<u64>;

    async fn find_item_by_fingerprint(&self, fingerprint: &ItemFingerprint) -> Result<Option<ClothingItemId>>;

    /// Case-insensitive tag lookup
    async fn find_tag(&self, name: &str) -> Result<Option<TagId>>;

    /// Create a tag row. `UniqueViolation` if the lowercased name exists.
    async fn insert_tag(&self, name: &str) -> Result<TagId>;

    /// Write an item's full row set atomically. `UniqueViolation` if the
    /// fingerprint is already stored; nothing is written in that case.
    async fn commit_item(&self, write: ItemWriteSet) -> Result<()>;

    /// Move a post forward to `target`. No-op when it is already there or past it.
    async fn advance_post_status(&self, id: PostId, target: PostStatus) -> Result<PostTransition>;

    async fn tags_for_item(&self, item: ClothingItemId) -> Result<Vec<String>>;

    async fn items_for_image(&self, image: ImageId) -> Result<Vec<ClothingItemRow>>;

    async fn stats(&self) -> Result<CatalogStats>;

    /// Reviewer approval. Only valid from `NEEDS_REVIEW`.
    async fn publish_post(&self, id: PostId) -> Result<PostTransition> {
        let post = self
            .find_post(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("post {}", id)))?;
        if post.status != PostStatus::NeedsReview {
            return Err(CoreError::InvalidTransition {
                from: post.status.to_string(),
                to: PostStatus::Public.to_string(),
            }
            .into());
        }
        self.advance_post_status(id, PostStatus::Public).await
    }
}

/// Atomic id counters, one per sequence
struct Sequences {
    counters: HashMap<Sequence, AtomicU64>,
}

impl Sequences {
    fn new() -> Self {
        let mut counters = HashMap::new();
        counters.insert(Sequence::ClothingItem, AtomicU64::new(1));
        counters.insert(Sequence::Coordinate, AtomicU64::new(1));
        Self { counters }
    }

    fn next(&self, sequence: Sequence) -> Result<u64> {
        self.counters
            .get(&sequence)
            .map(|c| c.fetch_add(1, Ordering::SeqCst))
            .ok_or_else(|| StorageError::NotFound(format!("sequence {:?}", sequence)))
    }
}

#[derive(Default)]
struct Tables {
    posts: BTreeMap<PostId, PostRow>,
    images: BTreeMap<ImageId, ImageRow>,
    image_paths: HashMap<String, ImageId>,
    coordinates: BTreeMap<CoordinateId, CoordinateRow>,
    items: BTreeMap<ClothingItemId, ClothingItemRow>,
    fingerprints: HashMap<ItemFingerprint, ClothingItemId>,
    tags: BTreeMap<TagId, TagRow>,
    tag_names: HashMap<String, TagId>,
    item_tags: BTreeSet<(ClothingItemId, TagId)>,
    image_items: Vec<ImageItemLink>,
    next_post: u64,
    next_image: u64,
    next_tag: u64,
}

pub struct InMemoryCatalog {
    tables: Arc<RwLock<Tables>>,
    sequences: Sequences,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            sequences: Sequences::new(),
        }
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn insert_post(&self, status: PostStatus) -> Result<PostId> {
        let mut tables = self.tables.write();
        tables.next_post += 1;
        let id = PostId(tables.next_post);
        tables.posts.insert(id, PostRow { id, status });
        Ok(id)
    }

    async fn find_post(&self, id: PostId) -> Result<Option<PostRow>> {
        Ok(self.tables.read().posts.get(&id).cloned())
    }

    async fn insert_image(&self, path: &str, post_id: Option<PostId>) -> Result<ImageId> {
        let mut tables = self.tables.write();
        if tables.image_paths.contains_key(path) {
            return Err(StorageError::UniqueViolation { table: "image", key: path.to_string() });
        }
        if let Some(post) = post_id {
            if !tables.posts.contains_key(&post) {
                return Err(StorageError::NotFound(format!("post {}", post)));
            }
        }
        tables.next_image += 1;
        let id = ImageId(tables.next_image);
        tables.images.insert(id, ImageRow { id, path: path.to_string(), post_id });
        tables.image_paths.insert(path.to_string(), id);
        Ok(id)
    }

    async fn find_image_by_path(&self, path: &str) -> Result<Option<ImageRow>> {
        let tables = self.tables.read();
        Ok(tables
            .image_paths
            .get(path)
            .and_then(|id| tables.images.get(id))
            .cloned())
    }

    async fn next_id(&self, sequence: Sequence) -> Result<u64> {
        self.sequences.next(sequence)
    }

    async fn find_item_by_fingerprint(&self, fingerprint: &ItemFingerprint) -> Result<Option<ClothingItemId>> {
        Ok(self.tables.read().fingerprints.get(fingerprint).copied())
    }

    async fn find_tag(&self, name: &str) -> Result<Option<TagId>> {
        Ok(self.tables.read().tag_names.get(&name.to_lowercase()).copied())
    }

    async fn insert_tag(&self, name: &str) -> Result<TagId> {
        let name = name.to_lowercase();
        let mut tables = self.tables.write();
        if tables.tag_names.contains_key(&name) {
            return Err(StorageError::UniqueViolation { table: "tag", key: name });
        }
        tables.next_tag += 1;
        let id = TagId(tables.next_tag);
        tables.tags.insert(id, TagRow { id, name: name.clone() });
        tables.tag_names.insert(name, id);
        debug!(tag_id = %id, "created tag");
        Ok(id)
    }

    async fn commit_item(&self, write: ItemWriteSet) -> Result<()> {
        let mut tables = self.tables.write();

        // All checks before the first mutation
        if tables.fingerprints.contains_key(&write.item.fingerprint) {
            return Err(StorageError::UniqueViolation {
                table: "clothing_item",
                key: write.item.fingerprint.to_string(),
            });
        }
        if !tables.images.contains_key(&write.link.image) {
            return Err(StorageError::NotFound(format!("image {}", write.link.image)));
        }
        if tables.items.contains_key(&write.item.id) || tables.coordinates.contains_key(&write.coordinate.id) {
            return Err(StorageError::UniqueViolation {
                table: "clothing_item_id",
                key: write.item.id.to_string(),
            });
        }
        if let Some(missing) = write.tags.iter().find(|t| !tables.tags.contains_key(*t)) {
            return Err(StorageError::NotFound(format!("tag {}", missing)));
        }

        let item_id = write.item.id;
        tables.coordinates.insert(write.coordinate.id, write.coordinate);
        tables.fingerprints.insert(write.item.fingerprint.clone(), item_id);
        tables.items.insert(item_id, write.item);
        for tag in write.tags {
            tables.item_tags.insert((item_id, tag));
        }
        tables.image_items.push(write.link);
        Ok(())
    }

    async fn advance_post_status(&self, id: PostId, target: PostStatus) -> Result<PostTransition> {
        let mut tables = self.tables.write();
        let post = tables
            .posts
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("post {}", id)))?;

        if post.status.is_at_least(target) {
            return Ok(PostTransition::Unchanged(post.status));
        }
        let from = post.status;
        post.status = from.advance(target)?;
        info!(post_id = %id, from = %from, to = %target, "post status advanced");
        Ok(PostTransition::Advanced { from, to: target })
    }

    async fn tags_for_item(&self, item: ClothingItemId) -> Result<Vec<String>> {
        let tables = self.tables.read();
        Ok(tables
            .item_tags
            .range((item, TagId(0))..=(item, TagId(u64::MAX)))
            .filter_map(|(_, tag)| tables.tags.get(tag).map(|t| t.name.clone()))
            .collect())
    }

    async fn items_for_image(&self, image: ImageId) -> Result<Vec<ClothingItemRow>> {
        let tables = self.tables.read();
        Ok(tables
            .image_items
            .iter()
            .filter(|link| link.image == image)
            .filter_map(|link| tables.items.get(&link.item).cloned())
            .collect())
    }

    async fn stats(&self) -> Result<CatalogStats> {
        let tables = self.tables.read();
        Ok(CatalogStats {
            images: tables.images.len(),
            posts: tables.posts.len(),
            clothing_items: tables.items.len(),
            coordinates: tables.coordinates.len(),
            tags: tables.tags.len(),
            item_tags: tables.item_tags.len(),
            image_items: tables.image_items.len(),
        })
    }
}
