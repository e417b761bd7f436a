use async_trait::async_trait;
use dripdrop_core::config::PersistenceConfig;
use dripdrop_core::{
    ClothingItemId, CoordinateId, ImageId, ItemFingerprint, MergedItem, MergedPayload,
    PersistenceRequest, PostStatus, ProcessingState, Stage, TagId,
};
use dripdrop_storage::{
    Catalog, ClothingItemRow, CoordinateRow, ImageItemLink, ItemDetails, ItemWriteSet, PostTransition,
    Sequence, StorageError,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{PipelineError, StageOutcome};
use crate::handoff::{queues, Handoff};
use crate::worker::StageHandler;

/// What happened to one canonical item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemWrite {
    Written(ClothingItemId),
    /// The fingerprint was already stored by an earlier delivery
    AlreadyPresent(ClothingItemId),
}

/// Writes the canonical item list into the catalog and moves the owning
/// post to review.
pub struct PersistenceStage {
    handoff: Arc<Handoff>,
    catalog: Arc<dyn Catalog>,
    config: PersistenceConfig,
}

impl PersistenceStage {
    pub fn new(handoff: Arc<Handoff>, catalog: Arc<dyn Catalog>, config: PersistenceConfig) -> Self {
        Self { handoff, catalog, config }
    }

    /// Case-insensitive get-or-create. Losing an insert race to another
    /// writer falls back to a read.
    pub async fn get_or_create_tag(&self, name: &str) -> Result<TagId, PipelineError> {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return Err(PipelineError::Validation("empty tag".to_string()));
        }
        if let Some(id) = self.catalog.find_tag(&name).await? {
            return Ok(id);
        }
        match self.catalog.insert_tag(&name).await {
            Ok(id) => Ok(id),
            Err(e) if e.is_unique_violation() => {
                debug!(tag = %name, "tag created concurrently");
                self.catalog
                    .find_tag(&name)
                    .await?
                    .ok_or_else(|| PipelineError::Internal(format!("tag '{}' vanished after conflict", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn persist_item(&self, image: ImageId, item: &MergedItem) -> Result<ItemWrite, PipelineError> {
        let fingerprint = ItemFingerprint::compute(image, &item.base);
        if let Some(existing) = self.catalog.find_item_by_fingerprint(&fingerprint).await? {
            return Ok(ItemWrite::AlreadyPresent(existing));
        }

        let item_id = ClothingItemId(self.catalog.next_id(Sequence::ClothingItem).await?);
        let coordinate_id = CoordinateId(self.catalog.next_id(Sequence::Coordinate).await?);

        let mut tags = Vec::with_capacity(item.attributes.len());
        for attribute in &item.attributes {
            if attribute.trim().is_empty() {
                continue;
            }
            let tag = self.get_or_create_tag(attribute).await?;
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let (x, y) = item.base.coordinates.center();
        let write = ItemWriteSet {
            coordinate: CoordinateRow { id: coordinate_id, x, y },
            item: ClothingItemRow {
                id: item_id,
                fingerprint: fingerprint.clone(),
                details: ItemDetails {
                    name: item.base.item.clone(),
                    category: item.base.item.clone(),
                    ..ItemDetails::default()
                },
            },
            tags,
            link: ImageItemLink { image, item: item_id, coordinate: coordinate_id },
        };

        match self.catalog.commit_item(write).await {
            Ok(()) => Ok(ItemWrite::Written(item_id)),
            Err(StorageError::UniqueViolation { table: "clothing_item", .. }) => {
                let existing = self
                    .catalog
                    .find_item_by_fingerprint(&fingerprint)
                    .await?
                    .ok_or_else(|| PipelineError::Internal(format!("item {} vanished after conflict", fingerprint)))?;
                Ok(ItemWrite::AlreadyPresent(existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Retry one item in-process before failing the invocation
    pub async fn persist_item_with_retry(&self, image: ImageId, item: &MergedItem) -> Result<ItemWrite, PipelineError> {
        let attempts = self.config.item_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.persist_item(image, item).await {
                Ok(write) => return Ok(write),
                Err(e) if e.kind().is_retryable() && attempt < attempts => {
                    warn!(item = %item.base.item, attempt, error = %e, "item write failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl StageHandler for PersistenceStage {
    type Message = PersistenceRequest;

    fn stage(&self) -> Stage {
        Stage::Persistence
    }

    fn queue(&self) -> &'static str {
        queues::PERSISTENCE
    }

    #[instrument(skip_all, fields(correlation_id = %request.correlation_id))]
    async fn handle(&self, request: &PersistenceRequest) -> Result<StageOutcome, PipelineError> {
        let id = &request.correlation_id;
        let record = self.handoff.load_record(id).await?;
        if record.is_persisted() {
            return Ok(StageOutcome::ok("already persisted"));
        }

        let payload: MergedPayload = self.handoff.get_payload(&request.merged_ref).await?;
        let image = self
            .catalog
            .find_image_by_path(&payload.image_path)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("image '{}'", payload.image_path)))?;

        let post_id = image.post_id.or(payload.post_id);
        if let Some(post) = post_id {
            if self.catalog.find_post(post).await?.is_none() {
                return Err(PipelineError::NotFound(format!("post {}", post)));
            }
        }

        let mut written = 0;
        let mut existing = 0;
        for item in &payload.clothing_items {
            match self.persist_item_with_retry(image.id, item).await? {
                ItemWrite::Written(_) => written += 1,
                ItemWrite::AlreadyPresent(_) => existing += 1,
            }
        }

        match post_id {
            Some(post) => match self.catalog.advance_post_status(post, PostStatus::NeedsReview).await? {
                PostTransition::Advanced { from, to } => info!(post_id = %post, %from, %to, "post ready for review"),
                PostTransition::Unchanged(status) => debug!(post_id = %post, %status, "post status unchanged"),
            },
            None => debug!(image_path = %payload.image_path, "image has no post"),
        }

        self.handoff
            .advance_record(id, ProcessingState::Persisted, &request.merged_ref)
            .await?;
        info!(written, existing, image_id = %image.id, "persistence complete");
        Ok(StageOutcome::ok(format!(
            "persisted {} items ({} already present)",
            written, existing
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{classified, harness, FakeEndpoint, Harness};
    use dripdrop_core::{CorrelationId, PostId, ProcessingRecord};

    async fn setup(h: &Harness, path: &str, post_id: Option<PostId>, items: Vec<MergedItem>) -> PersistenceRequest {
        let id = CorrelationId::generate();
        h.handoff
            .create_record(ProcessingRecord::new(id.clone(), path.into(), post_id))
            .await
            .unwrap();
        let key = crate::handoff::keys::merged(&id);
        let payload = MergedPayload {
            image_id: id.clone(),
            image_path: path.into(),
            post_id,
            clothing_items: items,
        };
        h.handoff.put_payload(&key, &payload).await.unwrap();
        PersistenceRequest { correlation_id: id, image_path: path.into(), post_id, merged_ref: key }
    }

    fn merged(category: &str, x: f32, attributes: &[&str]) -> MergedItem {
        let item = classified(category, x, attributes);
        MergedItem { base: item.base, attributes: item.attributes }
    }

    #[tokio::test]
    async fn test_writes_items_tags_and_flips_post() {
        let h = harness(FakeEndpoint::new(Vec::new(), Vec::new()));
        let post = h.catalog.insert_post(PostStatus::Private).await.unwrap();
        h.catalog.insert_image("images/a.jpg", Some(post)).await.unwrap();
        let req = setup(
            &h,
            "images/a.jpg",
            None,
            vec![merged("pants", 0.1, &["denim", "blue"]), merged("shirt, blouse", 0.5, &["cotton", "striped"])],
        )
        .await;

        let outcome = h.persistence().handle(&req).await.unwrap();
        assert_eq!(outcome.message, "persisted 2 items (0 already present)");

        let stats = h.catalog.stats().await.unwrap();
        assert_eq!(stats.clothing_items, 2);
        assert_eq!(stats.coordinates, 2);
        assert_eq!(stats.tags, 4);
        assert_eq!(stats.item_tags, 4);
        assert_eq!(stats.image_items, 2);
        assert_eq!(h.catalog.find_post(post).await.unwrap().unwrap().status, PostStatus::NeedsReview);
    }

    #[tokio::test]
    async fn test_redelivery_writes_nothing_new() {
        let h = harness(FakeEndpoint::new(Vec::new(), Vec::new()));
        h.catalog.insert_image("images/a.jpg", None).await.unwrap();
        let req = setup(&h, "images/a.jpg", None, vec![merged("hat", 0.3, &["Wool"])]).await;

        h.persistence().handle(&req).await.unwrap();
        // a second copy of the message that arrives before the record flips
        let mut record = h.handoff.load_record(&req.correlation_id).await.unwrap();
        record.state = ProcessingState::Merged;
        h.handoff.records().put(record).await.unwrap();

        let outcome = h.persistence().handle(&req).await.unwrap();
        assert_eq!(outcome.message, "persisted 0 items (1 already present)");
        let stats = h.catalog.stats().await.unwrap();
        assert_eq!((stats.clothing_items, stats.coordinates, stats.image_items, stats.item_tags), (1, 1, 1, 1));
    }

    #[tokio::test]
    async fn test_unknown_image_is_not_found_and_post_untouched() {
        let h = harness(FakeEndpoint::new(Vec::new(), Vec::new()));
        let post = h.catalog.insert_post(PostStatus::Private).await.unwrap();
        let req = setup(&h, "images/missing.jpg", Some(post), vec![merged("hat", 0.3, &["red"])]).await;

        let err = h.persistence().handle(&req).await.unwrap_err();
        assert_eq!(err.kind().status(), 404);
        assert_eq!(h.catalog.stats().await.unwrap().clothing_items, 0);
        assert_eq!(h.catalog.find_post(post).await.unwrap().unwrap().status, PostStatus::Private);
    }

    #[tokio::test]
    async fn test_tags_dedupe_case_insensitively() {
        let h = harness(FakeEndpoint::new(Vec::new(), Vec::new()));
        let stage = h.persistence();
        let a = stage.get_or_create_tag("Red").await.unwrap();
        let b = stage.get_or_create_tag("red").await.unwrap();
        let c = stage.get_or_create_tag(" RED ").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(h.catalog.stats().await.unwrap().tags, 1);
        assert!(stage.get_or_create_tag("  ").await.is_err());
    }

    #[tokio::test]
    async fn test_post_already_public_is_left_alone() {
        let h = harness(FakeEndpoint::new(Vec::new(), Vec::new()));
        let post = h.catalog.insert_post(PostStatus::Public).await.unwrap();
        h.catalog.insert_image("images/a.jpg", Some(post)).await.unwrap();
        let req = setup(&h, "images/a.jpg", Some(post), Vec::new()).await;
        h.persistence().handle(&req).await.unwrap();
        assert_eq!(h.catalog.find_post(post).await.unwrap().unwrap().status, PostStatus::Public);
        let record = h.handoff.load_record(&req.correlation_id).await.unwrap();
        assert_eq!(record.state, ProcessingState::Persisted);
    }
}
