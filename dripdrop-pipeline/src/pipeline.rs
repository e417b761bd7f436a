//! Wiring: builds every stage from configuration and a set of stores, and
//! drives them either to idle (tests, one-shot runs) or until shutdown.

use bytes::Bytes;
use dripdrop_core::config::{LabelConfig, StorageBackend};
use dripdrop_core::payloads::to_json;
use dripdrop_core::{CorrelationId, PipelineConfig, ProcessingRecord, UploadEvent};
use dripdrop_eye::{Classifier, InferenceClient, InferenceEndpoint, LabelTable, Segmenter};
use dripdrop_storage::{
    open_sled, Catalog, FsObjectStore, InMemoryCatalog, MemoryObjectStore, MemoryQueue, MemoryRecordTable,
    MessageQueue, ObjectStore, RecordTable, SledObjectStore, SledRecordTable,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::dispatcher::Dispatcher;
use crate::error::PipelineError;
use crate::handoff::{queues, Handoff};
use crate::stages::{ClassificationStage, MergeStage, PersistenceStage, SegmentationStage};
use crate::worker::Worker;

const UPLOAD_BATCH: usize = 10;

/// Backing stores shared by all stages
#[derive(Clone)]
pub struct Stores {
    /// Uploaded source images, keyed by image path
    pub images: Arc<dyn ObjectStore>,
    /// Intermediate stage payloads
    pub payloads: Arc<dyn ObjectStore>,
    pub records: Arc<dyn RecordTable>,
    pub queue: Arc<dyn MessageQueue>,
    pub catalog: Arc<dyn Catalog>,
}

impl Stores {
    pub fn in_memory(max_receives: u32) -> Self {
        Self {
            images: Arc::new(MemoryObjectStore::new()),
            payloads: Arc::new(MemoryObjectStore::new()),
            records: Arc::new(MemoryRecordTable::new()),
            queue: Arc::new(MemoryQueue::new(max_receives)),
            catalog: Arc::new(InMemoryCatalog::new()),
        }
    }

    /// Stores for the configured backend. Images are always read from
    /// `image_root`; with `sled`, payloads and records survive restarts.
    pub fn open(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let mut stores = Self::in_memory(config.queues.max_receives);
        stores.images = Arc::new(FsObjectStore::new(config.storage.image_root.clone()));

        if config.storage.backend == StorageBackend::Sled {
            let db = open_sled(config.storage.data_dir.join("pipeline"))?;
            stores.payloads = Arc::new(SledObjectStore::new(&db)?);
            stores.records = Arc::new(SledRecordTable::new(&db)?);
            info!(data_dir = %config.storage.data_dir.display(), "opened sled stores");
        }
        Ok(stores)
    }
}

/// Category and attribute tables, from the configured files or built in
pub fn load_labels(config: &LabelConfig) -> Result<(LabelTable, LabelTable), PipelineError> {
    let categories = match &config.categories_file {
        Some(path) => LabelTable::load(path, "categories")?,
        None => LabelTable::categories(),
    };
    let attributes = match &config.attributes_file {
        Some(path) => LabelTable::load(path, "attributes")?,
        None => LabelTable::attributes(),
    };
    Ok((categories, attributes))
}

pub struct Pipeline {
    config: PipelineConfig,
    handoff: Arc<Handoff>,
    catalog: Arc<dyn Catalog>,
    dispatcher: Dispatcher,
    segmentation: Worker<SegmentationStage>,
    classification: Worker<ClassificationStage>,
    merge: Worker<MergeStage>,
    persistence: Worker<PersistenceStage>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        stores: Stores,
        endpoint: Arc<dyn InferenceEndpoint>,
        categories: LabelTable,
        attributes: LabelTable,
    ) -> Self {
        let handoff = Arc::new(Handoff::new(stores.payloads, stores.records, stores.queue));
        let client = Arc::new(InferenceClient::new(endpoint, config.inference.clone()));

        let segmenter = Segmenter::new(client.clone(), Arc::new(categories), config.segmentation.clone());
        let classifier = Classifier::new(client, Arc::new(attributes), config.classification.clone());

        let segmentation = SegmentationStage::new(handoff.clone(), stores.images, Arc::new(segmenter));
        let classification = ClassificationStage::new(handoff.clone(), Arc::new(classifier));
        let merge = MergeStage::new(handoff.clone());
        let persistence = PersistenceStage::new(handoff.clone(), stores.catalog.clone(), config.persistence.clone());

        let (w, q) = (&config.worker, &config.queues);
        let segmentation = Worker::new(Arc::new(segmentation), handoff.clone(), w, q);
        let classification = Worker::new(Arc::new(classification), handoff.clone(), w, q);
        let merge = Worker::new(Arc::new(merge), handoff.clone(), w, q);
        let persistence = Worker::new(Arc::new(persistence), handoff.clone(), w, q);
        let dispatcher = Dispatcher::new(handoff.clone(), config.dispatcher.max_concurrency);

        Self {
            config,
            handoff,
            catalog: stores.catalog,
            dispatcher,
            segmentation,
            classification,
            merge,
            persistence,
        }
    }

    /// Build with label tables loaded from the configuration
    pub fn from_config(
        config: PipelineConfig,
        stores: Stores,
        endpoint: Arc<dyn InferenceEndpoint>,
    ) -> Result<Self, PipelineError> {
        let (categories, attributes) = load_labels(&config.labels)?;
        Ok(Self::new(config, stores, endpoint, categories, attributes))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn handoff(&self) -> &Handoff {
        &self.handoff
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Queue an upload notification for the dispatcher
    pub async fn submit(&self, event: &UploadEvent) -> Result<String, PipelineError> {
        let body = to_json(event)?;
        Ok(self.handoff.queue().send(queues::UPLOADS, Bytes::from(body)).await?)
    }

    pub async fn record(&self, id: &CorrelationId) -> Result<ProcessingRecord, PipelineError> {
        self.handoff.load_record(id).await
    }

    /// Drain every queue without waiting. Returns the number of messages
    /// handled across all stages.
    pub async fn run_until_idle(&self) -> Result<usize, PipelineError> {
        let mut total = 0;
        loop {
            let mut round = self.dispatcher.consume(UPLOAD_BATCH, Duration::ZERO).await?.len();
            round += self.segmentation.run_once(Duration::ZERO).await?;
            round += self.classification.run_once(Duration::ZERO).await?;
            round += self.merge.run_once(Duration::ZERO).await?;
            round += self.persistence.run_once(Duration::ZERO).await?;
            if round == 0 {
                return Ok(total);
            }
            total += round;
        }
    }

    /// Run the dispatcher and every stage worker until `shutdown` flips
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!("pipeline started");
        tokio::join!(
            self.run_dispatcher(shutdown.clone()),
            self.segmentation.run(shutdown.clone()),
            self.classification.run(shutdown.clone()),
            self.merge.run(shutdown.clone()),
            self.persistence.run(shutdown),
        );
        info!("pipeline stopped");
    }

    async fn run_dispatcher(&self, shutdown: watch::Receiver<bool>) {
        let wait = Duration::from_millis(self.config.queues.poll_wait_ms);
        while !*shutdown.borrow() {
            match self.dispatcher.consume(UPLOAD_BATCH, wait).await {
                Ok(reports) if reports.is_empty() => tokio::task::yield_now().await,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "upload receive failed");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dripdrop_core::config::StorageBackend;
    use async_trait::async_trait;
    use dripdrop_core::CroppedImage;
    use dripdrop_eye::{ClassificationResponse, DetectionResponse, EndpointStatus, VisionError};

    struct Idle;

    #[async_trait]
    impl InferenceEndpoint for Idle {
        async fn status(&self, _endpoint: &str) -> Result<EndpointStatus, VisionError> {
            Ok(EndpointStatus::in_service())
        }

        async fn detect_and_segment(&self, _: &str, _: &CroppedImage) -> Result<DetectionResponse, VisionError> {
            Ok(DetectionResponse::default())
        }

        async fn classify(&self, _: &str, _: &[CroppedImage]) -> Result<Vec<ClassificationResponse>, VisionError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_idle_pipeline_handles_nothing() {
        let pipeline = Pipeline::from_config(PipelineConfig::default(), Stores::in_memory(5), Arc::new(Idle)).unwrap();
        assert_eq!(pipeline.run_until_idle().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_label_file_is_an_error() {
        let mut config = PipelineConfig::default();
        config.labels.categories_file = Some("/nonexistent/categories.json".into());
        assert!(Pipeline::from_config(config, Stores::in_memory(5), Arc::new(Idle)).is_err());
    }

    #[tokio::test]
    async fn test_sled_backend_stores_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.storage.backend = StorageBackend::Sled;
        config.storage.data_dir = dir.path().to_path_buf();
        config.storage.image_root = dir.path().join("images");

        let pipeline = Pipeline::from_config(config.clone(), Stores::open(&config).unwrap(), Arc::new(Idle)).unwrap();
        let id = pipeline
            .dispatcher()
            .dispatch(UploadEvent::new("a.jpg", None))
            .await
            .unwrap();
        let record = pipeline.record(&id).await.unwrap();
        assert_eq!(record.image_path, "a.jpg");
        assert!(dir.path().join("pipeline").exists());
    }
}
