// Pipeline configuration: one section per stage plus the shared infrastructure

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Backoff schedule used while waiting for an inference endpoint to come up
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Total time allowed before the endpoint is reported unavailable
    pub deadline_ms: u64,
    /// Random extra delay added to each sleep, up to this many ms
    pub jitter_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            deadline_ms: 60_000,
            jitter_ms: 100,
        }
    }
}

impl ReadinessConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Serving control plane, polled for endpoint status
    pub control_url: String,
    /// Serving runtime, receives invocations
    pub runtime_url: String,
    pub segmentation_endpoint: String,
    pub classification_endpoint: String,
    pub request_timeout_ms: u64,
    pub readiness: ReadinessConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            control_url: "http://localhost:8080".to_string(),
            runtime_url: "http://localhost:8080".to_string(),
            segmentation_endpoint: "clothing-segmentation".to_string(),
            classification_endpoint: "clothing-attributes".to_string(),
            request_timeout_ms: 30_000,
            readiness: ReadinessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub working_width: u32,
    pub working_height: u32,
    pub confidence_floor: f32,
    pub mask_threshold: f32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            working_width: 640,
            working_height: 640,
            confidence_floor: 0.2,
            mask_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub input_width: u32,
    pub input_height: u32,
    pub batch_size: usize,
    pub top_k: usize,
    pub confidence_floor: f32,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            input_width: 224,
            input_height: 224,
            batch_size: 10,
            top_k: 5,
            confidence_floor: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// In-process attempts per item before the item (and the stage) fails
    pub item_retry_attempts: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { item_retry_attempts: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Deliveries allowed before a message is routed to the dead-letter list
    pub max_receives: u32,
    pub poll_wait_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_receives: 5, poll_wait_ms: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub max_concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { max_concurrency: num_cpus::get().clamp(1, 16) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Hard limit on a single stage invocation
    pub stage_deadline_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { stage_deadline_ms: 300_000, shutdown_grace_ms: 5_000 }
    }
}

impl WorkerConfig {
    pub fn stage_deadline(&self) -> Duration {
        Duration::from_millis(self.stage_deadline_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for sled trees (object storage and the record table)
    pub data_dir: PathBuf,
    /// Root that upload image paths are resolved against
    pub image_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("./data"),
            image_root: PathBuf::from("./images"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    pub categories_file: Option<PathBuf>,
    pub attributes_file: Option<PathBuf>,
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub log_level: String,
    pub inference: InferenceConfig,
    pub segmentation: SegmentationConfig,
    pub classification: ClassificationConfig,
    pub persistence: PersistenceConfig,
    pub queues: QueueConfig,
    pub dispatcher: DispatcherConfig,
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
    pub labels: LabelConfig,
}

impl PipelineConfig {
    /// Load configuration from file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        if path.contains("..") {
            return Err(ConfigError::IoError(format!("Path traversal detected: '{}'", path)));
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_str(&content)
    }

    /// Load configuration from string (JSON, TOML or YAML)
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        if let Ok(config) = serde_json::from_str::<PipelineConfig>(content) {
            return Ok(config);
        }

        if let Ok(config) = toml::from_str::<PipelineConfig>(content) {
            return Ok(config);
        }

        if let Ok(config) = serde_yaml::from_str::<PipelineConfig>(content) {
            return Ok(config);
        }

        Err(ConfigError::ParseError("Unknown format".to_string()))
    }

    /// Default configuration with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `DRIPDROP_*` environment overrides on top of the current values
    pub fn apply_env(&mut self) {
        if let Ok(level) = std::env::var("DRIPDROP_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(url) = std::env::var("DRIPDROP_CONTROL_URL") {
            self.inference.control_url = url;
        }
        if let Ok(url) = std::env::var("DRIPDROP_RUNTIME_URL") {
            self.inference.runtime_url = url;
        }
        if let Ok(name) = std::env::var("DRIPDROP_SEGMENTATION_ENDPOINT") {
            self.inference.segmentation_endpoint = name;
        }
        if let Ok(name) = std::env::var("DRIPDROP_CLASSIFICATION_ENDPOINT") {
            self.inference.classification_endpoint = name;
        }
        if let Ok(dir) = std::env::var("DRIPDROP_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("DRIPDROP_IMAGE_ROOT") {
            self.storage.image_root = PathBuf::from(dir);
        }
        if let Ok(backend) = std::env::var("DRIPDROP_STORAGE_BACKEND") {
            match backend.to_ascii_lowercase().as_str() {
                "memory" => self.storage.backend = StorageBackend::Memory,
                "sled" => self.storage.backend = StorageBackend::Sled,
                _ => {}
            }
        }
        if let Ok(n) = std::env::var("DRIPDROP_MAX_CONCURRENCY") {
            if let Ok(n) = n.parse::<usize>() {
                self.dispatcher.max_concurrency = n;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let seg = &self.segmentation;
        if seg.working_width == 0 || seg.working_height == 0 {
            return Err(ConfigError::ValidationError(
                "segmentation working resolution must be non-zero".to_string(),
            ));
        }
        if seg.working_width > 4096 || seg.working_height > 4096 {
            return Err(ConfigError::ValidationError(
                "segmentation working resolution too large (max 4096)".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&seg.confidence_floor) || !(0.0..=1.0).contains(&seg.mask_threshold) {
            return Err(ConfigError::ValidationError(
                "segmentation confidence_floor and mask_threshold must be within [0, 1]".to_string(),
            ));
        }

        let cls = &self.classification;
        if cls.input_width == 0 || cls.input_height == 0 {
            return Err(ConfigError::ValidationError(
                "classification input size must be non-zero".to_string(),
            ));
        }
        if cls.batch_size == 0 {
            return Err(ConfigError::ValidationError("classification.batch_size must be > 0".to_string()));
        }
        if cls.top_k == 0 {
            return Err(ConfigError::ValidationError("classification.top_k must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&cls.confidence_floor) {
            return Err(ConfigError::ValidationError(
                "classification.confidence_floor must be within [0, 1]".to_string(),
            ));
        }

        let readiness = &self.inference.readiness;
        if readiness.initial_backoff_ms == 0 || readiness.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "readiness backoff must start above 0ms and never shrink".to_string(),
            ));
        }
        if readiness.max_backoff_ms < readiness.initial_backoff_ms {
            return Err(ConfigError::ValidationError(
                "readiness.max_backoff_ms cannot be below initial_backoff_ms".to_string(),
            ));
        }
        if self.inference.segmentation_endpoint.is_empty() || self.inference.classification_endpoint.is_empty() {
            return Err(ConfigError::ValidationError("endpoint names cannot be empty".to_string()));
        }

        if self.queues.max_receives == 0 {
            return Err(ConfigError::ValidationError("queues.max_receives must be > 0".to_string()));
        }
        if self.dispatcher.max_concurrency == 0 {
            return Err(ConfigError::ValidationError("dispatcher.max_concurrency must be > 0".to_string()));
        }
        if self.persistence.item_retry_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "persistence.item_retry_attempts must be > 0".to_string(),
            ));
        }
        if self.worker.stage_deadline_ms == 0 {
            return Err(ConfigError::ValidationError("worker.stage_deadline_ms must be > 0".to_string()));
        }

        Ok(())
    }
}
