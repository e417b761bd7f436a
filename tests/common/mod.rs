// Shared fixtures: a scripted model server and an in-process pipeline

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use dripdrop_core::{CroppedImage, PipelineConfig, PostId, PostStatus};
use dripdrop_eye::labels::DEFAULT_ATTRIBUTES;
use dripdrop_eye::{
    imaging, ClassificationResponse, DetectionResponse, EndpointStatus, InferenceEndpoint, Prediction,
    RawDetection, VisionError,
};
use dripdrop_pipeline::{Pipeline, Stores};
use dripdrop_storage::{Catalog, ObjectStore};
use image::RgbImage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// How a classify call should fail
#[derive(Clone, Copy)]
pub enum Failure {
    /// Endpoint drops out of service for this call
    Unavailable,
    /// Model returns garbage
    Broken,
}

/// Model server with canned answers. Every crop gets the next prediction
/// list in rotation; calls listed in `failures` fail instead.
pub struct ScriptedEndpoint {
    detections: Vec<RawDetection>,
    predictions: Vec<Vec<Prediction>>,
    failures: Vec<(usize, Failure)>,
    fail_always: Option<Failure>,
    detect_calls: AtomicUsize,
    classify_calls: AtomicUsize,
    crops: AtomicUsize,
}

impl ScriptedEndpoint {
    pub fn new(detections: Vec<RawDetection>, predictions: Vec<Vec<Prediction>>) -> Self {
        Self {
            detections,
            predictions,
            failures: Vec::new(),
            fail_always: None,
            detect_calls: AtomicUsize::new(0),
            classify_calls: AtomicUsize::new(0),
            crops: AtomicUsize::new(0),
        }
    }

    pub fn failing_call(mut self, call: usize, failure: Failure) -> Self {
        self.failures.push((call, failure));
        self
    }

    pub fn always_failing(mut self, failure: Failure) -> Self {
        self.fail_always = Some(failure);
        self
    }

    pub fn detect_calls(&self) -> usize {
        self.detect_calls.load(Ordering::SeqCst)
    }

    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEndpoint for ScriptedEndpoint {
    async fn status(&self, _endpoint: &str) -> Result<EndpointStatus, VisionError> {
        Ok(EndpointStatus::in_service())
    }

    async fn detect_and_segment(&self, _endpoint: &str, _image: &CroppedImage) -> Result<DetectionResponse, VisionError> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(DetectionResponse { detections: self.detections.clone() })
    }

    async fn classify(&self, endpoint: &str, batch: &[CroppedImage]) -> Result<Vec<ClassificationResponse>, VisionError> {
        let call = self.classify_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .fail_always
            .or_else(|| self.failures.iter().find(|(n, _)| *n == call).map(|(_, f)| *f));
        match failure {
            Some(Failure::Unavailable) => {
                return Err(VisionError::EndpointUnavailable { endpoint: endpoint.to_string(), waited_ms: 0 })
            }
            Some(Failure::Broken) => return Err(VisionError::InvalidResponse("HTTP 500".to_string())),
            None => {}
        }
        Ok(batch
            .iter()
            .map(|_| {
                let n = self.crops.fetch_add(1, Ordering::SeqCst);
                let predictions = if self.predictions.is_empty() {
                    Vec::new()
                } else {
                    self.predictions[n % self.predictions.len()].clone()
                };
                ClassificationResponse { predictions }
            })
            .collect())
    }
}

/// Box in pixels of the 64x64 working frame
pub fn detection(xyxy: [f32; 4], class_id: u32, confidence: f32) -> RawDetection {
    RawDetection { xyxy, confidence, class_id, mask: None }
}

/// Prediction list from attribute names of the default vocabulary
pub fn predictions(scored: &[(&str, f32)]) -> Vec<Prediction> {
    scored
        .iter()
        .map(|(name, confidence)| Prediction {
            class_id: attribute_id(name),
            confidence: *confidence,
        })
        .collect()
}

pub fn attribute_id(name: &str) -> u32 {
    DEFAULT_ATTRIBUTES
        .iter()
        .position(|a| *a == name)
        .unwrap_or_else(|| panic!("'{}' is not a default attribute", name)) as u32
}

/// Small frames, fast readiness polling
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.segmentation.working_width = 64;
    config.segmentation.working_height = 64;
    config.classification.input_width = 16;
    config.classification.input_height = 16;
    config.inference.readiness.initial_backoff_ms = 1;
    config.inference.readiness.max_backoff_ms = 5;
    config.inference.readiness.jitter_ms = 0;
    config.inference.readiness.deadline_ms = 50;
    config.queues.poll_wait_ms = 0;
    config
}

pub fn outfit_png() -> Vec<u8> {
    let img = RgbImage::from_pixel(128, 128, image::Rgb([40, 80, 160]));
    imaging::encode_png(&img).unwrap().png
}

pub struct Local {
    pub pipeline: Pipeline,
    pub stores: Stores,
    pub endpoint: Arc<ScriptedEndpoint>,
}

impl Local {
    /// Store the image bytes without registering the image in the catalog
    pub async fn store_image(&self, path: &str) {
        self.stores.images.put(path, Bytes::from(outfit_png())).await.unwrap();
    }

    /// Store the image and register it under a new private post
    pub async fn upload(&self, path: &str) -> PostId {
        self.store_image(path).await;
        let post = self.stores.catalog.insert_post(PostStatus::Private).await.unwrap();
        self.stores.catalog.insert_image(path, Some(post)).await.unwrap();
        post
    }
}

pub fn local(endpoint: ScriptedEndpoint) -> Local {
    local_with(endpoint, test_config())
}

pub fn local_with(endpoint: ScriptedEndpoint, config: PipelineConfig) -> Local {
    let endpoint = Arc::new(endpoint);
    let stores = Stores::in_memory(config.queues.max_receives);
    let pipeline = Pipeline::from_config(config, stores.clone(), endpoint.clone()).unwrap();
    Local { pipeline, stores, endpoint }
}
