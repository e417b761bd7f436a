//! Inference client with bounded readiness polling

use dripdrop_core::config::{InferenceConfig, ReadinessConfig};
use dripdrop_core::CroppedImage;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::endpoint::{ClassificationResponse, DetectionResponse, InferenceEndpoint};
use crate::error::VisionError;

/// Wraps an [`InferenceEndpoint`]. Before the first call to an endpoint it
/// polls the control plane with exponential backoff until the endpoint is in
/// service or the readiness deadline passes. Invocations themselves are made
/// exactly once; failures go back to the caller unchanged.
pub struct InferenceClient {
    endpoint: Arc<dyn InferenceEndpoint>,
    config: InferenceConfig,
    ready: RwLock<HashSet<String>>,
}

impl InferenceClient {
    pub fn new(endpoint: Arc<dyn InferenceEndpoint>, config: InferenceConfig) -> Self {
        Self {
            endpoint,
            config,
            ready: RwLock::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn is_known_ready(&self, name: &str) -> bool {
        self.ready.read().contains(name)
    }

    /// Block until `name` reports ready, or fail with `EndpointUnavailable`
    pub async fn wait_until_ready(&self, name: &str) -> Result<(), VisionError> {
        if self.is_known_ready(name) {
            return Ok(());
        }

        let readiness = &self.config.readiness;
        let started = Instant::now();
        let deadline = readiness.deadline();
        let mut delay = Duration::from_millis(readiness.initial_backoff_ms);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.endpoint.status(name).await {
                Ok(status) if status.is_ready() => {
                    info!(endpoint = name, attempts, "inference endpoint in service");
                    self.ready.write().insert(name.to_string());
                    return Ok(());
                }
                Ok(status) => debug!(endpoint = name, status = %status.status, "endpoint not ready"),
                Err(e) => warn!(endpoint = name, error = %e, "endpoint status check failed"),
            }

            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(VisionError::EndpointUnavailable {
                    endpoint: name.to_string(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }

            let sleep_for = (delay + jitter(readiness)).min(deadline - elapsed);
            tokio::time::sleep(sleep_for).await;
            delay = next_delay(delay, readiness);
        }
    }

    pub async fn detect_and_segment(&self, image: &CroppedImage) -> Result<DetectionResponse, VisionError> {
        let name = &self.config.segmentation_endpoint;
        self.wait_until_ready(name).await?;
        let started = Instant::now();
        let response = self.endpoint.detect_and_segment(name, image).await?;
        debug!(
            endpoint = %name,
            detections = response.detections.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "detect+segment finished"
        );
        Ok(response)
    }

    pub async fn classify(&self, batch: &[CroppedImage]) -> Result<Vec<ClassificationResponse>, VisionError> {
        let name = &self.config.classification_endpoint;
        self.wait_until_ready(name).await?;
        let started = Instant::now();
        let responses = self.endpoint.classify(name, batch).await?;
        if responses.len() != batch.len() {
            return Err(VisionError::InvalidResponse(format!(
                "expected {} classification results, got {}",
                batch.len(),
                responses.len()
            )));
        }
        debug!(
            endpoint = %name,
            crops = batch.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "classify finished"
        );
        Ok(responses)
    }
}

fn jitter(readiness: &ReadinessConfig) -> Duration {
    if readiness.jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=readiness.jitter_ms))
}

fn next_delay(current: Duration, readiness: &ReadinessConfig) -> Duration {
    let next = current.as_millis() as f64 * readiness.multiplier;
    Duration::from_millis((next as u64).min(readiness.max_backoff_ms))
}
