//! Remote model-serving boundary

use async_trait::async_trait;
use dripdrop_core::CroppedImage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::error::{is_overload_status, VisionError};

/// Status string the control plane reports for a serving endpoint
pub const IN_SERVICE: &str = "InService";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub status: String,
}

impl EndpointStatus {
    pub fn in_service() -> Self {
        Self { status: IN_SERVICE.to_string() }
    }

    pub fn is_ready(&self) -> bool {
        self.status == IN_SERVICE
    }
}

/// Per-pixel instance probabilities over the frame sent for detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMask {
    pub width: u32,
    pub height: u32,
    /// Row-major, `width * height` values
    pub data: Vec<f32>,
}

impl RawMask {
    /// Nearest sample at frame position (x, y) of a `frame_w` x `frame_h` frame
    pub fn sample(&self, x: u32, y: u32, frame_w: u32, frame_h: u32) -> f32 {
        if self.width == 0 || self.height == 0 || frame_w == 0 || frame_h == 0 {
            return 0.0;
        }
        let mx = ((x as u64 * self.width as u64) / frame_w as u64).min(self.width as u64 - 1);
        let my = ((y as u64 * self.height as u64) / frame_h as u64).min(self.height as u64 - 1);
        self.data
            .get((my * self.width as u64 + mx) as usize)
            .copied()
            .unwrap_or(0.0)
    }
}

/// One box from the detect+segment model, in pixels of the frame it was given
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub xyxy: [f32; 4],
    pub confidence: f32,
    pub class_id: u32,
    #[serde(default)]
    pub mask: Option<RawMask>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub detections: Vec<RawDetection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub class_id: u32,
    pub confidence: f32,
}

/// Attribute predictions for one crop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResponse {
    pub predictions: Vec<Prediction>,
}

#[async_trait]
pub trait InferenceEndpoint: Send + Sync {
    /// Control-plane status of the named endpoint
    async fn status(&self, endpoint: &str) -> Result<EndpointStatus, VisionError>;

    async fn detect_and_segment(
        &self,
        endpoint: &str,
        image: &CroppedImage,
    ) -> Result<DetectionResponse, VisionError>;

    /// One response per input crop, in input order
    async fn classify(
        &self,
        endpoint: &str,
        batch: &[CroppedImage],
    ) -> Result<Vec<ClassificationResponse>, VisionError>;
}

/// JSON-over-HTTP serving endpoint.
///
/// Control plane: `GET {control_url}/endpoints/{name}` returning `{"status": ..}`.
/// Runtime: `POST {runtime_url}/endpoints/{name}/invocations`.
pub struct HttpInferenceEndpoint {
    client: Client,
    control_url: String,
    runtime_url: String,
    timeout: Duration,
}

impl HttpInferenceEndpoint {
    pub fn new(control_url: impl Into<String>, runtime_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            control_url: control_url.into().trim_end_matches('/').to_string(),
            runtime_url: runtime_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn validate_name(endpoint: &str) -> Result<(), VisionError> {
        if endpoint.is_empty() || endpoint.len() > 255 {
            return Err(VisionError::Config("Invalid endpoint name".to_string()));
        }
        if !endpoint.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(VisionError::Config(format!(
                "Endpoint name contains invalid characters: '{}'",
                endpoint
            )));
        }
        Ok(())
    }

    async fn invoke<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T, VisionError> {
        Self::validate_name(endpoint)?;
        let url = format!("{}/endpoints/{}/invocations", self.runtime_url, endpoint);
        debug!(endpoint, "invoking inference endpoint");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if is_overload_status(status.as_u16()) {
            return Err(VisionError::Overloaded { endpoint: endpoint.to_string(), status: status.as_u16() });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text: String = text.chars().take(500).collect();
            return Err(VisionError::InvalidResponse(format!("HTTP {}: {}", status, text)));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| VisionError::InvalidResponse(format!("Malformed inference response: {}", e)))
    }
}

#[async_trait]
impl InferenceEndpoint for HttpInferenceEndpoint {
    async fn status(&self, endpoint: &str) -> Result<EndpointStatus, VisionError> {
        Self::validate_name(endpoint)?;
        let url = format!("{}/endpoints/{}", self.control_url, endpoint);
        let response = self.client.get(&url).timeout(self.timeout).send().await?;

        let status = response.status();
        if status == 404 {
            return Ok(EndpointStatus { status: "NotFound".to_string() });
        }
        if !status.is_success() {
            return Err(VisionError::InvalidResponse(format!("HTTP {} from control plane", status)));
        }
        response
            .json::<EndpointStatus>()
            .await
            .map_err(|e| VisionError::InvalidResponse(format!("Malformed status response: {}", e)))
    }

    async fn detect_and_segment(
        &self,
        endpoint: &str,
        image: &CroppedImage,
    ) -> Result<DetectionResponse, VisionError> {
        self.invoke(endpoint, json!({ "image": image })).await
    }

    async fn classify(
        &self,
        endpoint: &str,
        batch: &[CroppedImage],
    ) -> Result<Vec<ClassificationResponse>, VisionError> {
        #[derive(Deserialize)]
        struct Batch {
            results: Vec<ClassificationResponse>,
        }
        let batch: Batch = self.invoke(endpoint, json!({ "images": batch })).await?;
        Ok(batch.results)
    }
}
