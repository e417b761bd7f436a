//! Attribute classification of segmented crops

use dripdrop_core::config::ClassificationConfig;
use dripdrop_core::{ClassifiedItem, CroppedImage, DetectedItem};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::client::InferenceClient;
use crate::endpoint::Prediction;
use crate::error::VisionError;
use crate::imaging;
use crate::labels::LabelTable;

/// Result of classifying one batch
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub items: Vec<ClassifiedItem>,
    /// Items dropped because their crop could not be prepared
    pub failed_items: usize,
}

pub struct Classifier {
    client: Arc<InferenceClient>,
    attributes: Arc<LabelTable>,
    config: ClassificationConfig,
}

impl Classifier {
    pub fn new(client: Arc<InferenceClient>, attributes: Arc<LabelTable>, config: ClassificationConfig) -> Self {
        Self { client, attributes, config }
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Split detections into fixed-size batches, preserving order
    pub fn batches(&self, items: Vec<DetectedItem>) -> Vec<Vec<DetectedItem>> {
        let size = self.batch_size();
        let mut batches = Vec::with_capacity(items.len().div_ceil(size));
        let mut current = Vec::with_capacity(size);
        for item in items {
            current.push(item);
            if current.len() == size {
                batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    /// Classify one batch with a single inference call. An `Err` means the
    /// call itself failed and every item of the batch is lost.
    pub async fn classify_batch(&self, batch: Vec<DetectedItem>) -> Result<BatchOutcome, VisionError> {
        let mut prepared = Vec::with_capacity(batch.len());
        let mut inputs = Vec::with_capacity(batch.len());
        let mut failed_items = 0;

        for item in batch {
            match self.prepare(&item.cropped_image) {
                Ok(input) => {
                    inputs.push(input);
                    prepared.push(item);
                }
                Err(e) => {
                    warn!(item = %item.base.item, error = %e, "dropping item with unusable crop");
                    failed_items += 1;
                }
            }
        }

        if inputs.is_empty() {
            return Ok(BatchOutcome { items: Vec::new(), failed_items });
        }

        let responses = self.client.classify(&inputs).await?;
        let items: Vec<ClassifiedItem> = prepared
            .into_iter()
            .zip(responses)
            .map(|(item, response)| {
                let attributes = self.select(&response.predictions);
                debug!(item = %item.base.item, attributes = ?attributes, "classified item");
                item.into_classified(attributes)
            })
            .collect();

        Ok(BatchOutcome { items, failed_items })
    }

    fn prepare(&self, crop: &CroppedImage) -> Result<CroppedImage, VisionError> {
        let raster = imaging::decode_png(crop)?;
        let resized = imaging::resize_to(&raster, self.config.input_width, self.config.input_height)?;
        imaging::encode_png(&resized)
    }

    /// Top-k predictions at or above the confidence floor, mapped to names
    pub fn select(&self, predictions: &[Prediction]) -> Vec<String> {
        let mut ranked: Vec<&Prediction> = predictions.iter().filter(|p| p.confidence.is_finite()).collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut names: Vec<String> = Vec::new();
        for prediction in ranked.into_iter().take(self.config.top_k) {
            if prediction.confidence < self.config.confidence_floor {
                continue;
            }
            let name = self.attributes.name(prediction.class_id);
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}
