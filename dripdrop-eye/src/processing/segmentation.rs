//! Detect + segment an uploaded image into clothing item regions

use dripdrop_core::config::SegmentationConfig;
use dripdrop_core::{BoundingBox, DetectedItem, ItemBase};
use image::RgbImage;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::client::InferenceClient;
use crate::endpoint::RawDetection;
use crate::error::VisionError;
use crate::imaging::{self, PixelRect};
use crate::labels::LabelTable;

pub struct Segmenter {
    client: Arc<InferenceClient>,
    categories: Arc<LabelTable>,
    config: SegmentationConfig,
}

impl Segmenter {
    pub fn new(client: Arc<InferenceClient>, categories: Arc<LabelTable>, config: SegmentationConfig) -> Self {
        Self { client, categories, config }
    }

    /// Decode, resize to the working resolution, run detect+segment and
    /// extract one [`DetectedItem`] per usable detection. Boxes come back
    /// normalized against the resized frame.
    pub async fn segment(&self, image_bytes: &[u8]) -> Result<Vec<DetectedItem>, VisionError> {
        let original = imaging::decode(image_bytes)?;
        let frame = imaging::resize_to(&original, self.config.working_width, self.config.working_height)?;
        debug!(
            original_width = original.width(),
            original_height = original.height(),
            "running instance segmentation on frame"
        );

        let encoded = imaging::encode_png(&frame)?;
        let response = self.client.detect_and_segment(&encoded).await?;

        let mut items = Vec::with_capacity(response.detections.len());
        for (index, detection) in response.detections.iter().enumerate() {
            match self.extract(&frame, detection) {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(e) => warn!(index, error = %e, "skipping detection"),
            }
        }

        debug!(
            detections = response.detections.len(),
            kept = items.len(),
            "segmentation finished"
        );
        Ok(items)
    }

    fn extract(&self, frame: &RgbImage, detection: &RawDetection) -> Result<Option<DetectedItem>, VisionError> {
        let (frame_w, frame_h) = frame.dimensions();

        if !(detection.confidence >= self.config.confidence_floor) {
            debug!(confidence = detection.confidence, "below confidence floor");
            return Ok(None);
        }

        let [xmin, ymin, xmax, ymax] = detection.xyxy;
        let raw = BoundingBox::new(xmin, ymin, xmax, ymax);
        if raw.is_degenerate() {
            debug!(?raw, "degenerate box");
            return Ok(None);
        }

        let rect = PixelRect::from_box(&raw, frame_w, frame_h);
        if rect.is_empty() {
            debug!(?rect, "empty crop");
            return Ok(None);
        }

        let mut crop = imaging::crop(frame, rect);
        let foreground = detection.mask.as_ref().map(|mask| {
            imaging::apply_mask(&mut crop, mask, rect, frame_w, frame_h, self.config.mask_threshold)
        });

        if imaging::is_all_black(&crop) {
            debug!(?rect, "all-black crop");
            return Ok(None);
        }
        let Some(color) = imaging::mean_color(&crop, foreground.as_deref()) else {
            return Ok(None);
        };

        let coordinates = rect.normalized(frame_w, frame_h);
        if coordinates.is_degenerate() {
            return Ok(None);
        }

        Ok(Some(DetectedItem {
            base: ItemBase {
                item: self.categories.name(detection.class_id),
                confidence: round2(detection.confidence),
                color,
                coordinates,
            },
            cropped_image: imaging::encode_png(&crop)?,
        }))
    }
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}
