//! Per-stage views of one detected clothing region
//!
//! Segmentation produces [`DetectedItem`]s (which still carry the cropped
//! raster), Classification turns them into [`ClassifiedItem`]s (raster gone,
//! attributes added) and Merge reconciles those into [`MergedItem`]s. The
//! three are distinct types so the crop cannot leak past Classification.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use crate::types::ImageId;
use crate::{Error, Result};

/// Box corners. Pipeline boxes are normalized to [0, 1] against the model's
/// working resolution, not the original upload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BoundingBox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self { xmin, ymin, xmax, ymax }
    }

    /// True when the box has no area (NaN corners count as degenerate)
    pub fn is_degenerate(&self) -> bool {
        !(self.xmax > self.xmin && self.ymax > self.ymin)
    }

    /// Midpoint of the box, used as the item's coordinate row
    pub fn center(&self) -> (f32, f32) {
        ((self.xmin + self.xmax) / 2.0, (self.ymin + self.ymax) / 2.0)
    }

    /// Divide pixel coordinates by the frame size, clamping into [0, 1]
    pub fn normalized(&self, width: u32, height: u32) -> Self {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        Self {
            xmin: (self.xmin / w).clamp(0.0, 1.0),
            ymin: (self.ymin / h).clamp(0.0, 1.0),
            xmax: (self.xmax / w).clamp(0.0, 1.0),
            ymax: (self.ymax / h).clamp(0.0, 1.0),
        }
    }

    /// Scale a normalized box back to pixel space of a frame
    pub fn scaled(&self, width: u32, height: u32) -> Self {
        let w = width as f32;
        let h = height as f32;
        Self {
            xmin: self.xmin * w,
            ymin: self.ymin * h,
            xmax: self.xmax * w,
            ymax: self.ymax * h,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    pub fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

/// Non-attribute fields of an item. Two items with equal bases are the same
/// physical region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemBase {
    pub item: String,
    pub confidence: f32,
    pub color: Rgb,
    pub coordinates: BoundingBox,
}

impl ItemBase {
    /// Canonical serialization used as the structural identity during merge
    pub fn merge_key(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// PNG-encoded crop, carried as base64 on the wire
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CroppedImage {
    pub width: u32,
    pub height: u32,
    #[serde(serialize_with = "encode_base64", deserialize_with = "decode_base64")]
    pub png: Vec<u8>,
}

impl fmt::Debug for CroppedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CroppedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("png_bytes", &self.png.len())
            .finish()
    }
}

fn encode_base64<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn decode_base64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
}

/// Segmentation output for one region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedItem {
    #[serde(flatten)]
    pub base: ItemBase,
    pub cropped_image: CroppedImage,
}

impl DetectedItem {
    /// Drop the raster and attach attributes. Consumes the item so the crop
    /// cannot be forwarded.
    pub fn into_classified(self, attributes: Vec<String>) -> ClassifiedItem {
        ClassifiedItem { base: self.base, attributes }
    }
}

/// Classification output for one region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedItem {
    #[serde(flatten)]
    pub base: ItemBase,
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// Reconciled item. Attributes keep first-seen order; equality treats them as a set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedItem {
    #[serde(flatten)]
    pub base: ItemBase,
    #[serde(default)]
    pub attributes: Vec<String>,
}

impl MergedItem {
    pub fn new(base: ItemBase) -> Self {
        Self { base, attributes: Vec::new() }
    }

    /// Add attributes not already present (case-sensitive). Returns how many were added.
    pub fn union_attributes<'a, I>(&mut self, attributes: I) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut added = 0;
        for attribute in attributes {
            if !self.attributes.iter().any(|a| a == attribute) {
                self.attributes.push(attribute.clone());
                added += 1;
            }
        }
        added
    }

    fn attribute_set(&self) -> BTreeSet<&str> {
        self.attributes.iter().map(String::as_str).collect()
    }
}

impl PartialEq for MergedItem {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.attribute_set() == other.attribute_set()
    }
}

/// Stable per-item idempotency key: image id + box + category, hashed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemFingerprint(String);

impl ItemFingerprint {
    pub fn compute(image_id: ImageId, base: &ItemBase) -> Self {
        let b = &base.coordinates;
        let mut hasher = Sha256::new();
        hasher.update(image_id.0.to_le_bytes());
        for corner in [b.xmin, b.ymin, b.xmax, b.ymax] {
            // Six decimals absorbs float noise from re-serialization
            hasher.update(format!("{:.6}|", corner).as_bytes());
        }
        hasher.update(base.item.to_lowercase().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(item: &str) -> ItemBase {
        ItemBase {
            item: item.to_string(),
            confidence: 0.87,
            color: Rgb::new(10, 20, 30),
            coordinates: BoundingBox::new(0.1, 0.2, 0.5, 0.9),
        }
    }

    #[test]
    fn test_bounding_box_degenerate() {
        assert!(!BoundingBox::new(0.0, 0.0, 1.0, 1.0).is_degenerate());
        assert!(BoundingBox::new(0.5, 0.0, 0.5, 1.0).is_degenerate());
        assert!(BoundingBox::new(0.0, 0.6, 1.0, 0.2).is_degenerate());
        assert!(BoundingBox::new(f32::NAN, 0.0, 1.0, 1.0).is_degenerate());
    }

    #[test]
    fn test_bounding_box_center_and_normalize() {
        let b = BoundingBox::new(64.0, 128.0, 192.0, 384.0);
        assert_eq!(b.center(), (128.0, 256.0));

        let n = b.normalized(640, 640);
        assert!((n.xmin - 0.1).abs() < 1e-6);
        assert!((n.ymax - 0.6).abs() < 1e-6);

        let back = n.scaled(640, 640);
        assert!((back.xmax - 192.0).abs() < 1e-3);
    }

    #[test]
    fn test_normalize_clamps() {
        let b = BoundingBox::new(-10.0, -5.0, 700.0, 650.0).normalized(640, 640);
        assert_eq!(b, BoundingBox::new(0.0, 0.0, 1.0, 1.0));
    }

    #[test]
    fn test_merge_key_ignores_attributes() {
        let a = ClassifiedItem { base: base("skirt"), attributes: vec!["red".to_string()] };
        let b = ClassifiedItem { base: base("skirt"), attributes: vec!["cotton".to_string()] };
        assert_eq!(a.base.merge_key().unwrap(), b.base.merge_key().unwrap());
        assert_ne!(a.base.merge_key().unwrap(), base("dress").merge_key().unwrap());
    }

    #[test]
    fn test_merged_item_union_and_equality() {
        let mut left = MergedItem::new(base("coat"));
        let added = left.union_attributes(&["wool".to_string(), "Wool".to_string(), "wool".to_string()]);
        assert_eq!(added, 2);
        assert_eq!(left.attributes, vec!["wool", "Wool"]);

        let mut right = MergedItem::new(base("coat"));
        right.union_attributes(&["Wool".to_string(), "wool".to_string()]);
        assert_eq!(left, right);
    }

    #[test]
    fn test_detected_item_wire_shape() {
        let item = DetectedItem {
            base: base("shirt"),
            cropped_image: CroppedImage { width: 1, height: 1, png: vec![1, 2, 3] },
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["item"], "shirt");
        assert_eq!(json["color"]["green"], 20);
        assert!(json["coordinates"]["xmax"].is_number());
        assert_eq!(json["cropped_image"]["png"], "AQID");

        let back: DetectedItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_classified_item_drops_raster() {
        let item = DetectedItem {
            base: base("shirt"),
            cropped_image: CroppedImage { width: 1, height: 1, png: vec![0] },
        };
        let classified = item.into_classified(vec!["denim".to_string()]);
        let json = serde_json::to_value(&classified).unwrap();
        assert!(json.get("cropped_image").is_none());
        assert_eq!(json["attributes"][0], "denim");
    }

    #[test]
    fn test_fingerprint_stable_and_distinct() {
        let a = ItemFingerprint::compute(ImageId(1), &base("skirt"));
        let b = ItemFingerprint::compute(ImageId(1), &base("skirt"));
        let c = ItemFingerprint::compute(ImageId(2), &base("skirt"));
        let d = ItemFingerprint::compute(ImageId(1), &base("dress"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.as_str().len(), 64);
    }
}
