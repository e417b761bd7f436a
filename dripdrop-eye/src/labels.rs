//! Numeric class id to label tables

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::VisionError;

/// Fashionpedia apparel categories, indexed by class id
pub const FASHIONPEDIA_CATEGORIES: &[&str] = &[
    "shirt, blouse", "top, t-shirt, sweatshirt", "sweater", "cardigan", "jacket", "vest",
    "pants", "shorts", "skirt", "coat", "dress", "jumpsuit", "cape", "glasses", "hat",
    "headband, head covering, hair accessory", "tie", "glove", "watch", "belt", "leg warmer",
    "tights, stockings", "sock", "shoe", "bag, wallet", "scarf", "umbrella", "hood", "collar",
    "lapel", "epaulette", "sleeve", "pocket", "neckline", "buckle", "zipper", "applique",
    "bead", "bow", "flower", "fringe", "ribbon", "rivet", "ruffle", "sequin", "tassel",
];

/// Attribute vocabulary used when no attribute file is configured
pub const DEFAULT_ATTRIBUTES: &[&str] = &[
    "denim", "blue", "cotton", "striped", "red", "black", "white", "leather", "wool", "floral",
    "plaid", "silk", "knit", "polka dot", "green", "linen", "solid", "graphic", "sleeveless",
    "long sleeve", "short sleeve", "high waist", "oversized", "slim fit",
];

#[derive(Deserialize)]
struct LabelEntry {
    id: u32,
    name: String,
}

/// Id to name mapping. Unknown ids render as the id itself.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    names: HashMap<u32, String>,
}

impl LabelTable {
    pub fn from_names(names: &[&str]) -> Self {
        Self {
            names: names
                .iter()
                .enumerate()
                .map(|(id, name)| (id as u32, name.to_string()))
                .collect(),
        }
    }

    pub fn categories() -> Self {
        Self::from_names(FASHIONPEDIA_CATEGORIES)
    }

    pub fn attributes() -> Self {
        Self::from_names(DEFAULT_ATTRIBUTES)
    }

    /// Parse the `{"<section>": [{"id": .., "name": ..}, ..]}` layout
    pub fn from_json(content: &str, section: &str) -> Result<Self, VisionError> {
        let mut document: HashMap<String, serde_json::Value> = serde_json::from_str(content)
            .map_err(|e| VisionError::Config(format!("Invalid label file: {}", e)))?;
        let entries = document
            .remove(section)
            .ok_or_else(|| VisionError::Config(format!("Label file has no '{}' section", section)))?;
        let entries: Vec<LabelEntry> = serde_json::from_value(entries)
            .map_err(|e| VisionError::Config(format!("Invalid '{}' entries: {}", section, e)))?;

        Ok(Self {
            names: entries.into_iter().map(|e| (e.id, e.name)).collect(),
        })
    }

    pub fn load(path: &Path, section: &str) -> Result<Self, VisionError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content, section)
    }

    pub fn name(&self, id: u32) -> String {
        self.names.get(&id).cloned().unwrap_or_else(|| id.to_string())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
