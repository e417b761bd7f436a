//! Reconciliation of partial item lists for one image.
//!
//! Items are identified structurally by the canonical serialization of their
//! non-attribute fields. Items sharing a key are collapsed into one whose
//! attributes are the union of all inputs. The result is ordered by key, so
//! merging is commutative and idempotent as long as callers compare
//! attribute lists as sets (which [`MergedItem`]'s equality does).

use dripdrop_core::{ClassifiedItem, ItemBase, MergedItem, Result};
use std::collections::BTreeMap;

/// Anything carrying an item base and an attribute list
pub trait Attributed {
    fn base(&self) -> &ItemBase;
    fn attributes(&self) -> &[String];
}

impl Attributed for ClassifiedItem {
    fn base(&self) -> &ItemBase {
        &self.base
    }

    fn attributes(&self) -> &[String] {
        &self.attributes
    }
}

impl Attributed for MergedItem {
    fn base(&self) -> &ItemBase {
        &self.base
    }

    fn attributes(&self) -> &[String] {
        &self.attributes
    }
}

/// Accumulates items; inputs are only read, never mutated
#[derive(Debug, Default)]
pub struct ItemSet {
    items: BTreeMap<String, MergedItem>,
}

impl ItemSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from an already-merged list
    pub fn from_merged(items: &[MergedItem]) -> Result<Self> {
        let mut set = Self::new();
        set.extend(items)?;
        Ok(set)
    }

    pub fn insert<T: Attributed>(&mut self, item: &T) -> Result<()> {
        let key = item.base().merge_key()?;
        self.items
            .entry(key)
            .or_insert_with(|| MergedItem::new(item.base().clone()))
            .union_attributes(item.attributes());
        Ok(())
    }

    pub fn extend<'a, T: Attributed + 'a, I: IntoIterator<Item = &'a T>>(&mut self, items: I) -> Result<()> {
        for item in items {
            self.insert(item)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in canonical key order
    pub fn into_items(self) -> Vec<MergedItem> {
        self.items.into_values().collect()
    }
}

/// Merge an incoming partial into an accumulated list
pub fn merge_into<T: Attributed>(accumulated: &[MergedItem], incoming: &[T]) -> Result<Vec<MergedItem>> {
    let mut set = ItemSet::from_merged(accumulated)?;
    set.extend(incoming)?;
    Ok(set.into_items())
}

/// Merge any number of partial lists
pub fn merge_partials(partials: &[&[ClassifiedItem]]) -> Result<Vec<MergedItem>> {
    let mut set = ItemSet::new();
    for partial in partials {
        set.extend(partial.iter())?;
    }
    Ok(set.into_items())
}
