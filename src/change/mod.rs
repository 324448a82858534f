//! Changes: deltas against an atlas, their merging, and overlay views.
//!
//! ## Architecture
//!
//! ```text
//! FeatureChange ─┐
//!                ├→ ChangeBuilder ──(merge duplicates)──→ Change
//! AtlasDiff ─────┘                                          │
//!                                  base Atlas + Change → ChangeAtlas
//! ```
//!
//! A [`Change`] holds at most one [`FeatureChange`] per `(type, identifier)`.
//! Contributions to the same entity are combined by the
//! [`FeatureChangeMerger`] when they are added.

pub mod atlas;
pub mod diff;
pub mod feature_change;
pub mod merge;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::atlas::packed::IntegrityError;
use crate::canonical::canonical_hash_hex;
use crate::types::{Identifier, ItemType};

pub use atlas::ChangeAtlas;
pub use diff::AtlasDiff;
pub use feature_change::{ChangeType, FeatureChange};
pub use merge::{merge_all, FeatureChangeMerger, MergeError, MergeFailureType};

/// Default name given to changes built without one.
pub const DEFAULT_CHANGE_NAME: &str = "change";

/// Failures while producing or applying a change.
#[derive(Debug, thiserror::Error)]
pub enum ChangeError {
    /// A change must contain at least one feature change.
    #[error("Change {0} is empty")]
    Empty(String),

    /// Two contributions to the same entity could not be merged.
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// Change document is not valid JSON.
    #[error("Invalid change document: {0}")]
    Json(#[from] serde_json::Error),

    /// Change does not compose with its base atlas.
    #[error("Change cannot be applied: {0}")]
    InvalidOverlay(#[from] IntegrityError),
}

/// Serialized shape of a [`Change`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDocument {
    /// Change name.
    pub name: String,
    /// Feature changes, ascending by `(type, identifier)`.
    pub feature_changes: Vec<FeatureChange>,
}

/// Immutable, non-empty set of feature changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    name: String,
    changes: BTreeMap<(ItemType, Identifier), FeatureChange>,
}

impl Change {
    /// Name of the change.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Feature change targeting one entity.
    pub fn get(&self, item_type: ItemType, identifier: Identifier) -> Option<&FeatureChange> {
        self.changes.get(&(item_type, identifier))
    }

    /// Iterate feature changes, ascending by `(type, identifier)`.
    pub fn iter(&self) -> impl Iterator<Item = &FeatureChange> {
        self.changes.values()
    }

    /// Iterate feature changes of one type.
    pub fn of_type(&self, item_type: ItemType) -> impl Iterator<Item = &FeatureChange> {
        self.changes
            .range((item_type, Identifier::MIN)..=(item_type, Identifier::MAX))
            .map(|(_, change)| change)
    }

    /// Number of feature changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Always false for a built change.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Combine with another change, merging contributions to the same entity.
    pub fn merge(&self, other: &Change) -> Result<Change, ChangeError> {
        let mut builder = ChangeBuilder::new().with_name(self.name.clone());
        for change in self.iter().chain(other.iter()) {
            builder.add(change.clone())?;
        }
        builder.build()
    }

    /// Serializable form.
    pub fn to_document(&self) -> ChangeDocument {
        ChangeDocument {
            name: self.name.clone(),
            feature_changes: self.changes.values().cloned().collect(),
        }
    }

    /// Rebuild from a document, merging duplicate targets.
    pub fn from_document(document: ChangeDocument) -> Result<Change, ChangeError> {
        let mut builder = ChangeBuilder::new().with_name(document.name);
        for change in document.feature_changes {
            builder.add(change)?;
        }
        builder.build()
    }

    /// Serialize to a JSON document.
    pub fn to_json(&self) -> Result<String, ChangeError> {
        Ok(serde_json::to_string_pretty(&self.to_document())?)
    }

    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Change, ChangeError> {
        let document: ChangeDocument = serde_json::from_str(json)?;
        Self::from_document(document)
    }

    /// Stable fingerprint of the change contents.
    pub fn fingerprint(&self) -> Result<String, ChangeError> {
        Ok(canonical_hash_hex(&self.to_document())?)
    }
}

impl<'a> IntoIterator for &'a Change {
    type Item = &'a FeatureChange;
    type IntoIter = std::collections::btree_map::Values<'a, (ItemType, Identifier), FeatureChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.values()
    }
}

/// Accumulates feature changes into a [`Change`].
#[derive(Debug, Clone)]
pub struct ChangeBuilder {
    name: String,
    merger: FeatureChangeMerger,
    changes: BTreeMap<(ItemType, Identifier), FeatureChange>,
}

impl Default for ChangeBuilder {
    fn default() -> Self {
        Self {
            name: DEFAULT_CHANGE_NAME.to_string(),
            merger: FeatureChangeMerger::new(),
            changes: BTreeMap::new(),
        }
    }
}

impl ChangeBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the change name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a feature change, merging it with any earlier one on the same
    /// entity. The builder is unchanged when the merge fails.
    pub fn add(&mut self, change: FeatureChange) -> Result<&mut Self, ChangeError> {
        let key = change.key();
        let combined = match self.changes.get(&key) {
            Some(existing) => self.merger.merge(existing, &change)?,
            None => change,
        };
        self.changes.insert(key, combined);
        Ok(self)
    }

    /// Add several feature changes.
    pub fn add_all(&mut self, changes: impl IntoIterator<Item = FeatureChange>) -> Result<&mut Self, ChangeError> {
        for change in changes {
            self.add(change)?;
        }
        Ok(self)
    }

    /// Number of distinct targets so far.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether nothing was added yet.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Freeze into a change.
    pub fn build(self) -> Result<Change, ChangeError> {
        if self.changes.is_empty() {
            return Err(ChangeError::Empty(self.name));
        }
        tracing::debug!(name = %self.name, feature_changes = self.changes.len(), "Change built");
        Ok(Change {
            name: self.name,
            changes: self.changes,
        })
    }
}
