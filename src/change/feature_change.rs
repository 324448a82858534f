//! One delta against one entity.

use serde::{Deserialize, Serialize};

use super::merge::{FeatureChangeMerger, MergeError};
use crate::atlas::Atlas;
use crate::types::{CompleteEntity, Identifier, ItemType};

/// Whether a feature change creates/updates or deletes its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// Create the entity, or overwrite the specified fields.
    Add,
    /// Delete the entity.
    Remove,
}

impl ChangeType {
    /// Parse change type from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ADD" => Some(Self::Add),
            "REMOVE" => Some(Self::Remove),
            _ => None,
        }
    }
}

/// A delta on one entity.
///
/// The after view holds the desired values of the fields the change cares
/// about; unspecified fields fall back to the base atlas. The optional
/// before view holds what the base had for those same fields and drives
/// three-way merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureChange {
    /// Add or remove.
    pub change_type: ChangeType,
    /// Desired state of the specified fields.
    pub after_view: CompleteEntity,
    /// Base state of the same fields, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_view: Option<CompleteEntity>,
}

impl FeatureChange {
    /// Create or update an entity.
    pub fn add(entity: impl Into<CompleteEntity>) -> Self {
        Self {
            change_type: ChangeType::Add,
            after_view: entity.into(),
            before_view: None,
        }
    }

    /// Delete an entity. Only type and identifier of `entity` matter.
    pub fn remove(entity: impl Into<CompleteEntity>) -> Self {
        Self {
            change_type: ChangeType::Remove,
            after_view: entity.into(),
            before_view: None,
        }
    }

    /// Delete an entity by identifier.
    pub fn remove_identifier(item_type: ItemType, identifier: Identifier) -> Self {
        Self::remove(CompleteEntity::shallow(item_type, identifier))
    }

    /// Attach an explicit before view.
    pub fn with_before_view(mut self, before: impl Into<CompleteEntity>) -> Self {
        self.before_view = Some(before.into());
        self
    }

    /// Derive the before view from `atlas`.
    ///
    /// An addition records the base values of exactly the fields it
    /// specifies; a removal records the whole base entity. Nothing is
    /// recorded when the atlas lacks the entity.
    pub fn with_atlas_context(mut self, atlas: &dyn Atlas) -> Self {
        let Some(base) = atlas.entity(self.item_type(), self.identifier()) else {
            return self;
        };
        self.before_view = match self.change_type {
            ChangeType::Add => self.after_view.restricted_view_of(&base),
            ChangeType::Remove => Some(CompleteEntity::from(base)),
        };
        self
    }

    /// Variant of the target entity.
    pub fn item_type(&self) -> ItemType {
        self.after_view.item_type()
    }

    /// Identifier of the target entity.
    pub fn identifier(&self) -> Identifier {
        self.after_view.identifier()
    }

    /// `(item_type, identifier)` of the target entity.
    pub fn key(&self) -> (ItemType, Identifier) {
        (self.item_type(), self.identifier())
    }

    /// Whether this change deletes its entity.
    pub fn is_remove(&self) -> bool {
        self.change_type == ChangeType::Remove
    }

    /// Merge with another change on the same entity.
    pub fn merge(&self, other: &FeatureChange) -> Result<FeatureChange, MergeError> {
        FeatureChangeMerger::new().merge(self, other)
    }
}
