//! Identifier and item type primitives.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an entity inside one atlas.
///
/// Unique per (`ItemType`, atlas) only: two atlases may use the same value
/// for unrelated entities.
pub type Identifier = i64;

/// Which of the six entity variants a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ItemType {
    /// Intersection or shape end.
    Node,
    /// Directed road segment between two nodes.
    Edge,
    /// Closed polygon.
    Area,
    /// Open poly-line without topology.
    Line,
    /// Single location.
    Point,
    /// Ordered group of other entities.
    Relation,
}

impl ItemType {
    /// All item types, in storage order.
    pub const ALL: [ItemType; 6] = [
        ItemType::Node,
        ItemType::Edge,
        ItemType::Area,
        ItemType::Line,
        ItemType::Point,
        ItemType::Relation,
    ];

    /// Parse item type from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "node" => Some(Self::Node),
            "edge" => Some(Self::Edge),
            "area" => Some(Self::Area),
            "line" => Some(Self::Line),
            "point" => Some(Self::Point),
            "relation" => Some(Self::Relation),
            _ => None,
        }
    }

    /// Lowercase name, as used by the text format.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Edge => "edge",
            Self::Area => "area",
            Self::Line => "line",
            Self::Point => "point",
            Self::Relation => "relation",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
