//! Core types for the atlas entity model.

pub mod identifier;
pub mod geometry;
pub mod entity;
pub mod complete;

use std::collections::BTreeMap;

/// String tags of an entity. Ordered so that hashing and printing are stable.
pub type Tags = BTreeMap<String, String>;

pub use identifier::{Identifier, ItemType};
pub use geometry::{Location, PolyLine, Polygon, Rectangle, segments_intersect};
pub use entity::{Area, AtlasEntity, Edge, Line, Node, Point, Relation, RelationMember};
pub use complete::{
    CompleteArea, CompleteEdge, CompleteEntity, CompleteLine, CompleteNode, CompletePoint,
    CompleteRelation,
};
