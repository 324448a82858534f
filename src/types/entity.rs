//! The six atlas entity variants.
//!
//! Entities are plain values. Cross-entity relationships are identifiers
//! resolved through the owning atlas, never references.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::geometry::{Location, PolyLine, Polygon, Rectangle};
use super::identifier::{Identifier, ItemType};
use super::Tags;

/// Intersection or shape end, with derived edge sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier.
    pub identifier: Identifier,
    /// Node location.
    pub location: Location,
    /// Tags.
    pub tags: Tags,
    /// Edges ending at this node.
    pub in_edges: BTreeSet<Identifier>,
    /// Edges starting at this node.
    pub out_edges: BTreeSet<Identifier>,
}

impl Node {
    /// Create a node without topology.
    pub fn new(identifier: Identifier, location: Location, tags: Tags) -> Self {
        Self {
            identifier,
            location,
            tags,
            in_edges: BTreeSet::new(),
            out_edges: BTreeSet::new(),
        }
    }

    /// All incident edges, in and out.
    pub fn connected_edges(&self) -> BTreeSet<Identifier> {
        self.in_edges.union(&self.out_edges).copied().collect()
    }
}

/// Directed road segment.
///
/// A two-way road is two edges with swapped endpoints; the reverse of edge
/// `id` is the edge `-id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge identifier.
    pub identifier: Identifier,
    /// Shape, from start node to end node.
    pub polyline: PolyLine,
    /// Tags.
    pub tags: Tags,
    /// Start node identifier.
    pub start_node: Identifier,
    /// End node identifier.
    pub end_node: Identifier,
}

impl Edge {
    /// Create an edge.
    pub fn new(
        identifier: Identifier,
        polyline: PolyLine,
        tags: Tags,
        start_node: Identifier,
        end_node: Identifier,
    ) -> Self {
        Self {
            identifier,
            polyline,
            tags,
            start_node,
            end_node,
        }
    }

    /// Identifier the reverse edge would carry; `None` for identifiers
    /// without a negation (`0` and `Identifier::MIN`).
    pub fn reverse_identifier(&self) -> Option<Identifier> {
        self.identifier.checked_neg().filter(|&id| id != 0)
    }

    /// Whether this is the canonical direction of its road.
    pub fn is_main_edge(&self) -> bool {
        self.identifier > 0
    }
}

/// Closed polygon feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    /// Area identifier.
    pub identifier: Identifier,
    /// Outer ring.
    pub polygon: Polygon,
    /// Tags.
    pub tags: Tags,
}

/// Open poly-line feature without topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    /// Line identifier.
    pub identifier: Identifier,
    /// Shape.
    pub polyline: PolyLine,
    /// Tags.
    pub tags: Tags,
}

/// Single-location feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    /// Point identifier.
    pub identifier: Identifier,
    /// Location.
    pub location: Location,
    /// Tags.
    pub tags: Tags,
}

/// One member of a relation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationMember {
    /// Member variant.
    pub item_type: ItemType,
    /// Member identifier.
    pub identifier: Identifier,
    /// Role of the member inside the relation.
    pub role: String,
}

impl RelationMember {
    /// Create a member.
    pub fn new(item_type: ItemType, identifier: Identifier, role: impl Into<String>) -> Self {
        Self {
            item_type,
            identifier,
            role: role.into(),
        }
    }
}

/// Ordered group of entities; members may be relations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Relation identifier.
    pub identifier: Identifier,
    /// Tags.
    pub tags: Tags,
    /// Ordered members.
    pub members: Vec<RelationMember>,
}

/// Closed union over the six entity variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtlasEntity {
    /// A node.
    Node(Node),
    /// An edge.
    Edge(Edge),
    /// An area.
    Area(Area),
    /// A line.
    Line(Line),
    /// A point.
    Point(Point),
    /// A relation.
    Relation(Relation),
}

impl AtlasEntity {
    /// Variant of this entity.
    pub fn item_type(&self) -> ItemType {
        match self {
            Self::Node(_) => ItemType::Node,
            Self::Edge(_) => ItemType::Edge,
            Self::Area(_) => ItemType::Area,
            Self::Line(_) => ItemType::Line,
            Self::Point(_) => ItemType::Point,
            Self::Relation(_) => ItemType::Relation,
        }
    }

    /// Identifier of this entity.
    pub fn identifier(&self) -> Identifier {
        match self {
            Self::Node(n) => n.identifier,
            Self::Edge(e) => e.identifier,
            Self::Area(a) => a.identifier,
            Self::Line(l) => l.identifier,
            Self::Point(p) => p.identifier,
            Self::Relation(r) => r.identifier,
        }
    }

    /// Tags of this entity.
    pub fn tags(&self) -> &Tags {
        match self {
            Self::Node(n) => &n.tags,
            Self::Edge(e) => &e.tags,
            Self::Area(a) => &a.tags,
            Self::Line(l) => &l.tags,
            Self::Point(p) => &p.tags,
            Self::Relation(r) => &r.tags,
        }
    }

    /// Value of one tag.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags().get(key).map(String::as_str)
    }

    /// Bounds from the entity's own geometry.
    ///
    /// Relations have no geometry of their own; use
    /// [`Atlas::relation_bounds`](crate::atlas::Atlas::relation_bounds).
    pub fn geometry_bounds(&self) -> Option<Rectangle> {
        match self {
            Self::Node(n) => Some(n.location.bounds()),
            Self::Edge(e) => e.polyline.bounds(),
            Self::Area(a) => a.polygon.bounds(),
            Self::Line(l) => l.polyline.bounds(),
            Self::Point(p) => Some(p.location.bounds()),
            Self::Relation(_) => None,
        }
    }
}

impl From<Node> for AtlasEntity {
    fn from(value: Node) -> Self {
        Self::Node(value)
    }
}

impl From<Edge> for AtlasEntity {
    fn from(value: Edge) -> Self {
        Self::Edge(value)
    }
}

impl From<Area> for AtlasEntity {
    fn from(value: Area) -> Self {
        Self::Area(value)
    }
}

impl From<Line> for AtlasEntity {
    fn from(value: Line) -> Self {
        Self::Line(value)
    }
}

impl From<Point> for AtlasEntity {
    fn from(value: Point) -> Self {
        Self::Point(value)
    }
}

impl From<Relation> for AtlasEntity {
    fn from(value: Relation) -> Self {
        Self::Relation(value)
    }
}
