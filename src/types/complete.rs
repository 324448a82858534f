//! Complete (partial) entities used inside feature changes.
//!
//! Every field except the identifier is optional: `None` means "not part of
//! this delta", which is different from an explicitly empty value such as
//! `Some(Tags::new())`. These types never appear as members of a built atlas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::entity::{Area, AtlasEntity, Edge, Line, Node, Point, Relation, RelationMember};
use super::geometry::{Location, PolyLine, Polygon, Rectangle};
use super::identifier::{Identifier, ItemType};
use super::Tags;

fn pick<T: Clone>(delta: &Option<T>, base: Option<&T>) -> Option<T> {
    delta.clone().or_else(|| base.cloned())
}

fn restrict<T: Clone>(selector: &Option<T>, value: &T) -> Option<T> {
    selector.as_ref().map(|_| value.clone())
}

/// Partial node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteNode {
    /// Node identifier.
    pub identifier: Identifier,
    /// Location, if part of the delta.
    pub location: Option<Location>,
    /// Tags, if part of the delta.
    pub tags: Option<Tags>,
    /// Incoming edges, if part of the delta.
    pub in_edges: Option<BTreeSet<Identifier>>,
    /// Outgoing edges, if part of the delta.
    pub out_edges: Option<BTreeSet<Identifier>>,
}

impl CompleteNode {
    /// Node with nothing but an identifier.
    pub fn shallow(identifier: Identifier) -> Self {
        Self {
            identifier,
            location: None,
            tags: None,
            in_edges: None,
            out_edges: None,
        }
    }

    /// Set the location.
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Set the tags.
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Set the incoming edges.
    pub fn with_in_edges(mut self, edges: impl IntoIterator<Item = Identifier>) -> Self {
        self.in_edges = Some(edges.into_iter().collect());
        self
    }

    /// Set the outgoing edges.
    pub fn with_out_edges(mut self, edges: impl IntoIterator<Item = Identifier>) -> Self {
        self.out_edges = Some(edges.into_iter().collect());
        self
    }

    // Edge sets are derived by the owning view.
    fn is_full(&self) -> bool {
        self.location.is_some() && self.tags.is_some()
    }

    fn overlay(&self, base: Option<&Node>) -> Option<Node> {
        Some(Node {
            identifier: self.identifier,
            location: pick(&self.location, base.map(|b| &b.location))?,
            tags: pick(&self.tags, base.map(|b| &b.tags))?,
            in_edges: pick(&self.in_edges, base.map(|b| &b.in_edges)).unwrap_or_default(),
            out_edges: pick(&self.out_edges, base.map(|b| &b.out_edges)).unwrap_or_default(),
        })
    }

    fn restricted(&self, full: &Node) -> Self {
        Self {
            identifier: self.identifier,
            location: restrict(&self.location, &full.location),
            tags: restrict(&self.tags, &full.tags),
            in_edges: restrict(&self.in_edges, &full.in_edges),
            out_edges: restrict(&self.out_edges, &full.out_edges),
        }
    }
}

impl From<Node> for CompleteNode {
    fn from(node: Node) -> Self {
        Self {
            identifier: node.identifier,
            location: Some(node.location),
            tags: Some(node.tags),
            in_edges: Some(node.in_edges),
            out_edges: Some(node.out_edges),
        }
    }
}

/// Partial edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteEdge {
    /// Edge identifier.
    pub identifier: Identifier,
    /// Shape, if part of the delta.
    pub polyline: Option<PolyLine>,
    /// Tags, if part of the delta.
    pub tags: Option<Tags>,
    /// Start node, if part of the delta.
    pub start_node: Option<Identifier>,
    /// End node, if part of the delta.
    pub end_node: Option<Identifier>,
}

impl CompleteEdge {
    /// Edge with nothing but an identifier.
    pub fn shallow(identifier: Identifier) -> Self {
        Self {
            identifier,
            polyline: None,
            tags: None,
            start_node: None,
            end_node: None,
        }
    }

    /// Set the shape.
    pub fn with_polyline(mut self, polyline: PolyLine) -> Self {
        self.polyline = Some(polyline);
        self
    }

    /// Set the tags.
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Set both endpoints.
    pub fn with_nodes(mut self, start_node: Identifier, end_node: Identifier) -> Self {
        self.start_node = Some(start_node);
        self.end_node = Some(end_node);
        self
    }

    fn is_full(&self) -> bool {
        self.polyline.is_some() && self.tags.is_some() && self.start_node.is_some() && self.end_node.is_some()
    }

    fn overlay(&self, base: Option<&Edge>) -> Option<Edge> {
        Some(Edge {
            identifier: self.identifier,
            polyline: pick(&self.polyline, base.map(|b| &b.polyline))?,
            tags: pick(&self.tags, base.map(|b| &b.tags))?,
            start_node: pick(&self.start_node, base.map(|b| &b.start_node))?,
            end_node: pick(&self.end_node, base.map(|b| &b.end_node))?,
        })
    }

    fn restricted(&self, full: &Edge) -> Self {
        Self {
            identifier: self.identifier,
            polyline: restrict(&self.polyline, &full.polyline),
            tags: restrict(&self.tags, &full.tags),
            start_node: restrict(&self.start_node, &full.start_node),
            end_node: restrict(&self.end_node, &full.end_node),
        }
    }
}

impl From<Edge> for CompleteEdge {
    fn from(edge: Edge) -> Self {
        Self {
            identifier: edge.identifier,
            polyline: Some(edge.polyline),
            tags: Some(edge.tags),
            start_node: Some(edge.start_node),
            end_node: Some(edge.end_node),
        }
    }
}

/// Partial area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteArea {
    /// Area identifier.
    pub identifier: Identifier,
    /// Ring, if part of the delta.
    pub polygon: Option<Polygon>,
    /// Tags, if part of the delta.
    pub tags: Option<Tags>,
}

impl CompleteArea {
    /// Area with nothing but an identifier.
    pub fn shallow(identifier: Identifier) -> Self {
        Self {
            identifier,
            polygon: None,
            tags: None,
        }
    }

    /// Set the ring.
    pub fn with_polygon(mut self, polygon: Polygon) -> Self {
        self.polygon = Some(polygon);
        self
    }

    /// Set the tags.
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = Some(tags);
        self
    }

    fn is_full(&self) -> bool {
        self.polygon.is_some() && self.tags.is_some()
    }

    fn overlay(&self, base: Option<&Area>) -> Option<Area> {
        Some(Area {
            identifier: self.identifier,
            polygon: pick(&self.polygon, base.map(|b| &b.polygon))?,
            tags: pick(&self.tags, base.map(|b| &b.tags))?,
        })
    }

    fn restricted(&self, full: &Area) -> Self {
        Self {
            identifier: self.identifier,
            polygon: restrict(&self.polygon, &full.polygon),
            tags: restrict(&self.tags, &full.tags),
        }
    }
}

impl From<Area> for CompleteArea {
    fn from(area: Area) -> Self {
        Self {
            identifier: area.identifier,
            polygon: Some(area.polygon),
            tags: Some(area.tags),
        }
    }
}

/// Partial line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteLine {
    /// Line identifier.
    pub identifier: Identifier,
    /// Shape, if part of the delta.
    pub polyline: Option<PolyLine>,
    /// Tags, if part of the delta.
    pub tags: Option<Tags>,
}

impl CompleteLine {
    /// Line with nothing but an identifier.
    pub fn shallow(identifier: Identifier) -> Self {
        Self {
            identifier,
            polyline: None,
            tags: None,
        }
    }

    /// Set the shape.
    pub fn with_polyline(mut self, polyline: PolyLine) -> Self {
        self.polyline = Some(polyline);
        self
    }

    /// Set the tags.
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = Some(tags);
        self
    }

    fn is_full(&self) -> bool {
        self.polyline.is_some() && self.tags.is_some()
    }

    fn overlay(&self, base: Option<&Line>) -> Option<Line> {
        Some(Line {
            identifier: self.identifier,
            polyline: pick(&self.polyline, base.map(|b| &b.polyline))?,
            tags: pick(&self.tags, base.map(|b| &b.tags))?,
        })
    }

    fn restricted(&self, full: &Line) -> Self {
        Self {
            identifier: self.identifier,
            polyline: restrict(&self.polyline, &full.polyline),
            tags: restrict(&self.tags, &full.tags),
        }
    }
}

impl From<Line> for CompleteLine {
    fn from(line: Line) -> Self {
        Self {
            identifier: line.identifier,
            polyline: Some(line.polyline),
            tags: Some(line.tags),
        }
    }
}

/// Partial point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePoint {
    /// Point identifier.
    pub identifier: Identifier,
    /// Location, if part of the delta.
    pub location: Option<Location>,
    /// Tags, if part of the delta.
    pub tags: Option<Tags>,
}

impl CompletePoint {
    /// Point with nothing but an identifier.
    pub fn shallow(identifier: Identifier) -> Self {
        Self {
            identifier,
            location: None,
            tags: None,
        }
    }

    /// Set the location.
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Set the tags.
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = Some(tags);
        self
    }

    fn is_full(&self) -> bool {
        self.location.is_some() && self.tags.is_some()
    }

    fn overlay(&self, base: Option<&Point>) -> Option<Point> {
        Some(Point {
            identifier: self.identifier,
            location: pick(&self.location, base.map(|b| &b.location))?,
            tags: pick(&self.tags, base.map(|b| &b.tags))?,
        })
    }

    fn restricted(&self, full: &Point) -> Self {
        Self {
            identifier: self.identifier,
            location: restrict(&self.location, &full.location),
            tags: restrict(&self.tags, &full.tags),
        }
    }
}

impl From<Point> for CompletePoint {
    fn from(point: Point) -> Self {
        Self {
            identifier: point.identifier,
            location: Some(point.location),
            tags: Some(point.tags),
        }
    }
}

/// Partial relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRelation {
    /// Relation identifier.
    pub identifier: Identifier,
    /// Tags, if part of the delta.
    pub tags: Option<Tags>,
    /// Members, if part of the delta.
    pub members: Option<Vec<RelationMember>>,
}

impl CompleteRelation {
    /// Relation with nothing but an identifier.
    pub fn shallow(identifier: Identifier) -> Self {
        Self {
            identifier,
            tags: None,
            members: None,
        }
    }

    /// Set the tags.
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Set the members.
    pub fn with_members(mut self, members: Vec<RelationMember>) -> Self {
        self.members = Some(members);
        self
    }

    fn is_full(&self) -> bool {
        self.tags.is_some() && self.members.is_some()
    }

    fn overlay(&self, base: Option<&Relation>) -> Option<Relation> {
        Some(Relation {
            identifier: self.identifier,
            tags: pick(&self.tags, base.map(|b| &b.tags))?,
            members: pick(&self.members, base.map(|b| &b.members))?,
        })
    }

    fn restricted(&self, full: &Relation) -> Self {
        Self {
            identifier: self.identifier,
            tags: restrict(&self.tags, &full.tags),
            members: restrict(&self.members, &full.members),
        }
    }
}

impl From<Relation> for CompleteRelation {
    fn from(relation: Relation) -> Self {
        Self {
            identifier: relation.identifier,
            tags: Some(relation.tags),
            members: Some(relation.members),
        }
    }
}

/// Closed union over the six partial variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompleteEntity {
    /// A partial node.
    Node(CompleteNode),
    /// A partial edge.
    Edge(CompleteEdge),
    /// A partial area.
    Area(CompleteArea),
    /// A partial line.
    Line(CompleteLine),
    /// A partial point.
    Point(CompletePoint),
    /// A partial relation.
    Relation(CompleteRelation),
}

impl CompleteEntity {
    /// Entity with nothing but its type and identifier.
    pub fn shallow(item_type: ItemType, identifier: Identifier) -> Self {
        match item_type {
            ItemType::Node => Self::Node(CompleteNode::shallow(identifier)),
            ItemType::Edge => Self::Edge(CompleteEdge::shallow(identifier)),
            ItemType::Area => Self::Area(CompleteArea::shallow(identifier)),
            ItemType::Line => Self::Line(CompleteLine::shallow(identifier)),
            ItemType::Point => Self::Point(CompletePoint::shallow(identifier)),
            ItemType::Relation => Self::Relation(CompleteRelation::shallow(identifier)),
        }
    }

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

    /// Tags, if part of the delta.
    pub fn tags(&self) -> Option<&Tags> {
        match self {
            Self::Node(n) => n.tags.as_ref(),
            Self::Edge(e) => e.tags.as_ref(),
            Self::Area(a) => a.tags.as_ref(),
            Self::Line(l) => l.tags.as_ref(),
            Self::Point(p) => p.tags.as_ref(),
            Self::Relation(r) => r.tags.as_ref(),
        }
    }

    /// Whether every field needed to create the entity is specified.
    ///
    /// Node edge sets are not required.
    pub fn is_full(&self) -> bool {
        match self {
            Self::Node(n) => n.is_full(),
            Self::Edge(e) => e.is_full(),
            Self::Area(a) => a.is_full(),
            Self::Line(l) => l.is_full(),
            Self::Point(p) => p.is_full(),
            Self::Relation(r) => r.is_full(),
        }
    }

    /// Bounds of the geometry carried by the delta, if any.
    pub fn geometry_bounds(&self) -> Option<Rectangle> {
        match self {
            Self::Node(n) => n.location.map(|l| l.bounds()),
            Self::Edge(e) => e.polyline.as_ref().and_then(PolyLine::bounds),
            Self::Area(a) => a.polygon.as_ref().and_then(Polygon::bounds),
            Self::Line(l) => l.polyline.as_ref().and_then(PolyLine::bounds),
            Self::Point(p) => p.location.map(|l| l.bounds()),
            Self::Relation(_) => None,
        }
    }

    /// Fill unspecified fields from `base`.
    ///
    /// Returns `None` when a required field is unspecified and there is no
    /// base to fall back to, or when `base` is of another variant.
    pub fn overlay(&self, base: Option<&AtlasEntity>) -> Option<AtlasEntity> {
        match (self, base) {
            (Self::Node(delta), None) => delta.overlay(None).map(AtlasEntity::Node),
            (Self::Node(delta), Some(AtlasEntity::Node(b))) => delta.overlay(Some(b)).map(AtlasEntity::Node),
            (Self::Edge(delta), None) => delta.overlay(None).map(AtlasEntity::Edge),
            (Self::Edge(delta), Some(AtlasEntity::Edge(b))) => delta.overlay(Some(b)).map(AtlasEntity::Edge),
            (Self::Area(delta), None) => delta.overlay(None).map(AtlasEntity::Area),
            (Self::Area(delta), Some(AtlasEntity::Area(b))) => delta.overlay(Some(b)).map(AtlasEntity::Area),
            (Self::Line(delta), None) => delta.overlay(None).map(AtlasEntity::Line),
            (Self::Line(delta), Some(AtlasEntity::Line(b))) => delta.overlay(Some(b)).map(AtlasEntity::Line),
            (Self::Point(delta), None) => delta.overlay(None).map(AtlasEntity::Point),
            (Self::Point(delta), Some(AtlasEntity::Point(b))) => delta.overlay(Some(b)).map(AtlasEntity::Point),
            (Self::Relation(delta), None) => delta.overlay(None).map(AtlasEntity::Relation),
            (Self::Relation(delta), Some(AtlasEntity::Relation(b))) => {
                delta.overlay(Some(b)).map(AtlasEntity::Relation)
            }
            _ => None,
        }
    }

    /// The values `full` holds for exactly the fields this delta specifies.
    ///
    /// Used to derive a before view from an atlas entity.
    pub fn restricted_view_of(&self, full: &AtlasEntity) -> Option<CompleteEntity> {
        match (self, full) {
            (Self::Node(d), AtlasEntity::Node(n)) => Some(Self::Node(d.restricted(n))),
            (Self::Edge(d), AtlasEntity::Edge(e)) => Some(Self::Edge(d.restricted(e))),
            (Self::Area(d), AtlasEntity::Area(a)) => Some(Self::Area(d.restricted(a))),
            (Self::Line(d), AtlasEntity::Line(l)) => Some(Self::Line(d.restricted(l))),
            (Self::Point(d), AtlasEntity::Point(p)) => Some(Self::Point(d.restricted(p))),
            (Self::Relation(d), AtlasEntity::Relation(r)) => Some(Self::Relation(d.restricted(r))),
            _ => None,
        }
    }
}

impl From<AtlasEntity> for CompleteEntity {
    fn from(entity: AtlasEntity) -> Self {
        match entity {
            AtlasEntity::Node(n) => Self::Node(n.into()),
            AtlasEntity::Edge(e) => Self::Edge(e.into()),
            AtlasEntity::Area(a) => Self::Area(a.into()),
            AtlasEntity::Line(l) => Self::Line(l.into()),
            AtlasEntity::Point(p) => Self::Point(p.into()),
            AtlasEntity::Relation(r) => Self::Relation(r.into()),
        }
    }
}

impl From<CompleteNode> for CompleteEntity {
    fn from(value: CompleteNode) -> Self {
        Self::Node(value)
    }
}

impl From<CompleteEdge> for CompleteEntity {
    fn from(value: CompleteEdge) -> Self {
        Self::Edge(value)
    }
}

impl From<CompleteArea> for CompleteEntity {
    fn from(value: CompleteArea) -> Self {
        Self::Area(value)
    }
}

impl From<CompleteLine> for CompleteEntity {
    fn from(value: CompleteLine) -> Self {
        Self::Line(value)
    }
}

impl From<CompletePoint> for CompleteEntity {
    fn from(value: CompletePoint) -> Self {
        Self::Point(value)
    }
}

impl From<CompleteRelation> for CompleteEntity {
    fn from(value: CompleteRelation) -> Self {
        Self::Relation(value)
    }
}
