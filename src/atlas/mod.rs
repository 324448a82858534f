//! Atlas: the read-only map-feature graph contract and its implementations.
//!
//! ## Architecture
//!
//! ```text
//! PackedAtlasBuilder → PackedAtlas ─┐
//!                                   ├→ MultiAtlas (border stitching)
//!        Sharding + fetcher ────────┴→ DynamicAtlas (on-demand shards)
//! ```
//!
//! Every implementation answers lookups with owned entity values whose
//! relationships are identifiers; navigation goes back through the atlas.

pub mod packed;
pub mod multi;
pub mod dynamic;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::types::{
    Area, AtlasEntity, Edge, Identifier, ItemType, Line, Node, Point, Rectangle, Relation,
};

pub use packed::{PackedAtlas, PackedAtlasBuilder};
pub use multi::{multi_from_paths, BorderConflict, BorderConflictPolicy, MultiAtlas};
pub use dynamic::{DynamicAtlas, DynamicAtlasPolicy, Shard, Sharding, SlippyTile, SlippyTileSharding};

/// Descriptive information carried alongside an atlas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtlasMetadata {
    /// Version of the code that produced the atlas.
    pub code_version: String,
    /// Version of the source data.
    pub data_version: String,
    /// Shard this atlas covers, if any.
    pub shard_name: Option<String>,
    /// Country code, if the atlas is sliced by country.
    pub country: Option<String>,
    /// Free-form metadata tags.
    pub tags: BTreeMap<String, String>,
}

impl Default for AtlasMetadata {
    fn default() -> Self {
        Self {
            code_version: crate::ATLAS_CODE_VERSION.to_string(),
            data_version: "unknown".to_string(),
            shard_name: None,
            country: None,
            tags: BTreeMap::new(),
        }
    }
}

impl AtlasMetadata {
    /// Set the data version.
    pub fn with_data_version(mut self, version: impl Into<String>) -> Self {
        self.data_version = version.into();
        self
    }

    /// Set the shard name.
    pub fn with_shard_name(mut self, shard: impl Into<String>) -> Self {
        self.shard_name = Some(shard.into());
        self
    }

    /// Set the country code.
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Add a metadata tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Read-only map-feature graph.
///
/// Implementations must return identifier lists in ascending order and must
/// be safe for concurrent readers.
pub trait Atlas: Send + Sync {
    /// Metadata of this atlas.
    fn metadata(&self) -> AtlasMetadata;

    /// Look up a node.
    fn node(&self, identifier: Identifier) -> Option<Node>;

    /// Look up an edge.
    fn edge(&self, identifier: Identifier) -> Option<Edge>;

    /// Look up an area.
    fn area(&self, identifier: Identifier) -> Option<Area>;

    /// Look up a line.
    fn line(&self, identifier: Identifier) -> Option<Line>;

    /// Look up a point.
    fn point(&self, identifier: Identifier) -> Option<Point>;

    /// Look up a relation.
    fn relation(&self, identifier: Identifier) -> Option<Relation>;

    /// All identifiers of one type, ascending.
    fn identifiers(&self, item_type: ItemType) -> Vec<Identifier>;

    /// Identifiers of one type whose bounds intersect `bounds`, ascending.
    fn identifiers_intersecting(&self, item_type: ItemType, bounds: &Rectangle) -> Vec<Identifier>;

    /// Relations listing the given entity as a member.
    fn relations_with_member(&self, item_type: ItemType, identifier: Identifier) -> BTreeSet<Identifier>;

    /// Look up any entity.
    fn entity(&self, item_type: ItemType, identifier: Identifier) -> Option<AtlasEntity> {
        match item_type {
            ItemType::Node => self.node(identifier).map(AtlasEntity::Node),
            ItemType::Edge => self.edge(identifier).map(AtlasEntity::Edge),
            ItemType::Area => self.area(identifier).map(AtlasEntity::Area),
            ItemType::Line => self.line(identifier).map(AtlasEntity::Line),
            ItemType::Point => self.point(identifier).map(AtlasEntity::Point),
            ItemType::Relation => self.relation(identifier).map(AtlasEntity::Relation),
        }
    }

    /// Whether the entity exists.
    fn contains(&self, item_type: ItemType, identifier: Identifier) -> bool {
        self.entity(item_type, identifier).is_some()
    }

    /// Number of entities of one type.
    fn count(&self, item_type: ItemType) -> usize {
        self.identifiers(item_type).len()
    }

    /// Iterate all entities of one type, ascending by identifier.
    fn entities(&self, item_type: ItemType) -> Box<dyn Iterator<Item = AtlasEntity> + '_> {
        Box::new(
            self.identifiers(item_type)
                .into_iter()
                .filter_map(move |id| self.entity(item_type, id)),
        )
    }

    /// Entities of one type matching `predicate`.
    fn entities_matching(
        &self,
        item_type: ItemType,
        predicate: &dyn Fn(&AtlasEntity) -> bool,
    ) -> Vec<AtlasEntity> {
        self.entities(item_type).filter(|e| predicate(e)).collect()
    }

    /// Entities of one type whose bounds intersect `bounds`.
    fn entities_intersecting(&self, item_type: ItemType, bounds: &Rectangle) -> Vec<AtlasEntity> {
        self.identifiers_intersecting(item_type, bounds)
            .into_iter()
            .filter_map(|id| self.entity(item_type, id))
            .collect()
    }

    /// Iterate all nodes.
    fn nodes(&self) -> Box<dyn Iterator<Item = Node> + '_> {
        Box::new(self.identifiers(ItemType::Node).into_iter().filter_map(move |id| self.node(id)))
    }

    /// Iterate all edges.
    fn edges(&self) -> Box<dyn Iterator<Item = Edge> + '_> {
        Box::new(self.identifiers(ItemType::Edge).into_iter().filter_map(move |id| self.edge(id)))
    }

    /// Iterate all areas.
    fn areas(&self) -> Box<dyn Iterator<Item = Area> + '_> {
        Box::new(self.identifiers(ItemType::Area).into_iter().filter_map(move |id| self.area(id)))
    }

    /// Iterate all lines.
    fn lines(&self) -> Box<dyn Iterator<Item = Line> + '_> {
        Box::new(self.identifiers(ItemType::Line).into_iter().filter_map(move |id| self.line(id)))
    }

    /// Iterate all points.
    fn points(&self) -> Box<dyn Iterator<Item = Point> + '_> {
        Box::new(self.identifiers(ItemType::Point).into_iter().filter_map(move |id| self.point(id)))
    }

    /// Iterate all relations.
    fn relations(&self) -> Box<dyn Iterator<Item = Relation> + '_> {
        Box::new(
            self.identifiers(ItemType::Relation)
                .into_iter()
                .filter_map(move |id| self.relation(id)),
        )
    }

    /// Edges incident to a node, ascending by identifier.
    fn edges_of_node(&self, node: Identifier) -> Vec<Edge> {
        self.node(node)
            .map(|n| n.connected_edges().into_iter().filter_map(|id| self.edge(id)).collect())
            .unwrap_or_default()
    }

    /// Start node of an edge.
    fn start_node(&self, edge: &Edge) -> Option<Node> {
        self.node(edge.start_node)
    }

    /// End node of an edge.
    fn end_node(&self, edge: &Edge) -> Option<Node> {
        self.node(edge.end_node)
    }

    /// The companion edge running the other way, if any.
    fn reverse_edge(&self, edge: Identifier) -> Option<Edge> {
        let reverse = edge.checked_neg().filter(|&id| id != 0)?;
        self.edge(reverse)
    }

    /// Relations containing the given entity.
    fn relations_of(&self, item_type: ItemType, identifier: Identifier) -> Vec<Relation> {
        self.relations_with_member(item_type, identifier)
            .into_iter()
            .filter_map(|id| self.relation(id))
            .collect()
    }

    /// Bounds of a relation: union of its members' bounds, cycle safe.
    fn relation_bounds(&self, relation: Identifier) -> Option<Rectangle> {
        let mut visited = HashSet::new();
        relation_bounds_inner(self, relation, &mut visited)
    }

    /// Bounds of any entity.
    fn entity_bounds(&self, entity: &AtlasEntity) -> Option<Rectangle> {
        match entity {
            AtlasEntity::Relation(r) => self.relation_bounds(r.identifier),
            other => other.geometry_bounds(),
        }
    }

    /// Bounds of every located entity.
    fn bounds(&self) -> Option<Rectangle> {
        [ItemType::Node, ItemType::Edge, ItemType::Area, ItemType::Line, ItemType::Point]
            .into_iter()
            .flat_map(|item_type| self.entities(item_type).collect::<Vec<_>>())
            .filter_map(|e| e.geometry_bounds())
            .reduce(|a, b| a.combine(&b))
    }
}

fn relation_bounds_inner<A: Atlas + ?Sized>(
    atlas: &A,
    relation: Identifier,
    visited: &mut HashSet<Identifier>,
) -> Option<Rectangle> {
    if !visited.insert(relation) {
        return None;
    }
    let relation = atlas.relation(relation)?;
    relation
        .members
        .iter()
        .filter_map(|member| match member.item_type {
            ItemType::Relation => relation_bounds_inner(atlas, member.identifier, visited),
            item_type => atlas
                .entity(item_type, member.identifier)
                .and_then(|e| e.geometry_bounds()),
        })
        .reduce(|a, b| a.combine(&b))
}

/// Logical value equality of two atlases.
///
/// Compares metadata, identifier sets and every entity; storage layout
/// (dictionary order, column packing) is irrelevant.
pub fn same_contents(left: &dyn Atlas, right: &dyn Atlas) -> bool {
    if left.metadata() != right.metadata() {
        return false;
    }
    ItemType::ALL.into_iter().all(|item_type| {
        let ids = left.identifiers(item_type);
        ids == right.identifiers(item_type)
            && ids
                .into_iter()
                .all(|id| left.entity(item_type, id) == right.entity(item_type, id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Location, PolyLine, RelationMember, Tags};

    fn small_atlas() -> PackedAtlas {
        let mut builder = PackedAtlasBuilder::new();
        builder.add_node(1, Location::from_dm7(0, 0), Tags::new()).unwrap();
        builder.add_node(2, Location::from_dm7(0, 100), Tags::new()).unwrap();
        let shape = PolyLine::new(vec![Location::from_dm7(0, 0), Location::from_dm7(0, 100)]);
        builder.add_edge(10, shape.clone(), Tags::new(), 1, 2).unwrap();
        builder.add_edge(-10, shape.reversed(), Tags::new(), 2, 1).unwrap();
        builder
            .add_point(20, Location::from_dm7(500, 500), Tags::new())
            .unwrap();
        builder
            .add_relation(30, Tags::new(), vec![
                RelationMember::new(ItemType::Edge, 10, "outer"),
                RelationMember::new(ItemType::Relation, 31, "child"),
            ])
            .unwrap();
        builder
            .add_relation(31, Tags::new(), vec![
                RelationMember::new(ItemType::Point, 20, ""),
                RelationMember::new(ItemType::Relation, 30, "parent"),
            ])
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_navigation_helpers() {
        let atlas = small_atlas();
        let edge = atlas.edge(10).unwrap();
        assert_eq!(atlas.start_node(&edge).map(|n| n.identifier), Some(1));
        assert_eq!(atlas.end_node(&edge).map(|n| n.identifier), Some(2));
        assert_eq!(atlas.reverse_edge(10).map(|e| e.identifier), Some(-10));
        assert_eq!(atlas.reverse_edge(-10).map(|e| e.identifier), Some(10));
        assert!(atlas.reverse_edge(Identifier::MIN).is_none());
        assert!(atlas.reverse_edge(0).is_none());

        let ids: Vec<_> = atlas.edges_of_node(1).iter().map(|e| e.identifier).collect();
        assert_eq!(ids, vec![-10, 10]);

        let containing: Vec<_> = atlas.relations_of(ItemType::Relation, 30).iter().map(|r| r.identifier).collect();
        assert_eq!(containing, vec![31]);
    }

    #[test]
    fn test_relation_bounds_with_cycle() {
        let atlas = small_atlas();
        let bounds = atlas.relation_bounds(30).unwrap();
        assert_eq!(bounds.lower_left(), Location::from_dm7(0, 0));
        assert_eq!(bounds.upper_right(), Location::from_dm7(500, 500));
    }

    #[test]
    fn test_same_contents_is_reflexive() {
        let atlas = small_atlas();
        assert!(same_contents(&atlas, &atlas));
    }
}
