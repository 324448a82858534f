//! ChangeAtlas: a base atlas seen through a change, without copying either.
//!
//! ## Read Rules
//!
//! - REMOVE hides the entity.
//! - ADD overlays the specified fields onto the base entity (or creates it).
//! - Everything else reads through to the base.
//!
//! Node edge sets and reverse relation membership are re-derived from the
//! edges and relations the change touches. A node that lists its edge sets
//! explicitly must list exactly the derived ones.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{Change, ChangeError};
use crate::atlas::packed::IntegrityError;
use crate::atlas::{Atlas, AtlasMetadata};
use crate::types::{
    Area, AtlasEntity, CompleteEntity, Edge, Identifier, ItemType, Line, Node, Point, Rectangle,
    Relation,
};

type Key = (ItemType, Identifier);

fn of_type<V>(map: &BTreeMap<Key, V>, item_type: ItemType) -> impl Iterator<Item = (&Key, &V)> {
    map.range((item_type, Identifier::MIN)..=(item_type, Identifier::MAX))
}

/// Read-only overlay of a [`Change`] on a base atlas.
pub struct ChangeAtlas<'a> {
    base: &'a dyn Atlas,
    change: &'a Change,
    added: BTreeMap<Key, AtlasEntity>,
    removed: BTreeSet<Key>,
    edges_starting: HashMap<Identifier, BTreeSet<Identifier>>,
    edges_ending: HashMap<Identifier, BTreeSet<Identifier>>,
    changed_edges: BTreeSet<Identifier>,
    member_index: HashMap<Key, BTreeSet<Identifier>>,
    changed_relations: BTreeSet<Identifier>,
}

impl std::fmt::Debug for ChangeAtlas<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeAtlas")
            .field("change", &self.change.name())
            .field("added", &self.added.len())
            .field("removed", &self.removed.len())
            .finish()
    }
}

impl<'a> ChangeAtlas<'a> {
    /// Overlay `change` on `base`, validating that the result is a
    /// consistent atlas.
    pub fn new(base: &'a dyn Atlas, change: &'a Change) -> Result<Self, ChangeError> {
        let mut added = BTreeMap::new();
        let mut removed = BTreeSet::new();
        for feature in change {
            let key = feature.key();
            if feature.is_remove() {
                removed.insert(key);
                continue;
            }
            let existing = base.entity(key.0, key.1);
            if existing.is_none() && !feature.after_view.is_full() {
                return Err(IntegrityError::IncompleteAddition(key.0, key.1).into());
            }
            let entity = feature
                .after_view
                .overlay(existing.as_ref())
                .ok_or(IntegrityError::IncompleteAddition(key.0, key.1))?;
            added.insert(key, entity);
        }

        let mut edges_starting: HashMap<_, BTreeSet<_>> = HashMap::new();
        let mut edges_ending: HashMap<_, BTreeSet<_>> = HashMap::new();
        for (_, entity) in of_type(&added, ItemType::Edge) {
            if let AtlasEntity::Edge(edge) = entity {
                edges_starting.entry(edge.start_node).or_default().insert(edge.identifier);
                edges_ending.entry(edge.end_node).or_default().insert(edge.identifier);
            }
        }
        let mut member_index: HashMap<_, BTreeSet<_>> = HashMap::new();
        for (_, entity) in of_type(&added, ItemType::Relation) {
            if let AtlasEntity::Relation(relation) = entity {
                for member in &relation.members {
                    member_index
                        .entry((member.item_type, member.identifier))
                        .or_default()
                        .insert(relation.identifier);
                }
            }
        }
        let changed_edges = change.of_type(ItemType::Edge).map(|f| f.identifier()).collect();
        let changed_relations = change.of_type(ItemType::Relation).map(|f| f.identifier()).collect();

        let atlas = Self {
            base,
            change,
            added,
            removed,
            edges_starting,
            edges_ending,
            changed_edges,
            member_index,
            changed_relations,
        };
        atlas.validate()?;
        tracing::debug!(
            change = %change.name(),
            added = atlas.added.len(),
            removed = atlas.removed.len(),
            "ChangeAtlas composed"
        );
        Ok(atlas)
    }

    /// The base atlas.
    pub fn base(&self) -> &dyn Atlas {
        self.base
    }

    /// The overlaid change.
    pub fn change(&self) -> &Change {
        self.change
    }

    fn validate(&self) -> Result<(), IntegrityError> {
        for (_, entity) in &self.added {
            match entity {
                AtlasEntity::Node(node) => self.check_listed_edges(node.identifier)?,
                AtlasEntity::Edge(edge) => {
                    for node in [edge.start_node, edge.end_node] {
                        if !self.contains(ItemType::Node, node) {
                            return Err(IntegrityError::MissingNode(edge.identifier, node));
                        }
                    }
                }
                AtlasEntity::Relation(relation) => {
                    if relation.members.is_empty() {
                        return Err(IntegrityError::EmptyRelation(relation.identifier));
                    }
                    for member in &relation.members {
                        if !self.contains(member.item_type, member.identifier) {
                            return Err(IntegrityError::UnresolvedMember(
                                relation.identifier,
                                member.item_type,
                                member.identifier,
                            ));
                        }
                    }
                }
                _ => {}
            }
        }

        for &(item_type, identifier) in &self.removed {
            if item_type == ItemType::Node {
                self.check_removed_node(identifier)?;
            }
            let mut holders = self.base.relations_with_member(item_type, identifier);
            holders.extend(self.member_index.get(&(item_type, identifier)).into_iter().flatten());
            for holder in holders {
                let still_member = self.relation(holder).is_some_and(|r| {
                    r.members
                        .iter()
                        .any(|m| m.item_type == item_type && m.identifier == identifier)
                });
                if still_member {
                    return Err(IntegrityError::RemovedMemberInUse(item_type, identifier, holder));
                }
            }
        }
        Ok(())
    }

    fn check_removed_node(&self, node: Identifier) -> Result<(), IntegrityError> {
        let mut incident = self.base.node(node).map(|n| n.connected_edges()).unwrap_or_default();
        incident.extend(self.edges_starting.get(&node).into_iter().flatten());
        incident.extend(self.edges_ending.get(&node).into_iter().flatten());
        for edge in incident {
            if self
                .edge(edge)
                .is_some_and(|e| e.start_node == node || e.end_node == node)
            {
                return Err(IntegrityError::RemovedNodeInUse(node, edge));
            }
        }
        Ok(())
    }

    fn lookup(&self, item_type: ItemType, identifier: Identifier) -> Option<AtlasEntity> {
        let key = (item_type, identifier);
        if self.removed.contains(&key) {
            return None;
        }
        match self.added.get(&key) {
            Some(entity) => Some(entity.clone()),
            None => self.base.entity(item_type, identifier),
        }
    }

    fn check_listed_edges(&self, node: Identifier) -> Result<(), IntegrityError> {
        let Some(CompleteEntity::Node(listed)) = self.change.get(ItemType::Node, node).map(|f| &f.after_view) else {
            return Ok(());
        };
        let (in_edges, out_edges) = self.derived_edges(node);
        for (direction, listed, derived) in [("in", &listed.in_edges, &in_edges), ("out", &listed.out_edges, &out_edges)] {
            if listed.as_ref().is_some_and(|listed| listed != derived) {
                return Err(IntegrityError::InconsistentEdgeSet(node, direction));
            }
        }
        Ok(())
    }

    /// In and out edges of `node` in the view: the base sets without the
    /// edges the change touches, plus the changed edges attached to it.
    fn derived_edges(&self, node: Identifier) -> (BTreeSet<Identifier>, BTreeSet<Identifier>) {
        let (mut in_edges, mut out_edges) = self
            .base
            .node(node)
            .map(|n| (n.in_edges, n.out_edges))
            .unwrap_or_default();
        for (edges, index) in [(&mut in_edges, &self.edges_ending), (&mut out_edges, &self.edges_starting)] {
            edges.retain(|e| !self.changed_edges.contains(e));
            edges.extend(index.get(&node).into_iter().flatten());
        }
        (in_edges, out_edges)
    }

    fn with_derived_edges(&self, mut node: Node) -> Node {
        (node.in_edges, node.out_edges) = self.derived_edges(node.identifier);
        node
    }
}

impl Atlas for ChangeAtlas<'_> {
    fn metadata(&self) -> AtlasMetadata {
        self.base.metadata()
    }

    fn node(&self, identifier: Identifier) -> Option<Node> {
        match self.lookup(ItemType::Node, identifier)? {
            AtlasEntity::Node(node) => Some(self.with_derived_edges(node)),
            _ => None,
        }
    }

    fn edge(&self, identifier: Identifier) -> Option<Edge> {
        match self.lookup(ItemType::Edge, identifier)? {
            AtlasEntity::Edge(edge) => Some(edge),
            _ => None,
        }
    }

    fn area(&self, identifier: Identifier) -> Option<Area> {
        match self.lookup(ItemType::Area, identifier)? {
            AtlasEntity::Area(area) => Some(area),
            _ => None,
        }
    }

    fn line(&self, identifier: Identifier) -> Option<Line> {
        match self.lookup(ItemType::Line, identifier)? {
            AtlasEntity::Line(line) => Some(line),
            _ => None,
        }
    }

    fn point(&self, identifier: Identifier) -> Option<Point> {
        match self.lookup(ItemType::Point, identifier)? {
            AtlasEntity::Point(point) => Some(point),
            _ => None,
        }
    }

    fn relation(&self, identifier: Identifier) -> Option<Relation> {
        match self.lookup(ItemType::Relation, identifier)? {
            AtlasEntity::Relation(relation) => Some(relation),
            _ => None,
        }
    }

    fn contains(&self, item_type: ItemType, identifier: Identifier) -> bool {
        let key = (item_type, identifier);
        !self.removed.contains(&key)
            && (self.added.contains_key(&key) || self.base.contains(item_type, identifier))
    }

    fn identifiers(&self, item_type: ItemType) -> Vec<Identifier> {
        let mut identifiers: BTreeSet<Identifier> = self.base.identifiers(item_type).into_iter().collect();
        identifiers.extend(of_type(&self.added, item_type).map(|((_, id), _)| *id));
        identifiers
            .into_iter()
            .filter(|id| !self.removed.contains(&(item_type, *id)))
            .collect()
    }

    fn identifiers_intersecting(&self, item_type: ItemType, bounds: &Rectangle) -> Vec<Identifier> {
        if item_type == ItemType::Relation {
            // Any member edit can move a relation's bounds.
            return self
                .identifiers(ItemType::Relation)
                .into_iter()
                .filter(|&id| self.relation_bounds(id).is_some_and(|b| b.intersects(bounds)))
                .collect();
        }
        let mut identifiers: BTreeSet<Identifier> = self
            .base
            .identifiers_intersecting(item_type, bounds)
            .into_iter()
            .filter(|&id| self.change.get(item_type, id).is_none())
            .collect();
        identifiers.extend(
            of_type(&self.added, item_type)
                .filter(|(_, entity)| entity.geometry_bounds().is_some_and(|b| b.intersects(bounds)))
                .map(|((_, id), _)| *id),
        );
        identifiers.into_iter().collect()
    }

    fn relations_with_member(&self, item_type: ItemType, identifier: Identifier) -> BTreeSet<Identifier> {
        let mut relations: BTreeSet<Identifier> = self
            .base
            .relations_with_member(item_type, identifier)
            .into_iter()
            .filter(|r| !self.changed_relations.contains(r))
            .collect();
        if let Some(index) = self.member_index.get(&(item_type, identifier)) {
            relations.extend(index);
        }
        relations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::{PackedAtlas, PackedAtlasBuilder};
    use crate::change::{ChangeBuilder, FeatureChange};
    use crate::types::{
        CompleteEdge, CompleteNode, CompletePoint, CompleteRelation, Location, PolyLine, RelationMember,
        Tags,
    };

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn at(lat: i32, lon: i32) -> Location {
        Location::from_dm7(lat, lon)
    }

    fn base_atlas() -> PackedAtlas {
        let mut builder = PackedAtlasBuilder::new();
        builder.add_node(1, at(0, 0), Tags::new()).unwrap();
        builder.add_node(2, at(0, 1000), Tags::new()).unwrap();
        let shape = PolyLine::new(vec![at(0, 0), at(0, 1000)]);
        builder.add_edge(10, shape.clone(), tags(&[("highway", "primary")]), 1, 2).unwrap();
        builder.add_edge(-10, shape.reversed(), tags(&[("highway", "primary")]), 2, 1).unwrap();
        builder.add_point(20, at(500, 500), tags(&[("amenity", "cafe")])).unwrap();
        builder
            .add_relation(30, tags(&[("type", "site")]), vec![RelationMember::new(ItemType::Point, 20, "")])
            .unwrap();
        builder.build().unwrap()
    }

    fn change_of(features: Vec<FeatureChange>) -> Change {
        let mut builder = ChangeBuilder::new();
        builder.add_all(features).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_overlay_keeps_unspecified_fields() {
        let base = base_atlas();
        let change = change_of(vec![FeatureChange::add(
            CompletePoint::shallow(20).with_tags(tags(&[("amenity", "bar")])),
        )]);
        let view = ChangeAtlas::new(&base, &change).unwrap();

        let point = view.point(20).unwrap();
        assert_eq!(point.location, at(500, 500));
        assert_eq!(point.tags, tags(&[("amenity", "bar")]));
        assert_eq!(view.edge(10), base.edge(10));
        assert_eq!(view.metadata(), base.metadata());
    }

    #[test]
    fn test_new_edge_rederives_node_topology() {
        let base = base_atlas();
        let change = change_of(vec![
            FeatureChange::add(CompleteNode::shallow(3).with_location(at(0, 2000)).with_tags(Tags::new())),
            FeatureChange::add(
                CompleteEdge::shallow(11)
                    .with_polyline(PolyLine::new(vec![at(0, 1000), at(0, 2000)]))
                    .with_tags(Tags::new())
                    .with_nodes(2, 3),
            ),
        ]);
        let view = ChangeAtlas::new(&base, &change).unwrap();

        assert_eq!(view.node(2).unwrap().out_edges, [-10, 11].into_iter().collect());
        assert_eq!(view.node(3).unwrap().in_edges, [11].into_iter().collect());
        assert_eq!(view.identifiers(ItemType::Node), vec![1, 2, 3]);
        let hits = view.identifiers_intersecting(ItemType::Edge, &at(0, 1800).bounds());
        assert_eq!(hits, vec![11]);
    }

    #[test]
    fn test_removal_hides_and_updates_membership() {
        let base = base_atlas();
        let change = change_of(vec![
            FeatureChange::remove_identifier(ItemType::Edge, 10),
            FeatureChange::remove_identifier(ItemType::Edge, -10),
            FeatureChange::add(
                CompleteRelation::shallow(31)
                    .with_tags(Tags::new())
                    .with_members(vec![RelationMember::new(ItemType::Point, 20, "main")]),
            ),
        ]);
        let view = ChangeAtlas::new(&base, &change).unwrap();

        assert!(view.edge(10).is_none());
        assert!(!view.contains(ItemType::Edge, -10));
        assert!(view.node(1).unwrap().connected_edges().is_empty());
        assert_eq!(view.relations_with_member(ItemType::Point, 20), [30, 31].into_iter().collect());
        assert!(view.identifiers(ItemType::Edge).is_empty());
    }

    #[test]
    fn test_invalid_overlays_rejected() {
        let base = base_atlas();
        let invalid = |features: Vec<FeatureChange>| {
            let change = change_of(features);
            match ChangeAtlas::new(&base, &change) {
                Err(ChangeError::InvalidOverlay(error)) => error,
                other => panic!("expected invalid overlay, got {other:?}"),
            }
        };

        assert_eq!(
            invalid(vec![FeatureChange::add(CompletePoint::shallow(99).with_tags(Tags::new()))]),
            IntegrityError::IncompleteAddition(ItemType::Point, 99)
        );
        assert_eq!(
            invalid(vec![FeatureChange::add(CompleteEdge::shallow(10).with_nodes(1, 7))]),
            IntegrityError::MissingNode(10, 7)
        );
        assert!(matches!(
            invalid(vec![FeatureChange::remove_identifier(ItemType::Node, 1)]),
            IntegrityError::RemovedNodeInUse(1, _)
        ));
        assert_eq!(
            invalid(vec![FeatureChange::remove_identifier(ItemType::Point, 20)]),
            IntegrityError::RemovedMemberInUse(ItemType::Point, 20, 30)
        );
        assert_eq!(
            invalid(vec![FeatureChange::add(
                CompleteRelation::shallow(30).with_members(vec![RelationMember::new(ItemType::Area, 5, "")]),
            )]),
            IntegrityError::UnresolvedMember(30, ItemType::Area, 5)
        );
    }

    #[test]
    fn test_listed_edge_sets_must_match_view() {
        let base = base_atlas();
        let change = change_of(vec![FeatureChange::add(
            CompleteNode::shallow(1).with_in_edges([777]).with_out_edges(BTreeSet::new()),
        )]);
        assert!(matches!(
            ChangeAtlas::new(&base, &change),
            Err(ChangeError::InvalidOverlay(IntegrityError::InconsistentEdgeSet(1, "in")))
        ));

        let change = change_of(vec![FeatureChange::add(
            CompleteNode::shallow(1).with_in_edges([-10]).with_out_edges(BTreeSet::new()),
        )]);
        assert!(matches!(
            ChangeAtlas::new(&base, &change),
            Err(ChangeError::InvalidOverlay(IntegrityError::InconsistentEdgeSet(1, "out")))
        ));

        let change = change_of(vec![FeatureChange::add(
            CompleteNode::shallow(1)
                .with_tags(tags(&[("highway", "stop")]))
                .with_in_edges([-10])
                .with_out_edges([10]),
        )]);
        let view = ChangeAtlas::new(&base, &change).unwrap();
        let node = view.node(1).unwrap();
        assert_eq!(node.in_edges, [-10].into_iter().collect());
        assert_eq!(node.out_edges, [10].into_iter().collect());
        assert_eq!(view.edge(10).unwrap().start_node, 1);
    }

    #[test]
    fn test_removing_relation_and_member_together() {
        let base = base_atlas();
        let change = change_of(vec![
            FeatureChange::remove_identifier(ItemType::Point, 20),
            FeatureChange::remove_identifier(ItemType::Relation, 30),
        ]);
        let view = ChangeAtlas::new(&base, &change).unwrap();
        assert!(view.relations_with_member(ItemType::Point, 20).is_empty());
        assert!(view.relation_bounds(30).is_none());
    }
}
