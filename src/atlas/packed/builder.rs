//! Single-writer builder that validates and freezes a [`PackedAtlas`].

use std::collections::{BTreeMap, HashMap};

use super::columns::{PackedContents, PackedMember, PackedTag};
use super::dictionary::StringDictionary;
use super::PackedAtlas;
use crate::atlas::{Atlas, AtlasMetadata};
use crate::config::BuildConfig;
use crate::types::{
    Area, AtlasEntity, Edge, Identifier, ItemType, Line, Location, Point, PolyLine, Polygon,
    Relation, RelationMember, Tags,
};

/// Build-time invariant violations. Fatal to the build that raised them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IntegrityError {
    /// Identifier already used by another entity of the same type.
    #[error("Duplicate {0} identifier: {1}")]
    DuplicateIdentifier(ItemType, Identifier),
    /// Geometry unusable for the entity type.
    #[error("Invalid geometry for {0} {1}: {2}")]
    InvalidGeometry(ItemType, Identifier, String),
    /// Edge endpoint references a node that was never added.
    #[error("Edge {0} references missing node {1}")]
    MissingNode(Identifier, Identifier),
    /// Edge endpoint too far from its node.
    #[error("Edge {edge} {end} is {distance:.3}m from node {node}, beyond tolerance {tolerance:.3}m")]
    EndpointMismatch {
        /// Offending edge.
        edge: Identifier,
        /// Declared endpoint node.
        node: Identifier,
        /// Which end ("start" or "end").
        end: &'static str,
        /// Distance between the shape end and the node, meters.
        distance: f64,
        /// Configured snapping tolerance, meters.
        tolerance: f64,
    },
    /// Relation without members.
    #[error("Relation {0} has no members")]
    EmptyRelation(Identifier),
    /// Relation member that does not resolve.
    #[error("Relation {0} references missing {1} {2}")]
    UnresolvedMember(Identifier, ItemType, Identifier),
    /// New entity added without all required fields.
    #[error("Added {0} {1} is incomplete")]
    IncompleteAddition(ItemType, Identifier),
    /// Removed node still referenced by a surviving edge.
    #[error("Removed node {0} is still used by edge {1}")]
    RemovedNodeInUse(Identifier, Identifier),
    /// Removed entity still a member of a surviving relation.
    #[error("Removed {0} {1} is still a member of relation {2}")]
    RemovedMemberInUse(ItemType, Identifier, Identifier),
    /// Node lists edges that disagree with the edges attached to it.
    #[error("Node {0} lists {1} edges that disagree with the edges attached to it")]
    InconsistentEdgeSet(Identifier, &'static str),
}

/// Accumulates entities, validates invariants, then freezes them.
///
/// Not thread-safe; the produced [`PackedAtlas`] is immutable.
#[derive(Debug, Default)]
pub struct PackedAtlasBuilder {
    config: BuildConfig,
    metadata: AtlasMetadata,
    nodes: BTreeMap<Identifier, (Location, Tags)>,
    edges: BTreeMap<Identifier, Edge>,
    areas: BTreeMap<Identifier, Area>,
    lines: BTreeMap<Identifier, Line>,
    points: BTreeMap<Identifier, Point>,
    relations: BTreeMap<Identifier, Relation>,
}

fn insert_unique<T>(
    map: &mut BTreeMap<Identifier, T>,
    item_type: ItemType,
    identifier: Identifier,
    value: T,
) -> Result<(), IntegrityError> {
    if map.contains_key(&identifier) {
        return Err(IntegrityError::DuplicateIdentifier(item_type, identifier));
    }
    map.insert(identifier, value);
    Ok(())
}

impl PackedAtlasBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific build configuration.
    pub fn with_config(mut self, config: BuildConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach metadata to the atlas.
    pub fn with_metadata(mut self, metadata: AtlasMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add a node. Edge topology is derived at build time.
    pub fn add_node(&mut self, identifier: Identifier, location: Location, tags: Tags) -> Result<(), IntegrityError> {
        insert_unique(&mut self.nodes, ItemType::Node, identifier, (location, tags))
    }

    /// Add a directed edge between two nodes.
    pub fn add_edge(
        &mut self,
        identifier: Identifier,
        polyline: PolyLine,
        tags: Tags,
        start_node: Identifier,
        end_node: Identifier,
    ) -> Result<(), IntegrityError> {
        if polyline.len() < 2 {
            return Err(IntegrityError::InvalidGeometry(
                ItemType::Edge,
                identifier,
                format!("{} shape points, need at least 2", polyline.len()),
            ));
        }
        let edge = Edge::new(identifier, polyline, tags, start_node, end_node);
        insert_unique(&mut self.edges, ItemType::Edge, identifier, edge)
    }

    /// Add an area.
    pub fn add_area(&mut self, identifier: Identifier, polygon: Polygon, tags: Tags) -> Result<(), IntegrityError> {
        if polygon.len() < 3 {
            return Err(IntegrityError::InvalidGeometry(
                ItemType::Area,
                identifier,
                format!("{} ring points, need at least 3", polygon.len()),
            ));
        }
        let area = Area {
            identifier,
            polygon,
            tags,
        };
        insert_unique(&mut self.areas, ItemType::Area, identifier, area)
    }

    /// Add a line.
    pub fn add_line(&mut self, identifier: Identifier, polyline: PolyLine, tags: Tags) -> Result<(), IntegrityError> {
        if polyline.len() < 2 {
            return Err(IntegrityError::InvalidGeometry(
                ItemType::Line,
                identifier,
                format!("{} shape points, need at least 2", polyline.len()),
            ));
        }
        let line = Line {
            identifier,
            polyline,
            tags,
        };
        insert_unique(&mut self.lines, ItemType::Line, identifier, line)
    }

    /// Add a point.
    pub fn add_point(&mut self, identifier: Identifier, location: Location, tags: Tags) -> Result<(), IntegrityError> {
        let point = Point {
            identifier,
            location,
            tags,
        };
        insert_unique(&mut self.points, ItemType::Point, identifier, point)
    }

    /// Add a relation. Members are resolved at build time, so relations may
    /// reference entities (including relations) added later.
    pub fn add_relation(
        &mut self,
        identifier: Identifier,
        tags: Tags,
        members: Vec<RelationMember>,
    ) -> Result<(), IntegrityError> {
        if members.is_empty() {
            return Err(IntegrityError::EmptyRelation(identifier));
        }
        let relation = Relation {
            identifier,
            tags,
            members,
        };
        insert_unique(&mut self.relations, ItemType::Relation, identifier, relation)
    }

    /// Add any entity. Node edge sets are ignored and re-derived.
    pub fn add_entity(&mut self, entity: AtlasEntity) -> Result<(), IntegrityError> {
        match entity {
            AtlasEntity::Node(n) => self.add_node(n.identifier, n.location, n.tags),
            AtlasEntity::Edge(e) => self.add_edge(e.identifier, e.polyline, e.tags, e.start_node, e.end_node),
            AtlasEntity::Area(a) => self.add_area(a.identifier, a.polygon, a.tags),
            AtlasEntity::Line(l) => self.add_line(l.identifier, l.polyline, l.tags),
            AtlasEntity::Point(p) => self.add_point(p.identifier, p.location, p.tags),
            AtlasEntity::Relation(r) => self.add_relation(r.identifier, r.tags, r.members),
        }
    }

    /// Materialize any atlas view into a packed atlas.
    pub fn from_atlas(atlas: &dyn Atlas, config: BuildConfig) -> Result<PackedAtlas, IntegrityError> {
        let mut builder = Self::new().with_config(config).with_metadata(atlas.metadata());
        for item_type in ItemType::ALL {
            for entity in atlas.entities(item_type) {
                builder.add_entity(entity)?;
            }
        }
        builder.build()
    }

    /// Number of entities added so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
            + self.edges.len()
            + self.areas.len()
            + self.lines.len()
            + self.points.len()
            + self.relations.len()
    }

    /// Whether nothing was added.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(&self) -> Result<(), IntegrityError> {
        let tolerance = self.config.snap_tolerance_meters;
        for edge in self.edges.values() {
            let shape_ends = [
                ("start", edge.start_node, edge.polyline.first()),
                ("end", edge.end_node, edge.polyline.last()),
            ];
            for (end, node, shape_end) in shape_ends {
                let (node_location, _) = self
                    .nodes
                    .get(&node)
                    .ok_or(IntegrityError::MissingNode(edge.identifier, node))?;
                let Some(shape_end) = shape_end else { continue };
                let distance = node_location.distance_to(&shape_end);
                if distance > tolerance {
                    return Err(IntegrityError::EndpointMismatch {
                        edge: edge.identifier,
                        node,
                        end,
                        distance,
                        tolerance,
                    });
                }
            }
        }
        for relation in self.relations.values() {
            for member in &relation.members {
                let exists = match member.item_type {
                    ItemType::Node => self.nodes.contains_key(&member.identifier),
                    ItemType::Edge => self.edges.contains_key(&member.identifier),
                    ItemType::Area => self.areas.contains_key(&member.identifier),
                    ItemType::Line => self.lines.contains_key(&member.identifier),
                    ItemType::Point => self.points.contains_key(&member.identifier),
                    ItemType::Relation => self.relations.contains_key(&member.identifier),
                };
                if !exists {
                    return Err(IntegrityError::UnresolvedMember(
                        relation.identifier,
                        member.item_type,
                        member.identifier,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Validate and freeze.
    pub fn build(self) -> Result<PackedAtlas, IntegrityError> {
        self.validate()?;

        let dictionary = StringDictionary::new();
        let pack_tags = |tags: &Tags| -> Vec<PackedTag> {
            tags.iter()
                .map(|(k, v)| (dictionary.intern(k), dictionary.intern(v)))
                .collect()
        };

        let mut contents = PackedContents::default();

        let node_rows: HashMap<Identifier, u32> = self
            .nodes
            .keys()
            .enumerate()
            .map(|(row, id)| (*id, row as u32))
            .collect();
        let mut in_edges: Vec<Vec<u32>> = vec![Vec::new(); self.nodes.len()];
        let mut out_edges: Vec<Vec<u32>> = vec![Vec::new(); self.nodes.len()];

        for (row, edge) in self.edges.values().enumerate() {
            // Both endpoints were checked by validate().
            let start = node_rows[&edge.start_node];
            let end = node_rows[&edge.end_node];
            out_edges[start as usize].push(row as u32);
            in_edges[end as usize].push(row as u32);

            let columns = &mut contents.edges;
            columns.identifiers.push(edge.identifier);
            columns.shapes.push_row(edge.polyline.locations().iter().copied());
            columns.tags.push_row(pack_tags(&edge.tags));
            columns.start_nodes.push(start);
            columns.end_nodes.push(end);
        }

        for (row, (identifier, (location, tags))) in self.nodes.iter().enumerate() {
            let columns = &mut contents.nodes;
            columns.identifiers.push(*identifier);
            columns.locations.push(*location);
            columns.tags.push_row(pack_tags(tags));
            columns.in_edges.push_row(std::mem::take(&mut in_edges[row]));
            columns.out_edges.push_row(std::mem::take(&mut out_edges[row]));
        }

        for area in self.areas.values() {
            contents.areas.identifiers.push(area.identifier);
            contents.areas.shapes.push_row(area.polygon.locations().iter().copied());
            contents.areas.tags.push_row(pack_tags(&area.tags));
        }

        for line in self.lines.values() {
            contents.lines.identifiers.push(line.identifier);
            contents.lines.shapes.push_row(line.polyline.locations().iter().copied());
            contents.lines.tags.push_row(pack_tags(&line.tags));
        }

        for point in self.points.values() {
            contents.points.identifiers.push(point.identifier);
            contents.points.locations.push(point.location);
            contents.points.tags.push_row(pack_tags(&point.tags));
        }

        contents.relations.identifiers = self.relations.keys().copied().collect();
        for relation in self.relations.values() {
            contents.relations.tags.push_row(pack_tags(&relation.tags));
            let members: Vec<PackedMember> = relation
                .members
                .iter()
                .filter_map(|member| {
                    let row = contents
                        .identifiers(member.item_type)
                        .binary_search(&member.identifier)
                        .ok()?;
                    Some(PackedMember {
                        item_type: member.item_type,
                        row: row as u32,
                        role: dictionary.intern(&member.role),
                    })
                })
                .collect();
            contents.relations.members.push_row(members);
        }

        contents.metadata = self.metadata;
        contents.dictionary = dictionary.freeze();

        tracing::debug!(
            nodes = contents.nodes.identifiers.len(),
            edges = contents.edges.identifiers.len(),
            areas = contents.areas.identifiers.len(),
            lines = contents.lines.identifiers.len(),
            points = contents.points.identifiers.len(),
            relations = contents.relations.identifiers.len(),
            dictionary = contents.dictionary.len(),
            "Packed atlas built"
        );

        Ok(PackedAtlas::from_contents(contents, &self.config))
    }
}
