//! PackedAtlas: the concrete immutable, columnar atlas.
//!
//! ## Layout
//!
//! - One column group per entity type, rows sorted by identifier
//!   (lookup is a binary search).
//! - Tag keys, tag values and member roles are indices into one
//!   store-wide string dictionary.
//! - Node edge lists, edge endpoints and relation members are row
//!   indices into the other groups.
//! - A grid spatial index per type is rebuilt on load and never serialized.
//!
//! The reverse relation index (member → relations) is built on first use.

pub mod builder;
pub mod codec;
pub mod text;
pub(crate) mod columns;
pub(crate) mod dictionary;
pub(crate) mod spatial;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

use crate::atlas::{Atlas, AtlasMetadata};
use crate::config::BuildConfig;
use crate::types::{
    Area, Edge, Identifier, ItemType, Line, Node, Point, PolyLine, Polygon, Rectangle, Relation,
    RelationMember, Tags,
};
use columns::{OffsetColumn, PackedContents, PackedTag};
use spatial::GridIndex;

pub use builder::{IntegrityError, PackedAtlasBuilder};
pub use codec::{
    is_binary, load_all, AtlasLoadError, Compression, LoadErrorKind, DEFAULT_MAX_PAYLOAD_BYTES,
    PACKED_FORMAT_VERSION,
};
pub use text::to_text;

type ReverseRelationIndex = HashMap<(ItemType, u32), Vec<u32>>;

/// Immutable columnar atlas.
#[derive(Debug, Clone)]
pub struct PackedAtlas {
    contents: PackedContents,
    spatial: Vec<GridIndex>,
    bounds: Option<Rectangle>,
    relation_index: OnceLock<ReverseRelationIndex>,
}

fn slot(item_type: ItemType) -> usize {
    item_type as usize
}

impl PackedAtlas {
    /// Wrap validated contents, building the derived indices.
    pub(crate) fn from_contents(contents: PackedContents, config: &BuildConfig) -> Self {
        let cell_size = config.spatial_cell_dm7();
        let row_bounds: Vec<Vec<Option<Rectangle>>> = ItemType::ALL
            .into_iter()
            .map(|item_type| Self::row_bounds(&contents, item_type))
            .collect();
        let bounds = row_bounds[..slot(ItemType::Relation)]
            .iter()
            .flatten()
            .flatten()
            .copied()
            .reduce(|a, b| a.combine(&b));
        let spatial = row_bounds
            .into_iter()
            .map(|rows| GridIndex::build(rows, cell_size))
            .collect();
        Self {
            contents,
            spatial,
            bounds,
            relation_index: OnceLock::new(),
        }
    }

    fn row_bounds(contents: &PackedContents, item_type: ItemType) -> Vec<Option<Rectangle>> {
        match item_type {
            ItemType::Node => contents.nodes.locations.iter().map(|l| Some(l.bounds())).collect(),
            ItemType::Point => contents.points.locations.iter().map(|l| Some(l.bounds())).collect(),
            ItemType::Edge => shape_bounds(&contents.edges.shapes),
            ItemType::Area => shape_bounds(&contents.areas.shapes),
            ItemType::Line => shape_bounds(&contents.lines.shapes),
            ItemType::Relation => (0..contents.relations.identifiers.len())
                .map(|row| {
                    let mut visited = HashSet::new();
                    relation_row_bounds(contents, row as u32, &mut visited)
                })
                .collect(),
        }
    }

    pub(crate) fn contents(&self) -> &PackedContents {
        &self.contents
    }

    /// Number of distinct strings in the tag dictionary.
    pub fn dictionary_size(&self) -> usize {
        self.contents.dictionary.len()
    }

    /// Total number of entities.
    pub fn size(&self) -> usize {
        ItemType::ALL.into_iter().map(|t| self.contents.rows(t)).sum()
    }

    fn row(&self, item_type: ItemType, identifier: Identifier) -> Option<usize> {
        self.contents.identifiers(item_type).binary_search(&identifier).ok()
    }

    fn word(&self, index: u32) -> String {
        self.contents.dictionary[index as usize].clone()
    }

    fn tags_at(&self, column: &OffsetColumn<PackedTag>, row: usize) -> Tags {
        column
            .row(row)
            .iter()
            .map(|&(k, v)| (self.word(k), self.word(v)))
            .collect()
    }

    fn edge_identifiers(&self, rows: &[u32]) -> BTreeSet<Identifier> {
        rows.iter()
            .map(|&r| self.contents.edges.identifiers[r as usize])
            .collect()
    }

    fn node_at(&self, row: usize) -> Node {
        let columns = &self.contents.nodes;
        Node {
            identifier: columns.identifiers[row],
            location: columns.locations[row],
            tags: self.tags_at(&columns.tags, row),
            in_edges: self.edge_identifiers(columns.in_edges.row(row)),
            out_edges: self.edge_identifiers(columns.out_edges.row(row)),
        }
    }

    fn edge_at(&self, row: usize) -> Edge {
        let columns = &self.contents.edges;
        let nodes = &self.contents.nodes.identifiers;
        Edge {
            identifier: columns.identifiers[row],
            polyline: PolyLine::new(columns.shapes.row(row).to_vec()),
            tags: self.tags_at(&columns.tags, row),
            start_node: nodes[columns.start_nodes[row] as usize],
            end_node: nodes[columns.end_nodes[row] as usize],
        }
    }

    fn relation_at(&self, row: usize) -> Relation {
        let columns = &self.contents.relations;
        Relation {
            identifier: columns.identifiers[row],
            tags: self.tags_at(&columns.tags, row),
            members: columns
                .members
                .row(row)
                .iter()
                .map(|m| RelationMember {
                    item_type: m.item_type,
                    identifier: self.contents.identifiers(m.item_type)[m.row as usize],
                    role: self.word(m.role),
                })
                .collect(),
        }
    }

    fn reverse_relation_index(&self) -> &ReverseRelationIndex {
        self.relation_index.get_or_init(|| {
            let mut index: ReverseRelationIndex = HashMap::new();
            let members = &self.contents.relations.members;
            for relation_row in 0..members.rows() {
                for member in members.row(relation_row) {
                    let parents = index.entry((member.item_type, member.row)).or_default();
                    if parents.last() != Some(&(relation_row as u32)) {
                        parents.push(relation_row as u32);
                    }
                }
            }
            index
        })
    }
}

fn shape_bounds(shapes: &OffsetColumn<crate::types::Location>) -> Vec<Option<Rectangle>> {
    (0..shapes.rows())
        .map(|row| Rectangle::from_locations(shapes.row(row)))
        .collect()
}

fn relation_row_bounds(contents: &PackedContents, row: u32, visited: &mut HashSet<u32>) -> Option<Rectangle> {
    if !visited.insert(row) {
        return None;
    }
    contents
        .relations
        .members
        .row(row as usize)
        .iter()
        .filter_map(|member| {
            let r = member.row as usize;
            match member.item_type {
                ItemType::Node => Some(contents.nodes.locations[r].bounds()),
                ItemType::Point => Some(contents.points.locations[r].bounds()),
                ItemType::Edge => Rectangle::from_locations(contents.edges.shapes.row(r)),
                ItemType::Area => Rectangle::from_locations(contents.areas.shapes.row(r)),
                ItemType::Line => Rectangle::from_locations(contents.lines.shapes.row(r)),
                ItemType::Relation => relation_row_bounds(contents, member.row, visited),
            }
        })
        .reduce(|a, b| a.combine(&b))
}

impl PartialEq for PackedAtlas {
    fn eq(&self, other: &Self) -> bool {
        crate::atlas::same_contents(self, other)
    }
}

impl Atlas for PackedAtlas {
    fn metadata(&self) -> AtlasMetadata {
        self.contents.metadata.clone()
    }

    fn node(&self, identifier: Identifier) -> Option<Node> {
        self.row(ItemType::Node, identifier).map(|row| self.node_at(row))
    }

    fn edge(&self, identifier: Identifier) -> Option<Edge> {
        self.row(ItemType::Edge, identifier).map(|row| self.edge_at(row))
    }

    fn area(&self, identifier: Identifier) -> Option<Area> {
        let row = self.row(ItemType::Area, identifier)?;
        let columns = &self.contents.areas;
        Some(Area {
            identifier,
            polygon: Polygon::new(columns.shapes.row(row).to_vec()),
            tags: self.tags_at(&columns.tags, row),
        })
    }

    fn line(&self, identifier: Identifier) -> Option<Line> {
        let row = self.row(ItemType::Line, identifier)?;
        let columns = &self.contents.lines;
        Some(Line {
            identifier,
            polyline: PolyLine::new(columns.shapes.row(row).to_vec()),
            tags: self.tags_at(&columns.tags, row),
        })
    }

    fn point(&self, identifier: Identifier) -> Option<Point> {
        let row = self.row(ItemType::Point, identifier)?;
        let columns = &self.contents.points;
        Some(Point {
            identifier,
            location: columns.locations[row],
            tags: self.tags_at(&columns.tags, row),
        })
    }

    fn relation(&self, identifier: Identifier) -> Option<Relation> {
        self.row(ItemType::Relation, identifier).map(|row| self.relation_at(row))
    }

    fn identifiers(&self, item_type: ItemType) -> Vec<Identifier> {
        self.contents.identifiers(item_type).to_vec()
    }

    fn identifiers_intersecting(&self, item_type: ItemType, bounds: &Rectangle) -> Vec<Identifier> {
        let identifiers = self.contents.identifiers(item_type);
        self.spatial[slot(item_type)]
            .query(bounds)
            .into_iter()
            .map(|row| identifiers[row as usize])
            .collect()
    }

    fn relations_with_member(&self, item_type: ItemType, identifier: Identifier) -> BTreeSet<Identifier> {
        let Some(row) = self.row(item_type, identifier) else {
            return BTreeSet::new();
        };
        let relation_ids = &self.contents.relations.identifiers;
        self.reverse_relation_index()
            .get(&(item_type, row as u32))
            .map(|rows| rows.iter().map(|&r| relation_ids[r as usize]).collect())
            .unwrap_or_default()
    }

    fn contains(&self, item_type: ItemType, identifier: Identifier) -> bool {
        self.row(item_type, identifier).is_some()
    }

    fn count(&self, item_type: ItemType) -> usize {
        self.contents.rows(item_type)
    }

    fn relation_bounds(&self, relation: Identifier) -> Option<Rectangle> {
        let row = self.row(ItemType::Relation, relation)?;
        let mut visited = HashSet::new();
        relation_row_bounds(&self.contents, row as u32, &mut visited)
    }

    fn bounds(&self) -> Option<Rectangle> {
        self.bounds
    }
}
