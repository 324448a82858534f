//! Columnar storage for packed atlases.
//!
//! Each entity type is a group of parallel arrays indexed by row, where row
//! order is ascending identifier order. Variable-length data lives in
//! [`OffsetColumn`]s: row `i` spans `values[offsets[i]..offsets[i + 1]]`.

use serde::{Deserialize, Serialize};

use crate::atlas::AtlasMetadata;
use crate::types::{Identifier, ItemType, Location};

/// Variable-length rows packed into one value array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetColumn<T> {
    offsets: Vec<u32>,
    values: Vec<T>,
}

impl<T> Default for OffsetColumn<T> {
    fn default() -> Self {
        Self {
            offsets: vec![0],
            values: Vec::new(),
        }
    }
}

impl<T> OffsetColumn<T> {
    /// Append one row.
    pub fn push_row(&mut self, row: impl IntoIterator<Item = T>) {
        self.values.extend(row);
        self.offsets.push(self.values.len() as u32);
    }

    /// Values of row `index`.
    pub fn row(&self, index: usize) -> &[T] {
        let start = self.offsets[index] as usize;
        let end = self.offsets[index + 1] as usize;
        &self.values[start..end]
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// All values, across rows.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    fn check(&self, rows: usize, name: &str) -> Result<(), String> {
        if self.rows() != rows {
            return Err(format!("{name}: {} rows, expected {rows}", self.rows()));
        }
        if self.offsets.first() != Some(&0) {
            return Err(format!("{name}: offsets must start at 0"));
        }
        if self.offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(format!("{name}: offsets not monotonic"));
        }
        if self.offsets.last().map(|&o| o as usize) != Some(self.values.len()) {
            return Err(format!("{name}: offsets do not cover values"));
        }
        Ok(())
    }
}

/// Dictionary indices of one tag.
pub type PackedTag = (u32, u32);

/// Relation member as a row index into the member type's columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedMember {
    /// Member variant.
    pub item_type: ItemType,
    /// Row of the member in its type's columns.
    pub row: u32,
    /// Dictionary index of the role.
    pub role: u32,
}

/// Node columns, with edge topology as edge row indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeColumns {
    pub identifiers: Vec<Identifier>,
    pub locations: Vec<Location>,
    pub tags: OffsetColumn<PackedTag>,
    pub in_edges: OffsetColumn<u32>,
    pub out_edges: OffsetColumn<u32>,
}

/// Edge columns, with endpoints as node row indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeColumns {
    pub identifiers: Vec<Identifier>,
    pub shapes: OffsetColumn<Location>,
    pub tags: OffsetColumn<PackedTag>,
    pub start_nodes: Vec<u32>,
    pub end_nodes: Vec<u32>,
}

/// Columns for shape-only entities (areas and lines).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeColumns {
    pub identifiers: Vec<Identifier>,
    pub shapes: OffsetColumn<Location>,
    pub tags: OffsetColumn<PackedTag>,
}

/// Point columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointColumns {
    pub identifiers: Vec<Identifier>,
    pub locations: Vec<Location>,
    pub tags: OffsetColumn<PackedTag>,
}

/// Relation columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationColumns {
    pub identifiers: Vec<Identifier>,
    pub tags: OffsetColumn<PackedTag>,
    pub members: OffsetColumn<PackedMember>,
}

/// Everything a packed atlas serializes: metadata, dictionary and columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedContents {
    pub metadata: AtlasMetadata,
    pub dictionary: Vec<String>,
    pub nodes: NodeColumns,
    pub edges: EdgeColumns,
    pub areas: ShapeColumns,
    pub lines: ShapeColumns,
    pub points: PointColumns,
    pub relations: RelationColumns,
}

fn check_identifiers(identifiers: &[Identifier], name: &str) -> Result<(), String> {
    if identifiers.windows(2).any(|w| w[0] >= w[1]) {
        return Err(format!("{name}: identifiers not strictly ascending"));
    }
    Ok(())
}

fn check_indices(indices: &[u32], bound: usize, name: &str) -> Result<(), String> {
    match indices.iter().find(|&&i| i as usize >= bound) {
        Some(i) => Err(format!("{name}: index {i} out of range {bound}")),
        None => Ok(()),
    }
}

fn check_tags(tags: &OffsetColumn<PackedTag>, rows: usize, words: usize, name: &str) -> Result<(), String> {
    tags.check(rows, name)?;
    match tags.values().iter().find(|(k, v)| *k as usize >= words || *v as usize >= words) {
        Some(tag) => Err(format!("{name}: dictionary index {tag:?} out of range {words}")),
        None => Ok(()),
    }
}

impl PackedContents {
    /// Row count of one type.
    pub fn rows(&self, item_type: ItemType) -> usize {
        self.identifiers(item_type).len()
    }

    /// Identifier column of one type.
    pub fn identifiers(&self, item_type: ItemType) -> &[Identifier] {
        match item_type {
            ItemType::Node => &self.nodes.identifiers,
            ItemType::Edge => &self.edges.identifiers,
            ItemType::Area => &self.areas.identifiers,
            ItemType::Line => &self.lines.identifiers,
            ItemType::Point => &self.points.identifiers,
            ItemType::Relation => &self.relations.identifiers,
        }
    }

    /// Structural sanity check for decoded contents.
    ///
    /// Guarantees every offset and index used by lookups is in range, so a
    /// damaged payload fails here rather than panicking later.
    pub fn validate(&self) -> Result<(), String> {
        let words = self.dictionary.len();
        let nodes = self.nodes.identifiers.len();
        let edges = self.edges.identifiers.len();

        check_identifiers(&self.nodes.identifiers, "nodes")?;
        if self.nodes.locations.len() != nodes {
            return Err("nodes: location column length mismatch".to_string());
        }
        check_tags(&self.nodes.tags, nodes, words, "node tags")?;
        self.nodes.in_edges.check(nodes, "node in-edges")?;
        self.nodes.out_edges.check(nodes, "node out-edges")?;
        check_indices(self.nodes.in_edges.values(), edges, "node in-edges")?;
        check_indices(self.nodes.out_edges.values(), edges, "node out-edges")?;

        check_identifiers(&self.edges.identifiers, "edges")?;
        self.edges.shapes.check(edges, "edge shapes")?;
        check_tags(&self.edges.tags, edges, words, "edge tags")?;
        if self.edges.start_nodes.len() != edges || self.edges.end_nodes.len() != edges {
            return Err("edges: endpoint column length mismatch".to_string());
        }
        check_indices(&self.edges.start_nodes, nodes, "edge start nodes")?;
        check_indices(&self.edges.end_nodes, nodes, "edge end nodes")?;

        for (columns, name) in [(&self.areas, "areas"), (&self.lines, "lines")] {
            let rows = columns.identifiers.len();
            check_identifiers(&columns.identifiers, name)?;
            columns.shapes.check(rows, name)?;
            check_tags(&columns.tags, rows, words, name)?;
        }

        let points = self.points.identifiers.len();
        check_identifiers(&self.points.identifiers, "points")?;
        if self.points.locations.len() != points {
            return Err("points: location column length mismatch".to_string());
        }
        check_tags(&self.points.tags, points, words, "point tags")?;

        let relations = self.relations.identifiers.len();
        check_identifiers(&self.relations.identifiers, "relations")?;
        check_tags(&self.relations.tags, relations, words, "relation tags")?;
        self.relations.members.check(relations, "relation members")?;
        for member in self.relations.members.values() {
            if member.row as usize >= self.rows(member.item_type) {
                return Err(format!(
                    "relation members: {} row {} out of range",
                    member.item_type, member.row
                ));
            }
            if member.role as usize >= words {
                return Err(format!("relation members: role index {} out of range", member.role));
            }
        }
        Ok(())
    }
}
