//! Human-readable text form of an atlas.
//!
//! ```text
//! # Metadata
//! code_version=0.1.0
//! data_version=2024-01
//! # Nodes
//! 1&&48.3406719,10.5563445&&highway=traffic_signals
//! # Edges
//! 7&&48.3406719,10.5563445:48.3400000,10.5560000&&1&&2&&highway=primary||lanes=2
//! # Relations
//! 9&&edge/7/outer||node/1/&&type=route
//! ```
//!
//! Fields are separated by `&&`, tags by `||` (key and value by `=`), shape
//! points by `:` and relation member parts by `/`. Those reserved characters
//! plus `%` and line breaks are percent-escaped inside strings. Node edge
//! sets are not written; loading goes through the builder which re-derives
//! them and re-checks every invariant.

use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;

use super::codec::{AtlasLoadError, LoadErrorKind};
use super::{PackedAtlas, PackedAtlasBuilder};
use crate::atlas::{Atlas, AtlasMetadata};
use crate::config::BuildConfig;
use crate::types::{AtlasEntity, ItemType, Location, PolyLine, Polygon, RelationMember, Tags};

const FIELD: &str = "&&";
const LIST: &str = "||";

const SECTIONS: [(ItemType, &str); 6] = [
    (ItemType::Node, "# Nodes"),
    (ItemType::Edge, "# Edges"),
    (ItemType::Area, "# Areas"),
    (ItemType::Line, "# Lines"),
    (ItemType::Point, "# Points"),
    (ItemType::Relation, "# Relations"),
];

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '&' => escaped.push_str("%26"),
            '|' => escaped.push_str("%7C"),
            '=' => escaped.push_str("%3D"),
            '/' => escaped.push_str("%2F"),
            '\n' => escaped.push_str("%0A"),
            '\r' => escaped.push_str("%0D"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn unescape(value: &str) -> Result<String, String> {
    let mut bytes = Vec::with_capacity(value.len());
    let mut rest = value.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'%' {
            let code = tail
                .get(..2)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| format!("bad escape in {value:?}"))?;
            bytes.push(code);
            rest = &tail[2..];
        } else {
            bytes.push(byte);
            rest = tail;
        }
    }
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

fn format_tags(tags: &Tags) -> String {
    tags.iter()
        .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
        .collect::<Vec<_>>()
        .join(LIST)
}

fn format_shape(locations: &[Location]) -> String {
    locations
        .iter()
        .map(Location::to_string)
        .collect::<Vec<_>>()
        .join(":")
}

fn format_members(members: &[RelationMember]) -> String {
    members
        .iter()
        .map(|m| format!("{}/{}/{}", m.item_type, m.identifier, escape(&m.role)))
        .collect::<Vec<_>>()
        .join(LIST)
}

fn write_metadata(out: &mut String, metadata: &AtlasMetadata) {
    let _ = writeln!(out, "# Metadata");
    let _ = writeln!(out, "code_version={}", escape(&metadata.code_version));
    let _ = writeln!(out, "data_version={}", escape(&metadata.data_version));
    if let Some(shard) = &metadata.shard_name {
        let _ = writeln!(out, "shard_name={}", escape(shard));
    }
    if let Some(country) = &metadata.country {
        let _ = writeln!(out, "country={}", escape(country));
    }
    for (key, value) in &metadata.tags {
        let _ = writeln!(out, "tag.{}={}", escape(key), escape(value));
    }
}

/// Render any atlas view in the text form.
pub fn to_text(atlas: &dyn Atlas) -> String {
    let mut out = String::new();
    write_metadata(&mut out, &atlas.metadata());
    for (item_type, header) in SECTIONS {
        let _ = writeln!(out, "{header}");
        for entity in atlas.entities(item_type) {
            let line = match &entity {
                AtlasEntity::Node(n) => {
                    [n.identifier.to_string(), n.location.to_string(), format_tags(&n.tags)].join(FIELD)
                }
                AtlasEntity::Edge(e) => [
                    e.identifier.to_string(),
                    format_shape(e.polyline.locations()),
                    e.start_node.to_string(),
                    e.end_node.to_string(),
                    format_tags(&e.tags),
                ]
                .join(FIELD),
                AtlasEntity::Area(a) => {
                    [a.identifier.to_string(), format_shape(a.polygon.locations()), format_tags(&a.tags)].join(FIELD)
                }
                AtlasEntity::Line(l) => {
                    [l.identifier.to_string(), format_shape(l.polyline.locations()), format_tags(&l.tags)].join(FIELD)
                }
                AtlasEntity::Point(p) => {
                    [p.identifier.to_string(), p.location.to_string(), format_tags(&p.tags)].join(FIELD)
                }
                AtlasEntity::Relation(r) => {
                    [r.identifier.to_string(), format_members(&r.members), format_tags(&r.tags)].join(FIELD)
                }
            };
            let _ = writeln!(out, "{line}");
        }
    }
    out
}

#[derive(Clone, Copy)]
enum Section {
    Metadata,
    Entities(ItemType),
}

fn parse_tags(field: &str) -> Result<Tags, String> {
    if field.is_empty() {
        return Ok(Tags::new());
    }
    field
        .split(LIST)
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("tag {pair:?} has no '='"))?;
            Ok((unescape(key)?, unescape(value)?))
        })
        .collect()
}

fn parse_location(field: &str) -> Result<Location, String> {
    Location::parse(field).ok_or_else(|| format!("bad location {field:?}"))
}

fn parse_shape(field: &str) -> Result<Vec<Location>, String> {
    field.split(':').map(parse_location).collect()
}

fn parse_identifier(field: &str) -> Result<i64, String> {
    field.parse().map_err(|_| format!("bad identifier {field:?}"))
}

fn parse_members(field: &str) -> Result<Vec<RelationMember>, String> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split(LIST)
        .map(|member| {
            let mut parts = member.splitn(3, '/');
            let (Some(kind), Some(id), Some(role)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(format!("member {member:?} needs type/id/role"));
            };
            let item_type = ItemType::from_str(kind).ok_or_else(|| format!("unknown member type {kind:?}"))?;
            Ok(RelationMember::new(item_type, parse_identifier(id)?, unescape(role)?))
        })
        .collect()
}

fn expect_fields<'a>(line: &'a str, count: usize) -> Result<Vec<&'a str>, String> {
    let fields: Vec<&str> = line.split(FIELD).collect();
    if fields.len() != count {
        return Err(format!("expected {count} fields, found {}", fields.len()));
    }
    Ok(fields)
}

fn apply_metadata(metadata: &mut AtlasMetadata, line: &str) -> Result<(), String> {
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| format!("metadata line {line:?} has no '='"))?;
    let value = unescape(value)?;
    match key {
        "code_version" => metadata.code_version = value,
        "data_version" => metadata.data_version = value,
        "shard_name" => metadata.shard_name = Some(value),
        "country" => metadata.country = Some(value),
        other => match other.strip_prefix("tag.") {
            Some(tag) => {
                metadata.tags.insert(unescape(tag)?, value);
            }
            None => return Err(format!("unknown metadata key {other:?}")),
        },
    }
    Ok(())
}

fn add_line(builder: &mut PackedAtlasBuilder, item_type: ItemType, line: &str) -> Result<(), LoadErrorKind> {
    let parse = |reason: String| LoadErrorKind::Parse { line: 0, reason };
    match item_type {
        ItemType::Node | ItemType::Point => {
            let f = expect_fields(line, 3).map_err(parse)?;
            let id = parse_identifier(f[0]).map_err(parse)?;
            let location = parse_location(f[1]).map_err(parse)?;
            let tags = parse_tags(f[2]).map_err(parse)?;
            if item_type == ItemType::Node {
                builder.add_node(id, location, tags)?;
            } else {
                builder.add_point(id, location, tags)?;
            }
        }
        ItemType::Edge => {
            let f = expect_fields(line, 5).map_err(parse)?;
            let id = parse_identifier(f[0]).map_err(parse)?;
            let shape = parse_shape(f[1]).map_err(parse)?;
            let start = parse_identifier(f[2]).map_err(parse)?;
            let end = parse_identifier(f[3]).map_err(parse)?;
            let tags = parse_tags(f[4]).map_err(parse)?;
            builder.add_edge(id, PolyLine::new(shape), tags, start, end)?;
        }
        ItemType::Area | ItemType::Line => {
            let f = expect_fields(line, 3).map_err(parse)?;
            let id = parse_identifier(f[0]).map_err(parse)?;
            let shape = parse_shape(f[1]).map_err(parse)?;
            let tags = parse_tags(f[2]).map_err(parse)?;
            if item_type == ItemType::Area {
                builder.add_area(id, Polygon::new(shape), tags)?;
            } else {
                builder.add_line(id, PolyLine::new(shape), tags)?;
            }
        }
        ItemType::Relation => {
            let f = expect_fields(line, 3).map_err(parse)?;
            let id = parse_identifier(f[0]).map_err(parse)?;
            let members = parse_members(f[1]).map_err(parse)?;
            let tags = parse_tags(f[2]).map_err(parse)?;
            builder.add_relation(id, tags, members)?;
        }
    }
    Ok(())
}

impl PackedAtlas {
    /// Render in the text form.
    pub fn to_text(&self) -> String {
        to_text(self)
    }

    /// Write the text form.
    pub fn save_text<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(self.to_text().as_bytes())
    }

    /// Save the text form to a file.
    pub fn save_text_path(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.to_text())
    }

    /// Parse the text form with default build settings.
    pub fn from_text(text: &str) -> Result<Self, AtlasLoadError> {
        Self::from_text_with_config(text, "<memory>", &BuildConfig::default())
    }

    /// Parse the text form read from `resource`.
    pub fn from_text_with_config(text: &str, resource: &str, config: &BuildConfig) -> Result<Self, AtlasLoadError> {
        let fail = |kind: LoadErrorKind| AtlasLoadError::new(resource, kind);
        let mut metadata = AtlasMetadata::default();
        let mut builder = PackedAtlasBuilder::new().with_config(config.clone());
        let mut section: Option<Section> = None;

        for (index, raw) in text.lines().enumerate() {
            let number = index + 1;
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                continue;
            }
            if line.starts_with("# ") {
                section = if line == "# Metadata" {
                    Some(Section::Metadata)
                } else {
                    let found = SECTIONS.iter().find(|(_, header)| *header == line);
                    match found {
                        Some((item_type, _)) => Some(Section::Entities(*item_type)),
                        None => {
                            return Err(fail(LoadErrorKind::Parse {
                                line: number,
                                reason: format!("unknown section {line:?}"),
                            }))
                        }
                    }
                };
                continue;
            }
            match section {
                None => {
                    return Err(fail(LoadErrorKind::Parse {
                        line: number,
                        reason: "content before the first section header".to_string(),
                    }))
                }
                Some(Section::Metadata) => apply_metadata(&mut metadata, line)
                    .map_err(|reason| fail(LoadErrorKind::Parse { line: number, reason }))?,
                Some(Section::Entities(item_type)) => add_line(&mut builder, item_type, line).map_err(|kind| {
                    fail(match kind {
                        LoadErrorKind::Parse { reason, .. } => LoadErrorKind::Parse { line: number, reason },
                        other => other,
                    })
                })?,
            }
        }

        let atlas = builder
            .with_metadata(metadata)
            .build()
            .map_err(|e| fail(LoadErrorKind::Integrity(e)))?;
        tracing::debug!(resource, entities = atlas.size(), "Packed atlas parsed from text");
        Ok(atlas)
    }
}
