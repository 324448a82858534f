//! # atlas-graph
//!
//! Immutable, memory-compact geospatial graph store for map data.
//!
//! An atlas holds six kinds of map features (nodes, edges, areas, lines,
//! points, relations) plus the graph topology between nodes and edges.
//!
//! ## Core Contract
//!
//! 1. Build an atlas once, validate it, then read it concurrently forever
//! 2. Compose atlases: stitch neighboring shards, load shards on demand
//! 3. Describe edits as changes, merge concurrent edits field by field,
//!    and view a base atlas through a change without copying it
//!
//! ## Architecture
//!
//! ```text
//! PackedAtlasBuilder → PackedAtlas ──┬→ MultiAtlas (border stitching)
//!        ↕ binary / text codecs      └→ DynamicAtlas (on-demand shards)
//!
//! FeatureChange → ChangeBuilder → Change → ChangeAtlas(base, change)
//!                       ↑                ↑
//!            FeatureChangeMerger     AtlasDiff(before, after)
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Identifier lists are ascending, entity iteration is by identifier
//! - Locations are fixed-point (degrees × 10⁷), so equality and hashing are exact
//! - Same change contents → identical change fingerprint

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod atlas;
pub mod change;
pub mod canonical;
pub mod config;
pub mod error;

// Re-exports
pub use types::{
    Area, AtlasEntity, CompleteArea, CompleteEdge, CompleteEntity, CompleteLine, CompleteNode,
    CompletePoint, CompleteRelation, Edge, Identifier, ItemType, Line, Location, Node, Point,
    PolyLine, Polygon, Rectangle, Relation, RelationMember, Tags,
};
pub use atlas::{
    multi_from_paths, same_contents, Atlas, AtlasMetadata, BorderConflict, BorderConflictPolicy,
    DynamicAtlas, DynamicAtlasPolicy, MultiAtlas, PackedAtlas, PackedAtlasBuilder, Shard, Sharding,
    SlippyTile, SlippyTileSharding,
};
pub use atlas::packed::{
    is_binary, load_all, to_text, AtlasLoadError, Compression, IntegrityError, LoadErrorKind,
    DEFAULT_MAX_PAYLOAD_BYTES, PACKED_FORMAT_VERSION,
};
pub use change::{
    AtlasDiff, Change, ChangeAtlas, ChangeBuilder, ChangeError, ChangeType, FeatureChange,
    FeatureChangeMerger, MergeError, MergeFailureType,
};
pub use canonical::{canonical_hash, canonical_hash_hex, to_canonical_bytes};
pub use config::{AtlasConfig, BuildConfig, CodecConfig, ConfigError, MultiAtlasConfig};
pub use error::AtlasError;

/// Version of this crate, recorded in the metadata of every built atlas.
pub const ATLAS_CODE_VERSION: &str = env!("CARGO_PKG_VERSION");
