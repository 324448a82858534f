//! Typed configuration for building, encoding and composing atlases.
//!
//! Every section has production defaults; JSON documents may specify any
//! subset of fields. Environment variables override the loaded values:
//!
//! | Variable | Field |
//! |---|---|
//! | `ATLAS_SNAP_TOLERANCE_METERS` | `build.snap_tolerance_meters` |
//! | `ATLAS_SPATIAL_CELL_DEGREES` | `build.spatial_cell_degrees` |
//! | `ATLAS_COMPRESSION` | `codec.compression` (`none`, `gzip`, `gzip:<level>`) |
//! | `ATLAS_MAX_PAYLOAD_BYTES` | `codec.max_payload_bytes` |
//! | `ATLAS_BORDER_POLICY` | `multi.border_conflict_policy` |
//! | `ATLAS_MULTI_CACHE_CAPACITY` | `multi.cache_capacity` |

use serde::{Deserialize, Serialize};

use crate::atlas::packed::{Compression, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::atlas::BorderConflictPolicy;
use crate::types::geometry::DM7_PER_DEGREE;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration document is not valid JSON for [`AtlasConfig`].
    #[error("Invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),

    /// Environment variable holds an unusable value.
    #[error("Invalid value for {0}: {1}")]
    InvalidEnv(&'static str, String),

    /// Value outside its allowed range.
    #[error("Invalid {0}: {1}")]
    OutOfRange(&'static str, String),
}

/// Builder settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Largest accepted distance between an edge's shape end and its node,
    /// in meters (default: 0.05).
    pub snap_tolerance_meters: f64,
    /// Side of a spatial index cell, in degrees (default: 0.01).
    pub spatial_cell_degrees: f64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            snap_tolerance_meters: 0.05,
            spatial_cell_degrees: 0.01,
        }
    }
}

impl BuildConfig {
    /// Set the snapping tolerance.
    pub fn with_snap_tolerance(mut self, meters: f64) -> Self {
        self.snap_tolerance_meters = meters;
        self
    }

    /// Set the spatial index cell size.
    pub fn with_spatial_cell_degrees(mut self, degrees: f64) -> Self {
        self.spatial_cell_degrees = degrees;
        self
    }

    /// Cell size in fixed-point units, never below one.
    pub fn spatial_cell_dm7(&self) -> i64 {
        ((self.spatial_cell_degrees * DM7_PER_DEGREE).round() as i64).max(1)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.snap_tolerance_meters >= 0.0) {
            return Err(ConfigError::OutOfRange(
                "snap_tolerance_meters",
                self.snap_tolerance_meters.to_string(),
            ));
        }
        if !(self.spatial_cell_degrees > 0.0) {
            return Err(ConfigError::OutOfRange(
                "spatial_cell_degrees",
                self.spatial_cell_degrees.to_string(),
            ));
        }
        Ok(())
    }
}

/// Binary codec settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Payload compression used when saving (default: none).
    pub compression: Compression,
    /// Largest uncompressed payload accepted when loading (default: 4 GiB).
    pub max_payload_bytes: u64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// MultiAtlas settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiAtlasConfig {
    /// How disagreeing copies of a border entity are resolved.
    pub border_conflict_policy: BorderConflictPolicy,
    /// Stitched lookups kept in memory (default: 4096; 0 disables caching).
    pub cache_capacity: usize,
}

impl Default for MultiAtlasConfig {
    fn default() -> Self {
        Self {
            border_conflict_policy: BorderConflictPolicy::default(),
            cache_capacity: 4096,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Builder settings.
    pub build: BuildConfig,
    /// Binary codec settings.
    pub codec: CodecConfig,
    /// MultiAtlas settings.
    pub multi: MultiAtlasConfig,
}

impl AtlasConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.build.validate()?;
        Ok(config)
    }

    /// Apply `ATLAS_*` environment variables.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(value) = lookup("ATLAS_SNAP_TOLERANCE_METERS") {
            self.build.snap_tolerance_meters = parse_env("ATLAS_SNAP_TOLERANCE_METERS", &value)?;
        }
        if let Some(value) = lookup("ATLAS_SPATIAL_CELL_DEGREES") {
            self.build.spatial_cell_degrees = parse_env("ATLAS_SPATIAL_CELL_DEGREES", &value)?;
        }
        if let Some(value) = lookup("ATLAS_COMPRESSION") {
            self.codec.compression = Compression::from_str(&value)
                .ok_or(ConfigError::InvalidEnv("ATLAS_COMPRESSION", value))?;
        }
        if let Some(value) = lookup("ATLAS_MAX_PAYLOAD_BYTES") {
            self.codec.max_payload_bytes = parse_env("ATLAS_MAX_PAYLOAD_BYTES", &value)?;
        }
        if let Some(value) = lookup("ATLAS_BORDER_POLICY") {
            self.multi.border_conflict_policy = BorderConflictPolicy::from_str(&value)
                .ok_or(ConfigError::InvalidEnv("ATLAS_BORDER_POLICY", value))?;
        }
        if let Some(value) = lookup("ATLAS_MULTI_CACHE_CAPACITY") {
            self.multi.cache_capacity = parse_env("ATLAS_MULTI_CACHE_CAPACITY", &value)?;
        }
        self.build.validate()?;
        Ok(self)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv(name, value.to_string()))
}
