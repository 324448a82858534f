//! Crate-wide error type.

use crate::atlas::packed::{AtlasLoadError, IntegrityError};
use crate::change::{ChangeError, MergeError};
use crate::config::ConfigError;

/// Any failure raised by this crate.
#[derive(Debug, thiserror::Error)]
pub enum AtlasError {
    /// Atlas invariant violated while building or overlaying.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// Stored atlas could not be loaded.
    #[error(transparent)]
    Load(#[from] AtlasLoadError),

    /// Two feature changes could not be merged.
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// Change could not be built or decoded.
    #[error(transparent)]
    Change(#[from] ChangeError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Shard fetcher failed.
    #[error("Fetching shard {0} failed: {1}")]
    Fetch(String, String),
}
