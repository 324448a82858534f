//! Binary container for packed atlases.
//!
//! ## Layout
//!
//! ```text
//! "ATLS" | version: u16 LE | flags: u8 | sha256(payload): [u8; 32] | length: u64 LE | body
//! ```
//!
//! `payload` is the bincode encoding of the columnar contents, dictionary
//! included. When flag bit 0 is set the body is the gzip stream of the
//! payload, otherwise the payload itself; `length` is the body length and
//! the checksum always covers the uncompressed payload.
//!
//! Loading checks magic, version, size limit, checksum and structural
//! sanity before any lookup can touch the data. The uncompressed payload
//! may not exceed [`CodecConfig::max_payload_bytes`].

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use bincode::Options;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::builder::IntegrityError;
use super::columns::PackedContents;
use super::PackedAtlas;
use crate::config::{AtlasConfig, BuildConfig, CodecConfig};

/// Format version written by this crate.
pub const PACKED_FORMAT_VERSION: u16 = 1;

/// Default bound on the uncompressed payload: 4 GiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 1 << 32;

const MAGIC: &[u8; 4] = b"ATLS";
const FLAG_GZIP: u8 = 0b0000_0001;
const HEADER_LEN: usize = 4 + 2 + 1 + 32 + 8;

/// Payload compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Compression {
    /// Store the payload as is.
    #[default]
    None,
    /// Wrap the payload in a gzip stream.
    Gzip {
        /// 0 (fastest) to 9 (smallest).
        level: u32,
    },
}

impl Compression {
    /// Gzip at the default level.
    pub fn gzip() -> Self {
        Self::Gzip { level: 6 }
    }

    /// Parse `none`, `gzip` or `gzip:<level>`.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" => Some(Self::None),
            "gzip" => Some(Self::gzip()),
            other => {
                let level: u32 = other.strip_prefix("gzip:")?.parse().ok()?;
                (level <= 9).then_some(Self::Gzip { level })
            }
        }
    }
}

/// What went wrong while loading one resource.
#[derive(Debug, thiserror::Error)]
pub enum LoadErrorKind {
    /// Reading the resource failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Not a packed atlas container.
    #[error("Bad magic bytes")]
    BadMagic,
    /// Container written by an unknown format version.
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u16),
    /// Payload does not match its recorded digest.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Digest recorded in the header.
        expected: String,
        /// Digest of the payload read.
        actual: String,
    },
    /// Payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),
    /// Decoded contents are structurally inconsistent.
    #[error("Corrupt contents: {0}")]
    Corrupt(String),
    /// Text form could not be parsed.
    #[error("Parse error at line {line}: {reason}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },
    /// Text form parsed but violates atlas invariants.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// Load failure for one named resource.
#[derive(Debug, thiserror::Error)]
#[error("Failed to load atlas from {resource}: {kind}")]
pub struct AtlasLoadError {
    /// Path or name of the resource.
    pub resource: String,
    /// Failure detail.
    pub kind: LoadErrorKind,
}

impl AtlasLoadError {
    /// Attach a resource name to a failure.
    pub fn new(resource: impl Into<String>, kind: impl Into<LoadErrorKind>) -> Self {
        Self {
            resource: resource.into(),
            kind: kind.into(),
        }
    }
}

/// Whether `bytes` start like a binary container.
pub fn is_binary(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC)
}

impl PackedAtlas {
    /// Write the binary container.
    pub fn save<W: Write>(&self, mut writer: W, compression: Compression) -> std::io::Result<()> {
        let payload = bincode::serialize(self.contents()).map_err(std::io::Error::other)?;
        let digest = Sha256::digest(&payload);

        let (flags, body) = match compression {
            Compression::None => (0, payload),
            Compression::Gzip { level } => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(level));
                encoder.write_all(&payload)?;
                (FLAG_GZIP, encoder.finish()?)
            }
        };

        writer.write_all(MAGIC)?;
        writer.write_all(&PACKED_FORMAT_VERSION.to_le_bytes())?;
        writer.write_all(&[flags])?;
        writer.write_all(&digest)?;
        writer.write_all(&(body.len() as u64).to_le_bytes())?;
        writer.write_all(&body)?;

        tracing::debug!(
            entities = self.size(),
            bytes = HEADER_LEN + body.len(),
            compressed = flags & FLAG_GZIP != 0,
            "Packed atlas saved"
        );
        Ok(())
    }

    /// Encode into an in-memory container.
    pub fn to_bytes(&self, compression: Compression) -> std::io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.save(&mut bytes, compression)?;
        Ok(bytes)
    }

    /// Encode with the compression configured in `config`.
    pub fn to_bytes_with_config(&self, config: &CodecConfig) -> std::io::Result<Vec<u8>> {
        self.to_bytes(config.compression)
    }

    /// Save to a file.
    pub fn save_path(&self, path: impl AsRef<Path>, compression: Compression) -> std::io::Result<()> {
        let file = fs::File::create(path.as_ref())?;
        let mut writer = std::io::BufWriter::new(file);
        self.save(&mut writer, compression)?;
        writer.flush()
    }

    /// Save to a file with the compression configured in `config`.
    pub fn save_path_with_config(&self, path: impl AsRef<Path>, config: &CodecConfig) -> std::io::Result<()> {
        self.save_path(path, config.compression)
    }

    /// Decode a container, rebuilding the spatial index with default settings.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AtlasLoadError> {
        Self::from_bytes_with_config(bytes, "<memory>", &BuildConfig::default())
    }

    /// Decode a container read from `resource`, with the default payload limit.
    pub fn from_bytes_with_config(
        bytes: &[u8],
        resource: &str,
        config: &BuildConfig,
    ) -> Result<Self, AtlasLoadError> {
        Self::decode(bytes, resource, config, &CodecConfig::default())
    }

    /// Decode a container read from `resource` under both build and codec settings.
    pub fn decode(
        bytes: &[u8],
        resource: &str,
        config: &BuildConfig,
        codec: &CodecConfig,
    ) -> Result<Self, AtlasLoadError> {
        let fail = |kind: LoadErrorKind| AtlasLoadError::new(resource, kind);
        let limit = codec.max_payload_bytes;
        let too_large = || fail(LoadErrorKind::Corrupt(format!("payload exceeds {limit} bytes")));

        if bytes.len() < HEADER_LEN || !is_binary(bytes) {
            return Err(fail(LoadErrorKind::BadMagic));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != PACKED_FORMAT_VERSION {
            return Err(fail(LoadErrorKind::UnsupportedVersion(version)));
        }
        let flags = bytes[6];
        let expected = &bytes[7..39];
        let mut length = [0u8; 8];
        length.copy_from_slice(&bytes[39..47]);
        let length = u64::from_le_bytes(length) as usize;
        let body = &bytes[HEADER_LEN..];
        if body.len() != length {
            return Err(fail(LoadErrorKind::Corrupt(format!(
                "body is {} bytes, header says {length}",
                body.len()
            ))));
        }

        let payload = if flags & FLAG_GZIP != 0 {
            let mut payload = Vec::new();
            GzDecoder::new(body)
                .take(limit.saturating_add(1))
                .read_to_end(&mut payload)
                .map_err(|e| fail(LoadErrorKind::Decode(e.to_string())))?;
            if payload.len() as u64 > limit {
                return Err(too_large());
            }
            payload
        } else {
            if length as u64 > limit {
                return Err(too_large());
            }
            body.to_vec()
        };

        let actual = Sha256::digest(&payload);
        if actual.as_slice() != expected {
            return Err(fail(LoadErrorKind::ChecksumMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            }));
        }

        let contents: PackedContents = bincode::options()
            .with_fixint_encoding()
            .allow_trailing_bytes()
            .with_limit(payload.len() as u64)
            .deserialize(&payload)
            .map_err(|e| fail(LoadErrorKind::Decode(e.to_string())))?;
        contents.validate().map_err(|e| fail(LoadErrorKind::Corrupt(e)))?;

        tracing::debug!(
            resource,
            bytes = bytes.len(),
            compressed = flags & FLAG_GZIP != 0,
            "Packed atlas loaded"
        );
        Ok(Self::from_contents(contents, config))
    }

    /// Read a binary container from `reader`.
    pub fn load<R: Read>(mut reader: R, resource: &str, config: &BuildConfig) -> Result<Self, AtlasLoadError> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| AtlasLoadError::new(resource, e))?;
        Self::from_bytes_with_config(&bytes, resource, config)
    }

    /// Load a file in either the binary or the text form.
    pub fn load_path(path: impl AsRef<Path>, config: &BuildConfig) -> Result<Self, AtlasLoadError> {
        Self::read_path(path.as_ref(), config, &CodecConfig::default())
    }

    /// Load a file in either form under the full configuration.
    pub fn load_path_with_config(path: impl AsRef<Path>, config: &AtlasConfig) -> Result<Self, AtlasLoadError> {
        Self::read_path(path.as_ref(), &config.build, &config.codec)
    }

    fn read_path(path: &Path, config: &BuildConfig, codec: &CodecConfig) -> Result<Self, AtlasLoadError> {
        let resource = path.display().to_string();
        let bytes = fs::read(path).map_err(|e| AtlasLoadError::new(resource.as_str(), e))?;
        if is_binary(&bytes) {
            return Self::decode(&bytes, &resource, config, codec);
        }
        let text = String::from_utf8(bytes)
            .map_err(|e| AtlasLoadError::new(resource.as_str(), LoadErrorKind::Decode(e.to_string())))?;
        Self::from_text_with_config(&text, &resource, config)
    }
}

/// Load every path, collecting failures instead of stopping at the first.
pub fn load_all<P: AsRef<Path>>(
    paths: impl IntoIterator<Item = P>,
    config: &AtlasConfig,
) -> (Vec<PackedAtlas>, Vec<AtlasLoadError>) {
    let mut atlases = Vec::new();
    let mut errors = Vec::new();
    for path in paths {
        match PackedAtlas::load_path_with_config(path, config) {
            Ok(atlas) => atlases.push(atlas),
            Err(error) => {
                tracing::warn!(resource = %error.resource, error = %error.kind, "Atlas failed to load");
                errors.push(error);
            }
        }
    }
    (atlases, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::{AtlasMetadata, PackedAtlasBuilder};
    use crate::types::{ItemType, Location, PolyLine, RelationMember, Tags};

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn sample() -> PackedAtlas {
        let mut builder = PackedAtlasBuilder::new().with_metadata(AtlasMetadata::default().with_shard_name("9-264-176"));
        builder.add_node(1, Location::from_dm7(0, 0), Tags::new()).unwrap();
        builder.add_node(2, Location::from_dm7(0, 1_000), Tags::new()).unwrap();
        builder
            .add_edge(
                3,
                PolyLine::new(vec![Location::from_dm7(0, 0), Location::from_dm7(0, 1_000)]),
                tags(&[("highway", "service")]),
                1,
                2,
            )
            .unwrap();
        builder
            .add_relation(4, tags(&[("type", "route")]), vec![RelationMember::new(ItemType::Edge, 3, "")])
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_round_trip_plain_and_gzip() {
        let atlas = sample();
        for compression in [Compression::None, Compression::gzip(), Compression::Gzip { level: 1 }] {
            let bytes = atlas.to_bytes(compression).unwrap();
            assert_eq!(PackedAtlas::from_bytes(&bytes).unwrap(), atlas);
        }
    }

    #[test]
    fn test_bad_magic() {
        let error = PackedAtlas::from_bytes(b"NOPE and then some more bytes to pass the header").unwrap_err();
        assert!(matches!(error.kind, LoadErrorKind::BadMagic));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = sample().to_bytes(Compression::None).unwrap();
        bytes[4] = 99;
        let error = PackedAtlas::from_bytes(&bytes).unwrap_err();
        assert!(matches!(error.kind, LoadErrorKind::UnsupportedVersion(99)));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut bytes = sample().to_bytes(Compression::None).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let error = PackedAtlas::from_bytes(&bytes).unwrap_err();
        assert!(matches!(error.kind, LoadErrorKind::ChecksumMismatch { .. }));
        assert_eq!(error.resource, "<memory>");
    }

    #[test]
    fn test_truncated_body() {
        let bytes = sample().to_bytes(Compression::gzip()).unwrap();
        let error = PackedAtlas::from_bytes(&bytes[..bytes.len() - 4]).unwrap_err();
        assert!(matches!(error.kind, LoadErrorKind::Corrupt(_)));
    }

    #[test]
    fn test_configured_compression_is_used() {
        let atlas = sample();
        let config = CodecConfig {
            compression: Compression::gzip(),
            ..CodecConfig::default()
        };
        let bytes = atlas.to_bytes_with_config(&config).unwrap();
        assert_eq!(bytes[6] & FLAG_GZIP, FLAG_GZIP);
        assert_eq!(PackedAtlas::from_bytes(&bytes).unwrap(), atlas);

        let plain = atlas.to_bytes_with_config(&CodecConfig::default()).unwrap();
        assert_eq!(plain[6], 0);
    }

    #[test]
    fn test_payload_limit() {
        let atlas = sample();
        let small = CodecConfig {
            max_payload_bytes: 16,
            ..CodecConfig::default()
        };
        for compression in [Compression::None, Compression::gzip()] {
            let bytes = atlas.to_bytes(compression).unwrap();
            let error = PackedAtlas::decode(&bytes, "small", &BuildConfig::default(), &small).unwrap_err();
            assert!(matches!(error.kind, LoadErrorKind::Corrupt(ref reason) if reason.contains("exceeds 16")));
        }
    }

    #[test]
    fn test_inflated_length_prefix_rejected() {
        // A length prefix far beyond the payload must fail instead of allocating.
        let mut payload = bincode::serialize(sample().contents()).unwrap();
        payload[..8].copy_from_slice(&u64::MAX.to_le_bytes());
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&PACKED_FORMAT_VERSION.to_le_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&Sha256::digest(&payload));
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&payload);

        let error = PackedAtlas::from_bytes(&bytes).unwrap_err();
        assert!(matches!(error.kind, LoadErrorKind::Decode(_)));
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!(Compression::from_str("none"), Some(Compression::None));
        assert_eq!(Compression::from_str("GZIP"), Some(Compression::Gzip { level: 6 }));
        assert_eq!(Compression::from_str("gzip:2"), Some(Compression::Gzip { level: 2 }));
        assert_eq!(Compression::from_str("gzip:12"), None);
        assert_eq!(Compression::from_str("zstd"), None);
    }
}
