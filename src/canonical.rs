//! Canonical serialization for deterministic fingerprints.
//!
//! ## Determinism Guarantees
//!
//! - Stable field order: struct fields serialize in declaration order
//! - Stable collection order: tags, edge sets and changes use ordered maps
//!   and sets, vectors serialize in index order
//! - No floats in hashed data: locations are fixed-point integers

use serde::Serialize;
use xxhash_rust::xxh64::xxh64;

/// Serialize a value to canonical JSON bytes.
///
/// Fails only for values serde_json cannot represent, such as maps with
/// non-string keys.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

/// Compute canonical hash of a serializable value.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<u64, serde_json::Error> {
    Ok(xxh64(&to_canonical_bytes(value)?, 0))
}

/// Compute canonical hash and return as hex string.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(format!("{:016x}", canonical_hash(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Location, Tags};

    #[derive(Serialize)]
    struct Tagged {
        location: Location,
        tags: Tags,
    }

    #[test]
    fn test_determinism() {
        let mut first = Tags::new();
        first.insert("b".to_string(), "2".to_string());
        first.insert("a".to_string(), "1".to_string());
        let mut second = Tags::new();
        second.insert("a".to_string(), "1".to_string());
        second.insert("b".to_string(), "2".to_string());

        let h1 = canonical_hash(&Tagged {
            location: Location::from_dm7(1, 2),
            tags: first,
        })
        .unwrap();
        let h2 = canonical_hash(&Tagged {
            location: Location::from_dm7(1, 2),
            tags: second,
        })
        .unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_hex_width() {
        assert_eq!(canonical_hash_hex(&0u8).unwrap().len(), 16);
    }

    #[test]
    fn test_unrepresentable_value_is_an_error() {
        let mut keyed = std::collections::BTreeMap::new();
        keyed.insert((1, 2), "pair key");
        assert!(canonical_hash(&keyed).is_err());
        assert!(to_canonical_bytes(&keyed).is_err());
    }
}
