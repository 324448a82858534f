//! Store-wide string interning for tag keys, tag values and member roles.

use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct DictionaryInner {
    index: HashMap<String, u32>,
    strings: Vec<String>,
}

/// Build-phase interning table.
///
/// `intern` takes `&self`; insertions are serialized by an internal lock so
/// the table can be shared by cooperating build steps. Frozen atlases only
/// keep the plain string vector.
#[derive(Debug, Default)]
pub struct StringDictionary {
    inner: Mutex<DictionaryInner>,
}

impl StringDictionary {
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `value`, inserting it when first seen.
    pub fn intern(&self, value: &str) -> u32 {
        let mut inner = self.inner.lock();
        if let Some(&index) = inner.index.get(value) {
            return index;
        }
        let index = inner.strings.len() as u32;
        inner.strings.push(value.to_string());
        inner.index.insert(value.to_string(), index);
        index
    }

    /// Number of distinct strings.
    pub fn len(&self) -> usize {
        self.inner.lock().strings.len()
    }

    /// Whether nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting insertions and hand out the table.
    pub fn freeze(self) -> Vec<String> {
        self.inner.into_inner().strings
    }
}
