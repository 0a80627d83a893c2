//! Property Sets
//!
//! An artifact is identified entirely by its property bag: an unordered
//! mapping from property name to either a literal string or a reference to
//! an ingested file. The SHA-256 digest over the canonically serialized
//! entries is the store's identity key, so the digest must be stable under
//! insertion order and unambiguous between kinds.
//!
//! ## Digest format
//!
//! Entries are serialized in lexicographic name order, one line each:
//!
//! ```text
//! "name"=s"literal value"
//! "name"=f12
//! ```
//!
//! Names and literal values are quoted with `{:?}` so that embedded quotes
//! or separators cannot collide; the `s`/`f` tag byte separates kinds.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Identifier of an ingested file, assigned by the store.
pub type FileId = u32;

/// A single property value: a literal string or a file reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    Literal(String),
    FileRef(FileId),
}

impl PropertyValue {
    /// The literal string, if this is not a file reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Literal(s) => Some(s),
            PropertyValue::FileRef(_) => None,
        }
    }
}

/// An unordered bag of named properties.
///
/// Once `hash()` has been observed the set is frozen: the digest is the
/// store's identity key, so mutating a hashed set would corrupt the index.
#[derive(Debug, Clone, Default)]
pub struct PropertySet {
    entries: BTreeMap<String, PropertyValue>,
    digest: OnceCell<String>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a literal string property.
    ///
    /// Panics if the set has already been hashed.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.insert(name.into(), PropertyValue::Literal(value.into()));
    }

    /// Add a file-reference property.
    ///
    /// Panics if the set has already been hashed.
    pub fn add_file(&mut self, name: impl Into<String>, file_id: FileId) {
        self.insert(name.into(), PropertyValue::FileRef(file_id));
    }

    fn insert(&mut self, name: String, value: PropertyValue) {
        assert!(
            self.digest.get().is_none(),
            "property set mutated after hashing"
        );
        self.entries.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.entries.get(name)
    }

    /// The literal value of a property, if present and not a file reference.
    pub fn string_value(&self, name: &str) -> Option<&str> {
        self.entries.get(name).and_then(PropertyValue::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in lexicographic name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// True when every entry of `other` appears in `self` with an equal
    /// value. This is the query-filter primitive: an artifact matches a
    /// filter when its properties are a superset of the filter's.
    pub fn contains(&self, other: &PropertySet) -> bool {
        other
            .entries
            .iter()
            .all(|(name, value)| self.entries.get(name) == Some(value))
    }

    /// The stable identity digest of this property set, hex-encoded.
    ///
    /// Deterministic under insertion order; computing it freezes the set.
    pub fn hash(&self) -> &str {
        self.digest.get_or_init(|| {
            let mut canonical = String::new();
            for (name, value) in &self.entries {
                let _ = write!(canonical, "{name:?}=");
                match value {
                    PropertyValue::Literal(s) => {
                        let _ = writeln!(canonical, "s{s:?}");
                    }
                    PropertyValue::FileRef(id) => {
                        let _ = writeln!(canonical, "f{id}");
                    }
                }
            }
            let mut hasher = Sha256::new();
            hasher.update(canonical.as_bytes());
            hex_encode(&hasher.finalize())
        })
    }
}

/// Equality is containment both ways; the cached digest is not compared.
impl PartialEq for PropertySet {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for PropertySet {}

impl Serialize for PropertySet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PropertySet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = BTreeMap::deserialize(deserializer)?;
        Ok(PropertySet {
            entries,
            digest: OnceCell::new(),
        })
    }
}

/// Hex-encode a digest.
pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// SHA-256 of a byte slice, hex-encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

/// SHA-256 of a file's contents, hex-encoded.
pub fn sha256_file(path: &std::path::Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex_encode(&hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn props(pairs: &[(&str, &str)]) -> PropertySet {
        let mut ps = PropertySet::new();
        for (k, v) in pairs {
            ps.add(*k, *v);
        }
        ps
    }

    #[test]
    fn test_contains() {
        let a = props(&[("p", "a")]);
        let b = props(&[("p", "a")]);
        let c = props(&[("p", "a"), ("q", "b")]);

        assert!(a.contains(&b));
        assert!(b.contains(&a));
        assert!(c.contains(&a));
        assert!(!a.contains(&c));
    }

    #[test]
    fn test_equality_is_containment_both_ways() {
        let a = props(&[("p", "a"), ("q", "b")]);
        let b = props(&[("q", "b"), ("p", "a")]);
        assert_eq!(a, b);

        let c = props(&[("p", "a")]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hash_distinguishes_kinds() {
        let mut literal = PropertySet::new();
        literal.add("p", "1");
        let mut fileref = PropertySet::new();
        fileref.add_file("p", 1);
        assert_ne!(literal.hash(), fileref.hash());
    }

    #[test]
    fn test_hash_unambiguous_under_quoting() {
        // the same flattened text, split differently across name/value
        let a = props(&[("p", "a\"=s\"b")]);
        let b = props(&[("p\"=s\"a", "b")]);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    #[should_panic(expected = "mutated after hashing")]
    fn test_no_mutation_after_hash() {
        let mut ps = props(&[("p", "a")]);
        ps.hash();
        ps.add("q", "b");
    }

    #[test]
    fn test_serde_round_trip() {
        let mut ps = PropertySet::new();
        ps.add("type", "a-out");
        ps.add_file("data", 3);
        let json = serde_json::to_string(&ps).expect("serialize");
        let back: PropertySet = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(ps, back);
        assert_eq!(ps.hash(), back.hash());
    }

    proptest! {
        #[test]
        fn hash_deterministic_under_permutation(
            mut pairs in proptest::collection::vec(("[a-z]{1,8}", "[ -~]{0,16}"), 1..8),
            seed in any::<u64>(),
        ) {
            // duplicate names would make insertion order observable
            pairs.sort();
            pairs.dedup_by(|a, b| a.0 == b.0);
            let forward = {
                let mut ps = PropertySet::new();
                for (k, v) in &pairs {
                    ps.add(k.clone(), v.clone());
                }
                ps.hash().to_string()
            };
            // shuffle deterministically from the seed
            let len = pairs.len();
            for i in (1..len).rev() {
                let j = (seed as usize).wrapping_mul(i) % (i + 1);
                pairs.swap(i, j);
            }
            let shuffled = {
                let mut ps = PropertySet::new();
                for (k, v) in &pairs {
                    ps.add(k.clone(), v.clone());
                }
                ps.hash().to_string()
            };
            prop_assert_eq!(forward, shuffled);
        }
    }
}
