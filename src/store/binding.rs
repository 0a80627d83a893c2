//! Binding values and bindings records.
//!
//! A query result maps each binding variable to either a single artifact
//! (`for-each`) or the whole matching set (`for-all`). Equality over
//! bindings records is by sorted artifact-id set per variable, and a
//! singleton is never equal to a one-element set: the two shapes carry
//! different scheduling semantics.

use super::{Artifact, ArtifactId};
use std::collections::BTreeMap;

/// The value bound to one query variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingValue {
    /// One artifact, bound by a `for-each` query binding.
    Single(Artifact),
    /// The full matching set of a `for-all` query binding. May be empty.
    Set(Vec<Artifact>),
}

impl BindingValue {
    pub fn artifacts(&self) -> &[Artifact] {
        match self {
            BindingValue::Single(artifact) => std::slice::from_ref(artifact),
            BindingValue::Set(artifacts) => artifacts,
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, BindingValue::Single(_))
    }

    fn sorted_ids(&self) -> Vec<ArtifactId> {
        let mut ids: Vec<ArtifactId> = self.artifacts().iter().map(|a| a.id).collect();
        ids.sort_unstable();
        ids
    }
}

/// A bindings record: variable name to bound value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    by_name: BTreeMap<String, BindingValue>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_single(&mut self, name: impl Into<String>, artifact: Artifact) {
        self.by_name.insert(name.into(), BindingValue::Single(artifact));
    }

    pub fn add_set(&mut self, name: impl Into<String>, artifacts: Vec<Artifact>) {
        self.by_name.insert(name.into(), BindingValue::Set(artifacts));
    }

    pub fn get(&self, name: &str) -> Option<&BindingValue> {
        self.by_name.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BindingValue)> {
        self.by_name.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Every artifact id referenced by any binding.
    pub fn referenced_ids(&self) -> Vec<ArtifactId> {
        self.by_name
            .values()
            .flat_map(|v| v.artifacts().iter().map(|a| a.id))
            .collect()
    }

    /// Bindings equivalence: per variable, the sorted artifact-id sets match
    /// and singleton-ness matches.
    pub fn same_as(&self, other: &Bindings) -> bool {
        if self.by_name.len() != other.by_name.len() {
            return false;
        }
        self.by_name.iter().all(|(name, value)| {
            other.by_name.get(name).is_some_and(|other_value| {
                value.is_single() == other_value.is_single()
                    && value.sorted_ids() == other_value.sorted_ids()
            })
        })
    }

    /// Apply `transform` to every bound artifact, preserving shape. Used by
    /// the coordinator to localize file-valued properties before rendering.
    pub fn transform(&self, mut transform: impl FnMut(&Artifact) -> Artifact) -> Bindings {
        let by_name = self
            .by_name
            .iter()
            .map(|(name, value)| {
                let mapped = match value {
                    BindingValue::Single(a) => BindingValue::Single(transform(a)),
                    BindingValue::Set(list) => {
                        BindingValue::Set(list.iter().map(&mut transform).collect())
                    }
                };
                (name.clone(), mapped)
            })
            .collect();
        Bindings { by_name }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::PropertySet;

    fn artifact(id: ArtifactId) -> Artifact {
        Artifact {
            id,
            props: PropertySet::new(),
        }
    }

    #[test]
    fn test_same_as_ignores_set_order() {
        let mut a = Bindings::new();
        a.add_set("multi", vec![artifact(2), artifact(1)]);
        let mut b = Bindings::new();
        b.add_set("multi", vec![artifact(1), artifact(2)]);
        assert!(a.same_as(&b));
    }

    #[test]
    fn test_singleton_not_equal_to_one_element_set() {
        let mut a = Bindings::new();
        a.add_single("var", artifact(1));
        let mut b = Bindings::new();
        b.add_set("var", vec![artifact(1)]);
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_same_as_differing_names() {
        let mut a = Bindings::new();
        a.add_single("x", artifact(1));
        let mut b = Bindings::new();
        b.add_single("y", artifact(1));
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_empty_records_equal() {
        assert!(Bindings::new().same_as(&Bindings::new()));
    }

    #[test]
    fn test_transform_preserves_shape() {
        let mut bindings = Bindings::new();
        bindings.add_single("one", artifact(1));
        bindings.add_set("many", vec![artifact(2), artifact(3)]);

        let mapped = bindings.transform(|a| {
            let mut props = PropertySet::new();
            props.add("seen", a.id.to_string());
            Artifact { id: a.id, props }
        });

        assert!(mapped.get("one").expect("one").is_single());
        assert_eq!(mapped.get("many").expect("many").artifacts().len(), 2);
        assert_eq!(
            mapped.get("one").expect("one").artifacts()[0]
                .props
                .string_value("seen"),
            Some("1")
        );
    }
}
