//! Label/annotation bag and the metadata update payload
//!
//! The platform metadata endpoint takes a map whose values are either a
//! literal string (set/overwrite) or null (delete). Computing that map
//! from prior and desired state is the differ's whole job: keys present
//! in prior but absent from desired must become explicit null entries or
//! they survive the apply as residue.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Labels and annotations attached to a platform entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }
}

/// The wire form of a metadata update: `None` is serialized as null and
/// deletes the key on the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub labels: BTreeMap<String, Option<String>>,
    pub annotations: BTreeMap<String, Option<String>>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }
}

fn diff_map(
    prior: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> BTreeMap<String, Option<String>> {
    let mut patch = BTreeMap::new();
    for key in prior.keys() {
        if !desired.contains_key(key) {
            patch.insert(key.clone(), None);
        }
    }
    for (key, value) in desired {
        patch.insert(key.clone(), Some(value.clone()));
    }
    patch
}

impl Metadata {
    /// Compute the update payload that transforms `prior` into `desired`.
    ///
    /// Unchanged keys are carried with their (identical) desired value;
    /// the platform treats them as no-ops.
    pub fn diff(prior: &Metadata, desired: &Metadata) -> MetadataPatch {
        MetadataPatch {
            labels: diff_map(&prior.labels, &desired.labels),
            annotations: diff_map(&prior.annotations, &desired.annotations),
        }
    }

    /// Apply a patch to this state. Mirrors the platform semantics; used
    /// by tests to check the round-trip property.
    pub fn apply(&self, patch: &MetadataPatch) -> Metadata {
        fn apply_map(
            state: &BTreeMap<String, String>,
            patch: &BTreeMap<String, Option<String>>,
        ) -> BTreeMap<String, String> {
            let mut next = state.clone();
            for (key, value) in patch {
                match value {
                    Some(v) => {
                        next.insert(key.clone(), v.clone());
                    }
                    None => {
                        next.remove(key);
                    }
                }
            }
            next
        }
        Metadata {
            labels: apply_map(&self.labels, &patch.labels),
            annotations: apply_map(&self.annotations, &patch.annotations),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> Metadata {
        Metadata {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_removed_keys_become_null() {
        let prior = meta(&[("env", "red"), ("team", "core")], &[]);
        let desired = meta(&[("env", "blue")], &[]);

        let patch = Metadata::diff(&prior, &desired);
        assert_eq!(patch.labels.get("team"), Some(&None));
        assert_eq!(patch.labels.get("env"), Some(&Some("blue".to_string())));
    }

    #[test]
    fn test_unchanged_keys_preserve_value_identity() {
        let prior = meta(&[("env", "red")], &[("note", "keep")]);
        let desired = prior.clone();

        let patch = Metadata::diff(&prior, &desired);
        assert_eq!(patch.labels.get("env"), Some(&Some("red".to_string())));
        assert_eq!(patch.annotations.get("note"), Some(&Some("keep".to_string())));
    }

    #[test]
    fn test_apply_round_trip() {
        let cases = [
            (meta(&[], &[]), meta(&[("a", "1")], &[])),
            (meta(&[("a", "1")], &[]), meta(&[], &[])),
            (
                meta(&[("a", "1"), ("b", "2")], &[("x", "y")]),
                meta(&[("b", "3"), ("c", "4")], &[("z", "w")]),
            ),
            (meta(&[("a", "1")], &[]), meta(&[("a", "1")], &[])),
        ];
        for (prior, desired) in cases {
            let patch = Metadata::diff(&prior, &desired);
            assert_eq!(prior.apply(&patch), desired);
        }
    }

    #[test]
    fn test_empty_to_empty_is_empty_patch() {
        let patch = Metadata::diff(&Metadata::default(), &Metadata::default());
        assert!(patch.is_empty());
    }

    #[test]
    fn test_null_serializes_for_deletion() {
        let prior = meta(&[("stale", "v")], &[]);
        let patch = Metadata::diff(&prior, &Metadata::default());
        let json = serde_json::to_string(&patch).unwrap();
        assert!(json.contains("\"stale\":null"));
    }
}
