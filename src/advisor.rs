//! Advisory conflict merge.
//!
//! [`ConflictResolverAdvisor`] folds the competing versions of one document
//! into a single candidate without committing anything:
//!
//! - fields equal in every version are kept as-is
//! - nested objects present in every version are merged field by field
//! - every other field is divergent and handed to a [`MergeStrategy`]
//!
//! The default [`ProvenanceArrayStrategy`] turns a divergent field into an
//! array of `{ "Value", "Sources" }` entries so an operator can see which
//! version contributed what. [`LatestWinsStrategy`] picks the value of the
//! newest version instead, for automated policies.
//!
//! Deleted versions contribute no fields. Metadata is flat, so divergent
//! metadata keys take the newest version's value and are reported in
//! `divergent_fields` with a `@metadata.` prefix.

use crate::document::{ConflictVersion, Metadata};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

/// One version's view of a divergent field. `value` is `None` when the
/// version does not carry the field.
#[derive(Debug, Clone, Copy)]
pub struct FieldCandidate<'a> {
    pub version: &'a ConflictVersion,
    pub value: Option<&'a Value>,
}

/// Policy for fields the versions disagree on.
pub trait MergeStrategy: Send + Sync {
    /// Value to place at `path`. `candidates` are in etag order.
    fn merge_field(&self, path: &str, candidates: &[FieldCandidate<'_>]) -> Value;
}

/// Divergent field becomes `[{ "Value": v, "Sources": [change vectors] }]`,
/// one entry per distinct value in first-seen order.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProvenanceArrayStrategy;

impl MergeStrategy for ProvenanceArrayStrategy {
    fn merge_field(&self, _path: &str, candidates: &[FieldCandidate<'_>]) -> Value {
        let mut entries: Vec<(&Value, Vec<String>)> = Vec::new();
        for candidate in candidates {
            let Some(value) = candidate.value else { continue };
            let source = candidate.version.change_vector.to_string();
            match entries.iter_mut().find(|(seen, _)| *seen == value) {
                Some((_, sources)) => sources.push(source),
                None => entries.push((value, vec![source])),
            }
        }
        Value::Array(
            entries
                .into_iter()
                .map(|(value, sources)| json!({ "Value": value, "Sources": sources }))
                .collect(),
        )
    }
}

/// Divergent field takes the value of the newest version carrying it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestWinsStrategy;

impl MergeStrategy for LatestWinsStrategy {
    fn merge_field(&self, _path: &str, candidates: &[FieldCandidate<'_>]) -> Value {
        candidates
            .iter()
            .filter_map(|c| c.value.map(|v| (c.version.etag, v)))
            .max_by_key(|(etag, _)| *etag)
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null)
    }
}

/// Merge candidate. Not committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MergeResult {
    /// `null` when every version is a deletion.
    pub document: Value,
    pub metadata: Metadata,
    /// Dotted paths that needed the merge strategy.
    pub divergent_fields: Vec<String>,
}

impl MergeResult {
    /// Whether every field merged without the strategy.
    pub fn is_clean(&self) -> bool {
        self.divergent_fields.is_empty()
    }
}

pub struct ConflictResolverAdvisor<'a> {
    versions: Vec<&'a ConflictVersion>,
    strategy: Box<dyn MergeStrategy + 'a>,
}

impl<'a> ConflictResolverAdvisor<'a> {
    pub fn new(versions: impl IntoIterator<Item = &'a ConflictVersion>) -> Self {
        let mut versions: Vec<&ConflictVersion> = versions.into_iter().collect();
        versions.sort_by_key(|v| v.etag);
        Self {
            versions,
            strategy: Box::new(ProvenanceArrayStrategy),
        }
    }

    pub fn with_strategy(mut self, strategy: impl MergeStrategy + 'a) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    pub fn resolve(&self) -> MergeResult {
        let mut divergent = Vec::new();

        let live: Vec<(&ConflictVersion, &Value)> = self
            .versions
            .iter()
            .filter_map(|v| v.body.as_ref().map(|body| (*v, body)))
            .collect();

        let document = if live.is_empty() {
            Value::Null
        } else {
            self.merge_values("", &live, &mut divergent)
        };
        let metadata = self.merge_metadata(&mut divergent);

        MergeResult {
            document,
            metadata,
            divergent_fields: divergent,
        }
    }

    fn merge_values(&self, path: &str, values: &[(&ConflictVersion, &Value)], divergent: &mut Vec<String>) -> Value {
        let first = values[0].1;
        if values.iter().all(|(_, v)| *v == first) {
            return first.clone();
        }

        let objects: Option<Vec<(&ConflictVersion, &Map<String, Value>)>> =
            values.iter().map(|(version, v)| v.as_object().map(|o| (*version, o))).collect();
        let Some(objects) = objects else {
            divergent.push(display_path(path));
            let candidates: Vec<FieldCandidate<'_>> = values
                .iter()
                .map(|(version, v)| FieldCandidate {
                    version: *version,
                    value: Some(*v),
                })
                .collect();
            return self.strategy.merge_field(path, &candidates);
        };

        let names: BTreeSet<&String> = objects.iter().flat_map(|(_, o)| o.keys()).collect();
        let mut merged = Map::new();
        for name in names {
            let field_path = if path.is_empty() {
                name.clone()
            } else {
                format!("{}.{}", path, name)
            };
            let present: Vec<(&ConflictVersion, &Value)> = objects
                .iter()
                .filter_map(|(version, o)| o.get(name).map(|v| (*version, v)))
                .collect();

            let value = if present.len() == objects.len() {
                self.merge_values(&field_path, &present, divergent)
            } else {
                divergent.push(field_path.clone());
                let candidates: Vec<FieldCandidate<'_>> = objects
                    .iter()
                    .map(|(version, o)| FieldCandidate {
                        version: *version,
                        value: o.get(name),
                    })
                    .collect();
                self.strategy.merge_field(&field_path, &candidates)
            };
            merged.insert(name.clone(), value);
        }
        Value::Object(merged)
    }

    fn merge_metadata(&self, divergent: &mut Vec<String>) -> Metadata {
        let names: BTreeSet<&String> = self.versions.iter().flat_map(|v| v.metadata.keys()).collect();
        let mut merged = Metadata::new();
        for name in names {
            let present: Vec<_> = self.versions.iter().filter_map(|v| v.metadata.get(name)).collect();
            let agreed = present.len() == self.versions.len() && present.windows(2).all(|w| w[0] == w[1]);
            if !agreed {
                divergent.push(format!("@metadata.{}", name));
            }
            // Versions are in etag order: the last one carrying the key is newest
            if let Some(value) = present.last() {
                merged.insert(name.clone(), (*value).clone());
            }
        }
        merged
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "(document)".to_string()
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_vector::ChangeVector;
    use crate::document::MetadataValue;
    use chrono::Utc;

    fn version(node: &str, etag: u64, body: Option<Value>) -> ConflictVersion {
        ConflictVersion {
            id: "users/1".into(),
            collection: "Users".into(),
            change_vector: ChangeVector::single(node, 1),
            body,
            metadata: Metadata::new(),
            last_modified: Utc::now(),
            etag,
        }
    }

    #[test]
    fn test_identical_fields_kept_and_differing_flattened() {
        let a = version("A", 1, Some(json!({"name": "ada", "age": 36})));
        let b = version("B", 2, Some(json!({"name": "ada", "age": 37})));
        let result = ConflictResolverAdvisor::new([&a, &b]).resolve();

        assert_eq!(result.document["name"], "ada");
        assert_eq!(
            result.document["age"],
            json!([
                {"Value": 36, "Sources": ["A:1"]},
                {"Value": 37, "Sources": ["B:1"]}
            ])
        );
        assert_eq!(result.divergent_fields, vec!["age"]);
        assert!(!result.is_clean());
    }

    #[test]
    fn test_field_union_and_missing_fields_are_divergent() {
        let a = version("A", 1, Some(json!({"name": "ada"})));
        let b = version("B", 2, Some(json!({"name": "ada", "email": "a@x"})));
        let result = ConflictResolverAdvisor::new([&b, &a]).resolve();

        assert_eq!(result.document["email"], json!([{"Value": "a@x", "Sources": ["B:1"]}]));
        assert_eq!(result.divergent_fields, vec!["email"]);
    }

    #[test]
    fn test_nested_objects_merge_recursively() {
        let a = version("A", 1, Some(json!({"address": {"city": "Paris", "zip": "75001"}})));
        let b = version("B", 2, Some(json!({"address": {"city": "Lyon", "zip": "75001"}})));
        let result = ConflictResolverAdvisor::new([&a, &b]).resolve();

        assert_eq!(result.document["address"]["zip"], "75001");
        assert!(result.document["address"]["city"].is_array());
        assert_eq!(result.divergent_fields, vec!["address.city"]);
    }

    #[test]
    fn test_equal_values_share_one_entry() {
        let a = version("A", 1, Some(json!({"x": 1})));
        let b = version("B", 2, Some(json!({"x": 2})));
        let c = version("C", 3, Some(json!({"x": 1})));
        let result = ConflictResolverAdvisor::new([&a, &b, &c]).resolve();
        assert_eq!(
            result.document["x"],
            json!([
                {"Value": 1, "Sources": ["A:1", "C:1"]},
                {"Value": 2, "Sources": ["B:1"]}
            ])
        );
    }

    #[test]
    fn test_identical_versions_are_clean() {
        let a = version("A", 1, Some(json!({"x": [1, 2]})));
        let b = version("B", 2, Some(json!({"x": [1, 2]})));
        let result = ConflictResolverAdvisor::new([&a, &b]).resolve();
        assert!(result.is_clean());
        assert_eq!(result.document, json!({"x": [1, 2]}));
    }

    #[test]
    fn test_deletions_contribute_nothing() {
        let a = version("A", 1, None);
        let b = version("B", 2, Some(json!({"x": 1})));
        assert_eq!(ConflictResolverAdvisor::new([&a, &b]).resolve().document, json!({"x": 1}));

        let c = version("C", 3, None);
        assert_eq!(ConflictResolverAdvisor::new([&a, &c]).resolve().document, Value::Null);
    }

    #[test]
    fn test_latest_wins_strategy() {
        let a = version("A", 5, Some(json!({"x": 1})));
        let b = version("B", 2, Some(json!({"x": 2})));
        let result = ConflictResolverAdvisor::new([&a, &b])
            .with_strategy(LatestWinsStrategy)
            .resolve();
        assert_eq!(result.document["x"], 1);
        assert_eq!(result.divergent_fields, vec!["x"]);
    }

    #[test]
    fn test_metadata_merge() {
        let mut a = version("A", 1, Some(json!({})));
        let mut b = version("B", 2, Some(json!({})));
        a.metadata.insert("owner".into(), MetadataValue::from("ops"));
        b.metadata.insert("owner".into(), MetadataValue::from("ops"));
        a.metadata.insert("rev".into(), MetadataValue::from(1));
        b.metadata.insert("rev".into(), MetadataValue::from(2));

        let result = ConflictResolverAdvisor::new([&a, &b]).resolve();
        assert_eq!(result.metadata["owner"], MetadataValue::from("ops"));
        assert_eq!(result.metadata["rev"], MetadataValue::from(2));
        assert_eq!(result.divergent_fields, vec!["@metadata.rev"]);
    }

    #[test]
    fn test_result_serializes_pascal_case() {
        let a = version("A", 1, Some(json!({"x": 1})));
        let json = serde_json::to_value(ConflictResolverAdvisor::new([&a]).resolve()).unwrap();
        assert_eq!(json["Document"]["x"], 1);
        assert!(json["DivergentFields"].as_array().unwrap().is_empty());
    }
}
