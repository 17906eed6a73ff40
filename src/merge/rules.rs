//! Domain knowledge the merge processor needs about object types.
//!
//! Nothing here is hard-wired: natural keys, references, last-writer-wins
//! attributes and structural invariants are configured per store.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::revision::{ObjectId, ObjectState};

/// An attribute of `object_type` holding the id of a `target_type` object
/// (or an array of ids).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRule {
    pub object_type: String,
    pub attribute: String,
    pub target_type: String,
}

/// At most one object per group may carry the flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferredRule {
    pub object_type: String,
    pub group_attribute: String,
    pub flag_attribute: String,
    pub flag_value: Value,
}

/// Objects of `edge_type` are hierarchy edges from `source_attribute` to
/// `destination_attribute`; the hierarchy must stay acyclic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyRule {
    pub edge_type: String,
    pub source_attribute: String,
    pub destination_attribute: String,
    /// Only edges whose attributes match all of these count.
    #[serde(default)]
    pub only_if: BTreeMap<String, Value>,
}

impl HierarchyRule {
    pub fn applies_to(&self, state: &ObjectState) -> bool {
        self.only_if
            .iter()
            .all(|(attribute, value)| state.attribute(attribute) == Some(value))
    }

    /// `(source, destination)` node ids of an edge.
    pub fn endpoints(&self, state: &ObjectState) -> Option<(String, String)> {
        let source = value_text(state.attribute(&self.source_attribute)?)?;
        let destination = value_text(state.attribute(&self.destination_attribute)?)?;
        Some((source, destination))
    }
}

/// Identity of an object in the domain, independent of its `ObjectId`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NaturalKey {
    pub object_type: String,
    pub value: String,
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.object_type, self.value)
    }
}

/// Merge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeRules {
    /// object type -> attribute holding its natural key; types not listed
    /// use the object id
    pub natural_keys: BTreeMap<String, String>,
    pub references: Vec<ReferenceRule>,
    /// attributes where a concurrent change resolves silently
    pub last_writer_wins: BTreeSet<String>,
    pub preferred: Vec<PreferredRule>,
    pub hierarchy: Vec<HierarchyRule>,
}

impl MergeRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules for a concept/description/relationship terminology model.
    pub fn terminology() -> Self {
        let reference = |object_type: &str, attribute: &str| ReferenceRule {
            object_type: object_type.to_string(),
            attribute: attribute.to_string(),
            target_type: "concept".to_string(),
        };
        Self {
            natural_keys: BTreeMap::new(),
            references: vec![
                reference("description", "conceptId"),
                reference("relationship", "sourceId"),
                reference("relationship", "destinationId"),
                reference("relationship", "typeId"),
            ],
            last_writer_wins: BTreeSet::from(["effectiveTime".to_string()]),
            preferred: vec![PreferredRule {
                object_type: "description".to_string(),
                group_attribute: "conceptId".to_string(),
                flag_attribute: "preferred".to_string(),
                flag_value: Value::Bool(true),
            }],
            hierarchy: vec![HierarchyRule {
                edge_type: "relationship".to_string(),
                source_attribute: "sourceId".to_string(),
                destination_attribute: "destinationId".to_string(),
                only_if: BTreeMap::from([("typeId".to_string(), Value::String("116680003".to_string()))]),
            }],
        }
    }

    pub fn with_natural_key(mut self, object_type: &str, attribute: &str) -> Self {
        self.natural_keys.insert(object_type.to_string(), attribute.to_string());
        self
    }

    pub fn with_reference(mut self, object_type: &str, attribute: &str, target_type: &str) -> Self {
        self.references.push(ReferenceRule {
            object_type: object_type.to_string(),
            attribute: attribute.to_string(),
            target_type: target_type.to_string(),
        });
        self
    }

    pub fn with_last_writer_wins(mut self, attribute: &str) -> Self {
        self.last_writer_wins.insert(attribute.to_string());
        self
    }

    pub fn with_preferred(mut self, rule: PreferredRule) -> Self {
        self.preferred.push(rule);
        self
    }

    pub fn with_hierarchy(mut self, rule: HierarchyRule) -> Self {
        self.hierarchy.push(rule);
        self
    }

    pub fn natural_key(&self, object: &ObjectId, state: &ObjectState) -> NaturalKey {
        let value = self
            .natural_keys
            .get(object.object_type())
            .and_then(|attribute| state.attribute(attribute))
            .and_then(value_text)
            .unwrap_or_else(|| object.id().to_string());
        NaturalKey {
            object_type: object.object_type().to_string(),
            value,
        }
    }

    /// Objects `state` points at: its container plus configured references.
    pub fn references_of(&self, object: &ObjectId, state: &ObjectState) -> Vec<ObjectId> {
        let mut targets: Vec<ObjectId> = state.container.iter().cloned().collect();
        for rule in self.references.iter().filter(|r| r.object_type == object.object_type()) {
            let ids: Vec<&Value> = match state.attribute(&rule.attribute) {
                Some(Value::Array(items)) => items.iter().collect(),
                Some(value) => vec![value],
                None => Vec::new(),
            };
            for id in ids.into_iter().filter_map(value_text) {
                if let Ok(target) = ObjectId::new(rule.target_type.clone(), id) {
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
            }
        }
        targets
    }

    /// Reference rules whose target is `object_type`.
    pub fn referencing(&self, object_type: &str) -> impl Iterator<Item = &ReferenceRule> {
        let object_type = object_type.to_string();
        self.references.iter().filter(move |r| r.target_type == object_type)
    }

    pub fn is_last_writer_wins(&self, attribute: &str) -> bool {
        self.last_writer_wins.contains(attribute)
    }

    /// Resolve a concurrent change of a last-writer-wins attribute: an unset
    /// value loses, otherwise the later (greater) value wins.
    pub fn last_writer(source: Option<&Value>, target: Option<&Value>) -> Option<Value> {
        let source = source.filter(|v| !v.is_null());
        let target = target.filter(|v| !v.is_null());
        match (source, target) {
            (Some(s), Some(t)) => match compare_values(s, t) {
                Ordering::Less => Some(t.clone()),
                _ => Some(s.clone()),
            },
            (Some(v), None) | (None, Some(v)) => Some(v.clone()),
            (None, None) => None,
        }
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(attributes: Value) -> ObjectState {
        serde_json::from_value(json!({ "attributes": attributes })).unwrap()
    }

    #[test]
    fn test_natural_key_defaults_to_id() {
        let rules = MergeRules::new().with_natural_key("concept", "fsn");
        let concept = ObjectId::new("concept", "1").unwrap();
        let description = ObjectId::new("description", "d1").unwrap();

        let key = rules.natural_key(&concept, &state(json!({"fsn": "Fracture (disorder)"})));
        assert_eq!(key.value, "Fracture (disorder)");
        assert_eq!(rules.natural_key(&concept, &state(json!({}))).value, "1");
        assert_eq!(rules.natural_key(&description, &state(json!({"fsn": "x"}))).value, "d1");
    }

    #[test]
    fn test_references_include_container() {
        let rules = MergeRules::terminology();
        let rel = ObjectId::new("relationship", "r1").unwrap();
        let refs = rules.references_of(
            &rel,
            &state(json!({"sourceId": "1", "destinationId": "2", "typeId": "116680003"}))
                .with_container(ObjectId::new("concept", "1").unwrap()),
        );
        let ids: Vec<String> = refs.iter().map(|r| r.to_string()).collect();
        assert_eq!(ids, vec!["concept:1", "concept:2", "concept:116680003"]);
        assert_eq!(rules.referencing("concept").count(), 4);
    }

    #[test]
    fn test_last_writer_wins() {
        assert_eq!(MergeRules::last_writer(Some(&json!("20240101")), Some(&json!("20240301"))), Some(json!("20240301")));
        assert_eq!(MergeRules::last_writer(Some(&json!(5)), Some(&json!(3))), Some(json!(5)));
        assert_eq!(MergeRules::last_writer(None, Some(&json!("x"))), Some(json!("x")));
        assert_eq!(MergeRules::last_writer(Some(&Value::Null), Some(&json!(1))), Some(json!(1)));
        assert_eq!(MergeRules::last_writer(None, None), None);
    }

    #[test]
    fn test_hierarchy_filter() {
        let rule = &MergeRules::terminology().hierarchy[0];
        let is_a = state(json!({"sourceId": "1", "destinationId": "2", "typeId": "116680003"}));
        let finding_site = state(json!({"sourceId": "1", "destinationId": "2", "typeId": "363698007"}));
        assert!(rule.applies_to(&is_a));
        assert!(!rule.applies_to(&finding_site));
        assert_eq!(rule.endpoints(&is_a), Some(("1".to_string(), "2".to_string())));
    }

    #[test]
    fn test_rules_from_toml() {
        let rules: MergeRules = toml::from_str(
            r#"
            last_writer_wins = ["effectiveTime"]

            [natural_keys]
            concept = "fsn"

            [[references]]
            object_type = "description"
            attribute = "conceptId"
            target_type = "concept"
            "#,
        )
        .unwrap();
        assert_eq!(rules.natural_keys["concept"], "fsn");
        assert!(rules.is_last_writer_wins("effectiveTime"));
        assert_eq!(rules.references.len(), 1);
        assert!(rules.hierarchy.is_empty());
    }
}
