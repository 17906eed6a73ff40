use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compare::RevisionCompare;
use crate::error::{StoreError, StoreResult};
use crate::revision::{ChangeOp, ObjectId, ObjectState};

/// One requested change to an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Mutation {
    /// Create an object that is absent on the branch.
    Create {
        object: ObjectId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container: Option<ObjectId>,
        #[serde(default)]
        attributes: BTreeMap<String, Value>,
    },
    /// Replace the attributes of a live object. The container is kept unless
    /// a new one is given.
    Update {
        object: ObjectId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container: Option<ObjectId>,
        #[serde(default)]
        attributes: BTreeMap<String, Value>,
    },
    /// Remove a live object.
    Delete { object: ObjectId },
}

impl Mutation {
    pub fn object(&self) -> &ObjectId {
        match self {
            Mutation::Create { object, .. } | Mutation::Update { object, .. } | Mutation::Delete { object } => object,
        }
    }
}

/// A caller-assembled set of mutations applied by one commit.
///
/// Each object may appear at most once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet {
    mutations: Vec<Mutation>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(mut self, object: ObjectId, state: ObjectState) -> Self {
        self.mutations.push(Mutation::Create {
            object,
            container: state.container,
            attributes: state.attributes,
        });
        self
    }

    pub fn update(mut self, object: ObjectId, attributes: BTreeMap<String, Value>) -> Self {
        self.mutations.push(Mutation::Update {
            object,
            container: None,
            attributes,
        });
        self
    }

    pub fn delete(mut self, object: ObjectId) -> Self {
        self.mutations.push(Mutation::Delete { object });
        self
    }

    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Objects created by this change set.
    pub fn created(&self) -> impl Iterator<Item = (&ObjectId, &BTreeMap<String, Value>)> {
        self.mutations.iter().filter_map(|m| match m {
            Mutation::Create { object, attributes, .. } => Some((object, attributes)),
            _ => None,
        })
    }

    /// Mutations that turn the compare's base state into its compare state.
    ///
    /// `states` must hold the compare-side state of every added or changed
    /// object. Truncated results are refused.
    pub fn from_compare(compare: &RevisionCompare, states: &BTreeMap<ObjectId, ObjectState>) -> StoreResult<Self> {
        if !compare.is_complete() {
            return Err(StoreError::invalid(format!(
                "compare of {} against {} is truncated ({} of {} rows)",
                compare.compare_path,
                compare.base_branch_path,
                compare.details.len(),
                compare.total()
            )));
        }

        let state_of = |object: &ObjectId| {
            states
                .get(object)
                .cloned()
                .ok_or_else(|| StoreError::object_not_found(format!("{} on {}", object, compare.compare_path)))
        };

        compare
            .details
            .iter()
            .map(|detail| -> StoreResult<Mutation> {
                let object = detail.object_id.clone();
                Ok(match detail.op {
                    ChangeOp::Add => {
                        let state = state_of(&object)?;
                        Mutation::Create {
                            object,
                            container: state.container,
                            attributes: state.attributes,
                        }
                    }
                    ChangeOp::Change => {
                        let state = state_of(&object)?;
                        Mutation::Update {
                            object,
                            container: state.container,
                            attributes: state.attributes,
                        }
                    }
                    ChangeOp::Remove => Mutation::Delete { object },
                })
            })
            .collect()
    }

    /// Reject change sets that mention an object twice.
    pub fn validate(&self) -> StoreResult<()> {
        let mut seen = BTreeSet::new();
        for mutation in &self.mutations {
            if !seen.insert(mutation.object()) {
                return Err(StoreError::invalid(format!(
                    "object {} appears more than once in the change set",
                    mutation.object()
                )));
            }
        }
        Ok(())
    }
}

impl FromIterator<Mutation> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = Mutation>>(iter: I) -> Self {
        Self {
            mutations: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn concept(id: &str) -> ObjectId {
        ObjectId::new("concept", id).unwrap()
    }

    #[test]
    fn test_duplicate_objects_rejected() {
        let changes = ChangeSet::new()
            .create(concept("1"), ObjectState::default())
            .delete(concept("1"));
        assert!(matches!(changes.validate(), Err(StoreError::InvalidArgument(_))));

        let ok = ChangeSet::new().create(concept("1"), ObjectState::default()).delete(concept("2"));
        assert!(ok.validate().is_ok());
        assert_eq!(ok.created().count(), 1);
    }

    #[test]
    fn test_from_compare() {
        use crate::branch::BranchPath;
        use crate::compare::RevisionCompareDetail;

        let detail = |id: &str, op: ChangeOp| RevisionCompareDetail {
            object_id: concept(id),
            op,
            is_component_change: op == ChangeOp::Change,
            container: concept(id),
        };
        let mut compare = RevisionCompare {
            base_branch_path: BranchPath::main(),
            compare_path: BranchPath::new("MAIN/a").unwrap(),
            compare_head_timestamp: 9,
            details: vec![detail("1", ChangeOp::Add), detail("2", ChangeOp::Change), detail("3", ChangeOp::Remove)],
            total_added: 1,
            total_changed: 1,
            total_removed: 1,
            changed_containers: vec![concept("2")],
        };
        let states = BTreeMap::from([
            (concept("1"), ObjectState::new(BTreeMap::from([("term".to_string(), json!("new"))]))),
            (concept("2"), ObjectState::default()),
        ]);

        let changes = ChangeSet::from_compare(&compare, &states).unwrap();
        assert_eq!(changes.len(), 3);
        assert!(matches!(&changes.mutations()[0], Mutation::Create { attributes, .. } if attributes["term"] == json!("new")));
        assert!(matches!(&changes.mutations()[2], Mutation::Delete { .. }));

        compare.total_changed = 4;
        assert!(matches!(ChangeSet::from_compare(&compare, &states), Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_json_shape() {
        let json = json!([
            {"op": "create", "object": "concept:1", "attributes": {"term": "Fracture"}},
            {"op": "update", "object": "concept:2", "attributes": {"active": false}},
            {"op": "delete", "object": "description:9"}
        ]);
        let changes: ChangeSet = serde_json::from_value(json).unwrap();
        assert_eq!(changes.len(), 3);
        assert!(matches!(&changes.mutations()[2], Mutation::Delete { object } if object.object_type() == "description"));
    }
}
