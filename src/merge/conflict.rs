//! Merge conflicts.
//!
//! The set of conflict kinds is closed; every kind names the objects involved
//! and renders a message for the merge report.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::revision::ObjectId;

/// Kind of a merge conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    DuplicateIdentity,
    AddedVsDetached,
    AttributeConflict,
    InvariantViolation,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictKind::DuplicateIdentity => "DUPLICATE_IDENTITY",
            ConflictKind::AddedVsDetached => "ADDED_VS_DETACHED",
            ConflictKind::AttributeConflict => "ATTRIBUTE_CONFLICT",
            ConflictKind::InvariantViolation => "INVARIANT_VIOLATION",
        };
        f.write_str(name)
    }
}

/// A reason a merge cannot be applied automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conflict {
    /// Both sides created an object with the same natural key.
    DuplicateIdentity {
        source: ObjectId,
        target: ObjectId,
        natural_key: String,
    },
    /// One side added an object that references something the other side
    /// removed.
    AddedVsDetached { added: ObjectId, detached: ObjectId },
    /// Both sides changed the same attribute to different values.
    AttributeConflict {
        object: ObjectId,
        attribute: String,
        source_value: Option<Value>,
        target_value: Option<Value>,
    },
    /// The merged state would break a structural invariant.
    InvariantViolation {
        object: ObjectId,
        related: Option<ObjectId>,
        message: String,
    },
}

impl Conflict {
    pub fn kind(&self) -> ConflictKind {
        match self {
            Conflict::DuplicateIdentity { .. } => ConflictKind::DuplicateIdentity,
            Conflict::AddedVsDetached { .. } => ConflictKind::AddedVsDetached,
            Conflict::AttributeConflict { .. } => ConflictKind::AttributeConflict,
            Conflict::InvariantViolation { .. } => ConflictKind::InvariantViolation,
        }
    }

    /// Primary object of the conflict.
    pub fn object_a(&self) -> &ObjectId {
        match self {
            Conflict::DuplicateIdentity { source, .. } => source,
            Conflict::AddedVsDetached { added, .. } => added,
            Conflict::AttributeConflict { object, .. } | Conflict::InvariantViolation { object, .. } => object,
        }
    }

    /// Second object involved, when there is one.
    pub fn object_b(&self) -> Option<&ObjectId> {
        match self {
            Conflict::DuplicateIdentity { target, .. } => Some(target),
            Conflict::AddedVsDetached { detached, .. } => Some(detached),
            Conflict::AttributeConflict { .. } => None,
            Conflict::InvariantViolation { related, .. } => related.as_ref(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Conflict::DuplicateIdentity {
                source,
                target,
                natural_key,
            } => format!("{} and {} were both added with natural key {}", source, target, natural_key),
            Conflict::AddedVsDetached { added, detached } => {
                format!("{} was added referencing {}, which was removed on the other side", added, detached)
            }
            Conflict::AttributeConflict {
                object,
                attribute,
                source_value,
                target_value,
            } => format!(
                "{}.{} changed on both sides (source {}, target {})",
                object,
                attribute,
                display_value(source_value.as_ref()),
                display_value(target_value.as_ref())
            ),
            Conflict::InvariantViolation { message, .. } => message.clone(),
        }
    }

    /// Flat form used in merge results.
    pub fn report(&self) -> ConflictReport {
        ConflictReport {
            kind: self.kind(),
            object_a: self.object_a().clone(),
            object_b: self.object_b().cloned(),
            message: self.message(),
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

fn display_value(value: Option<&Value>) -> String {
    value.map_or_else(|| "unset".to_string(), Value::to_string)
}

/// Wire form of a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub kind: ConflictKind,
    pub object_a: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_b: Option<ObjectId>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_report_shape() {
        let conflict = Conflict::DuplicateIdentity {
            source: ObjectId::new("concept", "y1").unwrap(),
            target: ObjectId::new("concept", "y2").unwrap(),
            natural_key: "concept/Burn".to_string(),
        };
        assert_eq!(conflict.kind(), ConflictKind::DuplicateIdentity);

        let report = serde_json::to_value(conflict.report()).unwrap();
        assert_eq!(report["kind"], json!("DUPLICATE_IDENTITY"));
        assert_eq!(report["objectA"], json!("concept:y1"));
        assert_eq!(report["objectB"], json!("concept:y2"));
        assert!(report["message"].as_str().unwrap().contains("concept/Burn"));
    }

    #[test]
    fn test_attribute_conflict_message() {
        let conflict = Conflict::AttributeConflict {
            object: ObjectId::new("concept", "1").unwrap(),
            attribute: "term".to_string(),
            source_value: Some(json!("a")),
            target_value: None,
        };
        assert_eq!(conflict.object_b(), None);
        assert_eq!(
            conflict.to_string(),
            "ATTRIBUTE_CONFLICT: concept:1.term changed on both sides (source \"a\", target unset)"
        );
    }
}
