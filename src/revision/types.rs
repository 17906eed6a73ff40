//! Object identities and immutable revision records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::branch::BranchPath;
use crate::clock::Timestamp;
use crate::storage::{DocKey, InvalidNameError};

/// Identity of a logical entity, stable across all of its revisions.
///
/// Rendered and serialized as `type:id`, e.g. `concept:138875005`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId {
    object_type: String,
    id: String,
}

impl ObjectId {
    pub fn new(object_type: impl Into<String>, id: impl Into<String>) -> Result<Self, InvalidNameError> {
        let object_type = object_type.into();
        let id = id.into();
        Self::validate_part(&object_type)?;
        Self::validate_part(&id)?;
        Ok(Self { object_type, id })
    }

    fn validate_part(part: &str) -> Result<(), InvalidNameError> {
        let Some(first) = part.chars().next() else {
            return Err(InvalidNameError::Empty);
        };
        if part.len() > 100 {
            return Err(InvalidNameError::TooLong(part.len()));
        }
        if first == '.' {
            return Err(InvalidNameError::InvalidStart(first));
        }
        for (i, c) in part.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && !matches!(c, '_' | '-' | '.') {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }
        Ok(())
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.id)
    }
}

impl FromStr for ObjectId {
    type Err = InvalidNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((object_type, id)) => Self::new(object_type, id),
            None => Err(InvalidNameError::InvalidPath(s.to_string())),
        }
    }
}

impl TryFrom<String> for ObjectId {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectId> for String {
    fn from(object: ObjectId) -> Self {
        object.to_string()
    }
}

/// Kind of change an object went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOp {
    Add,
    Change,
    Remove,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeOp::Add => "ADD",
            ChangeOp::Change => "CHANGE",
            ChangeOp::Remove => "REMOVE",
        };
        write!(f, "{}", s)
    }
}

/// Content of a live object: its structural container and attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ObjectId>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl ObjectState {
    pub fn new(attributes: BTreeMap<String, Value>) -> Self {
        Self {
            container: None,
            attributes,
        }
    }

    pub fn with_container(mut self, container: ObjectId) -> Self {
        self.container = Some(container);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// Pointer to one revision: the segment it lives on and its creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRef {
    pub segment: BranchPath,
    pub created: Timestamp,
}

/// Immutable snapshot of one object on one branch segment, valid over
/// `[created, replaced)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub object: ObjectId,
    pub segment: BranchPath,
    pub created: Timestamp,
    #[serde(default)]
    pub replaced: Option<Timestamp>,
    /// Tombstone marking the object as removed on this segment.
    #[serde(default)]
    pub deleted: bool,
    pub commit_id: String,
    #[serde(default)]
    pub container: Option<ObjectId>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Revision {
    pub fn live(
        object: ObjectId,
        segment: BranchPath,
        created: Timestamp,
        commit_id: impl Into<String>,
        state: ObjectState,
    ) -> Self {
        Self {
            object,
            segment,
            created,
            replaced: None,
            deleted: false,
            commit_id: commit_id.into(),
            container: state.container,
            attributes: state.attributes,
        }
    }

    pub fn tombstone(object: ObjectId, segment: BranchPath, created: Timestamp, commit_id: impl Into<String>) -> Self {
        Self {
            object,
            segment,
            created,
            replaced: None,
            deleted: true,
            commit_id: commit_id.into(),
            container: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Document key: `type@id@segment@created`, with `/` in the segment
    /// encoded as `+` and the timestamp zero-padded so keys sort by time.
    pub fn doc_key(object: &ObjectId, segment: &BranchPath, created: Timestamp) -> Result<DocKey, InvalidNameError> {
        DocKey::new(format!(
            "{}@{}@{}@{:020}",
            object.object_type(),
            object.id(),
            segment.key_segment(),
            created
        ))
    }

    pub fn key(&self) -> Result<DocKey, InvalidNameError> {
        Self::doc_key(&self.object, &self.segment, self.created)
    }

    pub fn reference(&self) -> RevisionRef {
        RevisionRef {
            segment: self.segment.clone(),
            created: self.created,
        }
    }

    /// True if the validity interval contains `timestamp`.
    pub fn is_visible_at(&self, timestamp: Timestamp) -> bool {
        self.created <= timestamp && self.replaced.map_or(true, |replaced| timestamp < replaced)
    }

    /// Object content, or `None` for a tombstone.
    pub fn state(&self) -> Option<ObjectState> {
        if self.deleted {
            return None;
        }
        Some(ObjectState {
            container: self.container.clone(),
            attributes: self.attributes.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concept(id: &str) -> ObjectId {
        ObjectId::new("concept", id).unwrap()
    }

    #[test]
    fn test_object_id_parse_and_display() {
        let id: ObjectId = "description:12345".parse().unwrap();
        assert_eq!(id.object_type(), "description");
        assert_eq!(id.id(), "12345");
        assert_eq!(id.to_string(), "description:12345");

        assert!("nocolon".parse::<ObjectId>().is_err());
        assert!(ObjectId::new("", "1").is_err());
        assert!(ObjectId::new("concept", "a/b").is_err());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"description:12345\"");
    }

    #[test]
    fn test_visibility_interval_is_half_open() {
        let mut rev = Revision::live(concept("1"), BranchPath::main(), 10, "c1", ObjectState::default());
        assert!(!rev.is_visible_at(9));
        assert!(rev.is_visible_at(10));
        assert!(rev.is_visible_at(1_000));

        rev.replaced = Some(20);
        assert!(rev.is_visible_at(19));
        assert!(!rev.is_visible_at(20));
    }

    #[test]
    fn test_doc_key_sorts_by_created() {
        let segment = BranchPath::new("MAIN/task1").unwrap();
        let early = Revision::doc_key(&concept("1"), &segment, 9).unwrap();
        let late = Revision::doc_key(&concept("1"), &segment, 10).unwrap();
        assert_eq!(early.as_str(), "concept@1@MAIN+task1@00000000000000000009");
        assert!(early < late);
    }

    #[test]
    fn test_tombstone_has_no_state() {
        let rev = Revision::tombstone(concept("1"), BranchPath::main(), 5, "c1");
        assert!(rev.deleted);
        assert!(rev.state().is_none());
    }
}
