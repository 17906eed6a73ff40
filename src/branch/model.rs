use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::branch::path::BranchPath;
use crate::clock::Timestamp;

/// Freshness of a branch relative to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchState {
    /// Up to date with the parent.
    Active,
    /// The parent committed after this branch's base.
    Stale,
    /// An ancestor was deleted.
    Stray,
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BranchState::Active => "ACTIVE",
            BranchState::Stale => "STALE",
            BranchState::Stray => "STRAY",
        };
        write!(f, "{}", s)
    }
}

/// A named line of revisions forked from its parent at `base_timestamp`.
///
/// Only `Stray` is persisted; `Stale` is derived when the branch is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub path: BranchPath,
    pub parent_path: Option<BranchPath>,
    pub base_timestamp: Timestamp,
    pub head_timestamp: Timestamp,
    pub state: BranchState,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    /// The root branch, starting empty at `timestamp`.
    pub fn root(timestamp: Timestamp) -> Self {
        Self {
            path: BranchPath::main(),
            parent_path: None,
            base_timestamp: timestamp,
            head_timestamp: timestamp,
            state: BranchState::Active,
            deleted: false,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// A new child forked at the parent's current head.
    pub fn fork(parent: &Branch, path: BranchPath, metadata: BTreeMap<String, String>) -> Self {
        Self {
            path,
            parent_path: Some(parent.path.clone()),
            base_timestamp: parent.head_timestamp,
            head_timestamp: parent.head_timestamp,
            state: BranchState::Active,
            deleted: false,
            metadata,
            created_at: Utc::now(),
        }
    }

    pub fn is_main(&self) -> bool {
        self.path.is_main()
    }

    /// True once the branch has commits of its own.
    pub fn has_commits(&self) -> bool {
        self.head_timestamp > self.base_timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_copies_parent_head() {
        let mut main = Branch::root(10);
        main.head_timestamp = 42;
        let child = Branch::fork(&main, BranchPath::new("MAIN/a").unwrap(), BTreeMap::new());

        assert_eq!(child.base_timestamp, 42);
        assert_eq!(child.head_timestamp, 42);
        assert_eq!(child.parent_path, Some(BranchPath::main()));
        assert!(!child.has_commits());
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(Branch::root(5)).unwrap();
        assert_eq!(json["path"], "MAIN");
        assert_eq!(json["baseTimestamp"], 5);
        assert_eq!(json["state"], "ACTIVE");
        assert!(json["parentPath"].is_null());
    }
}
