//! Persisted commit records and commit-log queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::branch::BranchPath;
use crate::clock::Timestamp;
use crate::revision::{ChangeOp, ObjectId, RevisionRef};

/// Change applied to one object by a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectChange {
    pub object: ObjectId,
    pub op: ChangeOp,
    /// Revision that was visible before the commit.
    #[serde(default)]
    pub before: Option<RevisionRef>,
    /// Revision written by the commit; `None` for removals.
    #[serde(default)]
    pub after: Option<RevisionRef>,
}

/// Where a merge commit's changes came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSource {
    pub source: BranchPath,
    pub source_head: Timestamp,
}

/// An append-only record of one atomic batch of revision changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub id: String,
    pub branch: BranchPath,
    pub timestamp: Timestamp,
    pub author: String,
    pub comment: String,
    pub changes: Vec<ObjectChange>,
    pub change_count: usize,
    #[serde(default)]
    pub merge_source: Option<MergeSource>,
    pub committed_at: DateTime<Utc>,
}

impl Commit {
    pub fn is_merge(&self) -> bool {
        self.merge_source.is_some()
    }
}

/// Commit-log search criteria. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitQuery {
    pub branch: Option<BranchPath>,
    pub author: Option<String>,
    /// Matches the exact comment, or comments where every query word is a
    /// prefix of some comment word (case-insensitive).
    pub comment: Option<String>,
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
    pub limit: Option<usize>,
}

impl CommitQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn branch(mut self, branch: BranchPath) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn between(mut self, from: Option<Timestamp>, to: Option<Timestamp>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn matches_comment(&self, comment: &str) -> bool {
        let Some(query) = &self.comment else {
            return true;
        };
        if comment == query {
            return true;
        }
        let words: Vec<String> = comment.split_whitespace().map(str::to_lowercase).collect();
        let mut terms = query.split_whitespace().map(str::to_lowercase).peekable();
        if terms.peek().is_none() {
            return false;
        }
        terms.all(|term| words.iter().any(|word| word.starts_with(&term)))
    }
}
