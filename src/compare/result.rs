use serde::{Deserialize, Serialize};

use crate::branch::BranchPath;
use crate::clock::Timestamp;
use crate::error::{StoreError, StoreResult};
use crate::revision::{ChangeOp, ObjectId};

/// One row of a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionCompareDetail {
    pub object_id: ObjectId,
    pub op: ChangeOp,
    /// True for property changes, false for additions and removals.
    pub is_component_change: bool,
    /// Structural container of the object, or the object itself when it is
    /// top-level.
    pub container: ObjectId,
}

/// Aggregate result of a diff. `details` may be truncated by the request
/// limit; the totals never are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionCompare {
    pub base_branch_path: BranchPath,
    pub compare_path: BranchPath,
    pub compare_head_timestamp: Timestamp,
    pub details: Vec<RevisionCompareDetail>,
    pub total_added: usize,
    pub total_changed: usize,
    pub total_removed: usize,
    /// Distinct containers of the changed rows.
    #[serde(default)]
    pub changed_containers: Vec<ObjectId>,
}

impl RevisionCompare {
    pub fn total(&self) -> usize {
        self.total_added + self.total_changed + self.total_removed
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// True when every counted difference has a detail row.
    pub fn is_complete(&self) -> bool {
        self.details.len() == self.total()
    }
}

/// Wire form of a compare request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareRequest {
    #[serde(default)]
    pub base_path: Option<String>,
    pub compare_path: String,
    #[serde(default = "CompareRequest::default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub exclude_component_changes: bool,
}

impl CompareRequest {
    fn default_limit() -> i64 {
        i64::from(u32::MAX)
    }

    pub fn new(compare_path: impl Into<String>) -> Self {
        Self {
            base_path: None,
            compare_path: compare_path.into(),
            limit: Self::default_limit(),
            exclude_component_changes: false,
        }
    }

    pub fn against(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn exclude_component_changes(mut self, exclude: bool) -> Self {
        self.exclude_component_changes = exclude;
        self
    }

    /// Validate paths and limit.
    pub fn parse(&self) -> StoreResult<(Option<BranchPath>, BranchPath, CompareOptions)> {
        if self.limit < 0 {
            return Err(StoreError::invalid(format!("limit must not be negative, got {}", self.limit)));
        }
        let parse = |raw: &str| {
            BranchPath::new(raw).map_err(|e| StoreError::invalid(format!("branch path '{}': {}", raw, e)))
        };
        let base = self.base_path.as_deref().map(parse).transpose()?;
        let compare = parse(&self.compare_path)?;
        let options = CompareOptions {
            limit: usize::try_from(self.limit).unwrap_or(usize::MAX),
            exclude_component_changes: self.exclude_component_changes,
        };
        Ok((base, compare, options))
    }
}

/// Tuning for a single compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareOptions {
    /// Maximum number of detail rows.
    pub limit: usize,
    /// Report only additions and removals.
    pub exclude_component_changes: bool,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            limit: usize::MAX,
            exclude_component_changes: false,
        }
    }
}

impl CompareOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}
