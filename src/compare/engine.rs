//! Branch compare.
//!
//! Two forms are supported:
//!
//! - `compare(Some(base), compare)`: both heads are diffed over every object
//!   either side touched after the last common ancestor timestamp.
//! - `compare(None, compare)`: the branch's own contribution since its base,
//!   i.e. its state at the base versus its state at the head.
//!
//! Every candidate is classified by its terminal state in the two views, so
//! an object added and then changed inside the window is a single ADD.

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use crate::branch::{Branch, BranchManager, BranchPath};
use crate::cancel::Cancellation;
use crate::clock::Timestamp;
use crate::compare::result::{CompareOptions, RevisionCompare, RevisionCompareDetail};
use crate::error::{StoreError, StoreResult};
use crate::revision::{ChangeOp, ObjectId, ObjectState, ReadChain, RevisionStore};

/// Where two branches split and what each side touched since.
#[derive(Debug, Clone)]
pub(crate) struct Divergence {
    /// Deepest branch both paths descend from (or equal).
    pub ancestor: BranchPath,
    /// Last timestamp both sides share on the ancestor.
    pub since: Timestamp,
    /// The ancestor's state at `since`.
    pub ancestor_view: ReadChain,
    pub left_view: ReadChain,
    pub right_view: ReadChain,
    pub left_touched: BTreeSet<ObjectId>,
    pub right_touched: BTreeSet<ObjectId>,
}

/// Computes differences between branch states.
#[derive(Clone)]
pub struct CompareEngine {
    branches: BranchManager,
    revisions: RevisionStore,
}

impl CompareEngine {
    pub fn new(branches: BranchManager, revisions: RevisionStore) -> Self {
        Self { branches, revisions }
    }

    /// Diff `compare` against `base`, or against its own base when `base` is
    /// omitted.
    pub fn compare(
        &self,
        base: Option<&BranchPath>,
        compare: &BranchPath,
        options: CompareOptions,
        cancel: &Cancellation,
    ) -> StoreResult<RevisionCompare> {
        let compare_branch = match self.branches.get(compare) {
            Ok(branch) => branch,
            Err(e) if e.is_not_found() => {
                return Err(StoreError::invalid(format!("compare branch {} does not exist", compare)));
            }
            Err(e) => return Err(e),
        };

        let (base_path, before_view, after_view, candidates) = match base {
            None => {
                let Some(parent) = compare_branch.parent_path.clone() else {
                    return Err(StoreError::invalid("MAIN has no parent to compare against"));
                };
                let before = self.branches.read_chain(compare, Some(compare_branch.base_timestamp))?;
                let after = self.branches.read_chain(compare, None)?;
                let touched =
                    self.revisions
                        .touched(compare, compare_branch.base_timestamp, compare_branch.head_timestamp)?;
                (parent, before, after, touched)
            }
            Some(base) => {
                if base == compare {
                    return Err(StoreError::invalid(format!("cannot compare {} with itself", compare)));
                }
                self.branches.get(base)?;
                let divergence = self.diverge(base, compare)?;
                let candidates = divergence
                    .left_touched
                    .union(&divergence.right_touched)
                    .cloned()
                    .collect();
                (base.clone(), divergence.left_view, divergence.right_view, candidates)
            }
        };

        let mut result = RevisionCompare {
            base_branch_path: base_path,
            compare_path: compare.clone(),
            compare_head_timestamp: compare_branch.head_timestamp,
            details: Vec::new(),
            total_added: 0,
            total_changed: 0,
            total_removed: 0,
            changed_containers: Vec::new(),
        };

        let before = self.states(&candidates, &before_view)?;
        let after = self.states(&candidates, &after_view)?;
        let mut containers = BTreeSet::new();

        for object in &candidates {
            cancel.check(&format!("compare {}", compare))?;
            let Some(detail) = classify(object, before.get(object), after.get(object)) else {
                continue;
            };
            match detail.op {
                ChangeOp::Add => result.total_added += 1,
                ChangeOp::Remove => result.total_removed += 1,
                ChangeOp::Change => {
                    if options.exclude_component_changes {
                        continue;
                    }
                    result.total_changed += 1;
                    containers.insert(detail.container.clone());
                }
            }
            if result.details.len() < options.limit {
                result.details.push(detail);
            }
        }
        result.changed_containers = containers.into_iter().collect();

        info!(
            base = %result.base_branch_path,
            compare = %compare,
            added = result.total_added,
            changed = result.total_changed,
            removed = result.total_removed,
            rows = result.details.len(),
            "compared branches"
        );
        Ok(result)
    }

    fn states(&self, objects: &BTreeSet<ObjectId>, view: &ReadChain) -> StoreResult<BTreeMap<ObjectId, ObjectState>> {
        Ok(self
            .revisions
            .resolve_many(objects, view)?
            .into_iter()
            .filter_map(|(object, rev)| rev.state().map(|s| (object, s)))
            .collect())
    }

    /// Locate the common ancestor of two branches and the objects each side
    /// touched since they split.
    pub(crate) fn diverge(&self, left: &BranchPath, right: &BranchPath) -> StoreResult<Divergence> {
        let ancestor = left.common_ancestor(right);
        let left_chain = self.branches.chain(left)?;
        let right_chain = self.branches.chain(right)?;

        let (Some(left_fork), Some(right_fork)) = (fork_point(&left_chain, &ancestor), fork_point(&right_chain, &ancestor))
        else {
            return Err(StoreError::Conflict(format!(
                "{} and {} share no common ancestor",
                left, right
            )));
        };
        let since = left_fork.min(right_fork);

        let left_view = ReadChain::new(&left_chain, None);
        let right_view = ReadChain::new(&right_chain, None);
        let ancestor_chain = self.branches.chain(&ancestor)?;
        let ancestor_view = ReadChain::new(&ancestor_chain, Some(since));

        let left_touched = self.touched_since(&left_view, since)?;
        let right_touched = self.touched_since(&right_view, since)?;

        Ok(Divergence {
            ancestor,
            since,
            ancestor_view,
            left_view,
            right_view,
            left_touched,
            right_touched,
        })
    }

    fn touched_since(&self, view: &ReadChain, since: Timestamp) -> StoreResult<BTreeSet<ObjectId>> {
        let mut touched = BTreeSet::new();
        for link in view.links() {
            touched.extend(self.revisions.touched(&link.segment, since, link.bound)?);
        }
        Ok(touched)
    }
}

/// Timestamp at which the chain leaves `ancestor`: the ancestor's head when
/// the chain starts at the ancestor, otherwise the base of the ancestor's
/// child on the chain.
fn fork_point(chain: &[Branch], ancestor: &BranchPath) -> Option<Timestamp> {
    let first = chain.first()?;
    if &first.path == ancestor {
        return Some(first.head_timestamp);
    }
    chain
        .iter()
        .find(|b| b.parent_path.as_ref() == Some(ancestor))
        .map(|b| b.base_timestamp)
}

fn classify(object: &ObjectId, before: Option<&ObjectState>, after: Option<&ObjectState>) -> Option<RevisionCompareDetail> {
    let (op, state) = match (before, after) {
        (None, Some(after)) => (ChangeOp::Add, after),
        (Some(before), None) => (ChangeOp::Remove, before),
        (Some(before), Some(after)) if before != after => (ChangeOp::Change, after),
        _ => return None,
    };
    Some(RevisionCompareDetail {
        object_id: object.clone(),
        op,
        is_component_change: op == ChangeOp::Change,
        container: state.container.clone().unwrap_or_else(|| object.clone()),
    })
}
