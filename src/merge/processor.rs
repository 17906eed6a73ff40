//! Merge processor.
//!
//! A merge moves through fixed phases, tracked in the type of the pending
//! merge so a conflicted merge can never be applied:
//!
//! ```text
//!   Preparing ──prepare()──▶ Detecting ──detect()──┬──▶ Clean ──apply()──▶ APPLIED
//!                                                  └──▶ Conflicted ──reject()──▶ REJECTED
//! ```
//!
//! Both branches stay write-locked from preparation until the outcome is
//! known. Changes are computed per side against the common ancestor state;
//! conflict rules run in precedence order and the first rule that fires for
//! an object decides its conflicts. A clean merge is checked against the
//! structural invariants on the simulated merged state before anything is
//! written.
//!
//! Direction decides what else moves:
//!
//! - source is a descendant of target (promote): changes land on the target,
//!   the source base stays where it is
//! - source is the target's parent (rebase): the target base moves to the
//!   source head, and only changes the target's own revisions shadow are
//!   written
//! - otherwise: changes land on the target

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::branch::{Branch, BranchManager, BranchPath, BranchState};
use crate::cancel::Cancellation;
use crate::clock::Timestamp;
use crate::commit::coordinator::PublishOptions;
use crate::commit::{BranchWriteGuard, ChangeSet, Commit, CommitCoordinator, MergeSource, Mutation};
use crate::compare::CompareEngine;
use crate::error::{StoreError, StoreResult};
use crate::merge::conflict::{Conflict, ConflictKind, ConflictReport};
use crate::merge::invariants::{self, MergedView};
use crate::merge::rules::{MergeRules, NaturalKey};
use crate::revision::{ChangeOp, ObjectId, ObjectState, ReadChain, RevisionStore};

/// A request to merge `source` into `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    #[serde(rename = "sourcePath")]
    pub source: BranchPath,
    #[serde(rename = "targetPath")]
    pub target: BranchPath,
    /// Record the merge as a plain commit without merge provenance.
    #[serde(default)]
    pub squash: bool,
    #[serde(default = "MergeRequest::default_author")]
    pub author: String,
    #[serde(default)]
    pub comment: Option<String>,
}

impl MergeRequest {
    fn default_author() -> String {
        "merge".to_string()
    }

    pub fn new(source: BranchPath, target: BranchPath) -> Self {
        Self {
            source,
            target,
            squash: false,
            author: Self::default_author(),
            comment: None,
        }
    }

    pub fn squash(mut self, squash: bool) -> Self {
        self.squash = squash;
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStatus {
    Applied,
    Rejected,
}

/// What a merge did.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub source: BranchPath,
    pub target: BranchPath,
    pub status: MergeStatus,
    /// Commit written on the target; `None` when nothing needed writing.
    pub commit: Option<Commit>,
    pub conflicts: Vec<Conflict>,
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        self.status == MergeStatus::Applied
    }

    pub fn commit_id(&self) -> Option<&str> {
        self.commit.as_ref().map(|c| c.id.as_str())
    }

    /// Wire form of the outcome.
    pub fn result(&self) -> MergeResult {
        MergeResult {
            status: self.status,
            commit_id: self.commit_id().map(str::to_string),
            conflicts: self.conflicts.iter().map(Conflict::report).collect(),
        }
    }
}

/// Merge result as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub status: MergeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
    #[serde(default)]
    pub conflicts: Vec<ConflictReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Promote,
    Rebase,
    Sideways,
}

impl Direction {
    fn of(source: &BranchPath, target: &BranchPath) -> Self {
        if target.is_ancestor_of(source) {
            Direction::Promote
        } else if target.parent().as_ref() == Some(source) {
            Direction::Rebase
        } else {
            Direction::Sideways
        }
    }
}

/// One side's change to an object since the common ancestor.
#[derive(Debug, Clone)]
struct SideChange {
    op: ChangeOp,
    /// State at the side's head; `None` for removals.
    after: Option<ObjectState>,
}

impl SideChange {
    fn between(before: Option<&ObjectState>, after: Option<&ObjectState>) -> Option<Self> {
        let op = match (before, after) {
            (None, Some(_)) => ChangeOp::Add,
            (Some(_), None) => ChangeOp::Remove,
            (Some(b), Some(a)) if b != a => ChangeOp::Change,
            _ => return None,
        };
        Some(Self {
            op,
            after: after.cloned(),
        })
    }

    fn added(&self) -> Option<&ObjectState> {
        match self.op {
            ChangeOp::Add => self.after.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct ChangePair {
    object: ObjectId,
    /// State in the common ancestor.
    before: Option<ObjectState>,
    source: Option<SideChange>,
    target: Option<SideChange>,
}

/// Lookup tables shared by the conflict rules.
struct Detector<'a> {
    rules: &'a MergeRules,
    target_adds: BTreeMap<NaturalKey, (&'a ObjectId, &'a ObjectState)>,
    source_removed: BTreeSet<&'a ObjectId>,
    target_removed: BTreeSet<&'a ObjectId>,
}

impl<'a> Detector<'a> {
    fn new(rules: &'a MergeRules, pairs: &'a BTreeMap<ObjectId, ChangePair>) -> Self {
        let removed = |side: &Option<SideChange>| side.as_ref().is_some_and(|c| c.op == ChangeOp::Remove);
        Self {
            rules,
            target_adds: pairs
                .values()
                .filter_map(|p| {
                    let state = p.target.as_ref()?.added()?;
                    Some((rules.natural_key(&p.object, state), (&p.object, state)))
                })
                .collect(),
            source_removed: pairs.values().filter(|p| removed(&p.source)).map(|p| &p.object).collect(),
            target_removed: pairs.values().filter(|p| removed(&p.target)).map(|p| &p.object).collect(),
        }
    }
}

type Rule = fn(&Detector<'_>, &ChangePair) -> Vec<Conflict>;

/// Conflict rules in precedence order.
const RULES: [(ConflictKind, Rule); 3] = [
    (ConflictKind::DuplicateIdentity, duplicate_identity as Rule),
    (ConflictKind::AddedVsDetached, added_vs_detached as Rule),
    (ConflictKind::AttributeConflict, attribute_conflict as Rule),
];

/// Source added an object whose natural key the target also added.
/// Identical additions of the same object are not a conflict.
fn duplicate_identity(detector: &Detector<'_>, pair: &ChangePair) -> Vec<Conflict> {
    let Some(state) = pair.source.as_ref().and_then(SideChange::added) else {
        return Vec::new();
    };
    let key = detector.rules.natural_key(&pair.object, state);
    match detector.target_adds.get(&key) {
        Some((other, other_state)) if !(*other == &pair.object && *other_state == state) => {
            vec![Conflict::DuplicateIdentity {
                source: pair.object.clone(),
                target: (*other).clone(),
                natural_key: key.to_string(),
            }]
        }
        _ => Vec::new(),
    }
}

/// One side added an object pointing at something the other side removed.
fn added_vs_detached(detector: &Detector<'_>, pair: &ChangePair) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for (side, removed_elsewhere) in [
        (&pair.source, &detector.target_removed),
        (&pair.target, &detector.source_removed),
    ] {
        let Some(state) = side.as_ref().and_then(SideChange::added) else {
            continue;
        };
        for reference in detector.rules.references_of(&pair.object, state) {
            if removed_elsewhere.contains(&reference) {
                conflicts.push(Conflict::AddedVsDetached {
                    added: pair.object.clone(),
                    detached: reference,
                });
            }
        }
    }
    conflicts
}

/// Both sides changed the same attribute differently.
fn attribute_conflict(detector: &Detector<'_>, pair: &ChangePair) -> Vec<Conflict> {
    let (Some(source), Some(target)) = (
        pair.source.as_ref().and_then(|c| c.after.as_ref()),
        pair.target.as_ref().and_then(|c| c.after.as_ref()),
    ) else {
        return Vec::new();
    };
    if source == target {
        return Vec::new();
    }
    three_way(detector.rules, &pair.object, pair.before.as_ref(), source, target)
        .err()
        .unwrap_or_default()
}

/// Pick the merged value: equal sides agree, otherwise the side that moved
/// away from the ancestor wins. `None` when both moved differently.
fn settle<T: PartialEq>(before: Option<T>, source: Option<T>, target: Option<T>) -> Option<Option<T>> {
    if source == target {
        Some(source)
    } else if source == before {
        Some(target)
    } else if target == before {
        Some(source)
    } else {
        None
    }
}

/// Attribute-wise three-way merge of two changed states.
fn three_way(
    rules: &MergeRules,
    object: &ObjectId,
    before: Option<&ObjectState>,
    source: &ObjectState,
    target: &ObjectState,
) -> Result<ObjectState, Vec<Conflict>> {
    let mut conflicts = Vec::new();
    let mut merged = ObjectState::default();

    let container = settle(
        before.and_then(|b| b.container.as_ref()),
        source.container.as_ref(),
        target.container.as_ref(),
    );
    match container {
        Some(container) => merged.container = container.cloned(),
        None => conflicts.push(Conflict::AttributeConflict {
            object: object.clone(),
            attribute: "container".to_string(),
            source_value: source.container.as_ref().map(|c| Value::String(c.to_string())),
            target_value: target.container.as_ref().map(|c| Value::String(c.to_string())),
        }),
    }

    let names: BTreeSet<&String> = source
        .attributes
        .keys()
        .chain(target.attributes.keys())
        .chain(before.into_iter().flat_map(|b| b.attributes.keys()))
        .collect();
    for name in names {
        let (b, s, t) = (
            before.and_then(|b| b.attribute(name)),
            source.attribute(name),
            target.attribute(name),
        );
        let value = match settle(b, s, t) {
            Some(value) => value.cloned(),
            None if rules.is_last_writer_wins(name) => MergeRules::last_writer(s, t),
            None => {
                conflicts.push(Conflict::AttributeConflict {
                    object: object.clone(),
                    attribute: name.clone(),
                    source_value: s.cloned(),
                    target_value: t.cloned(),
                });
                continue;
            }
        };
        if let Some(value) = value {
            merged.attributes.insert(name.clone(), value);
        }
    }

    if conflicts.is_empty() {
        Ok(merged)
    } else {
        Err(conflicts)
    }
}

/// Marker for a merge that has locked both branches.
pub(crate) struct Preparing;
/// Marker for a merge whose per-side changes are known.
pub(crate) struct Detecting;
/// Marker for a merge with no conflicts and a staged result.
pub(crate) struct Clean;
/// Marker for a merge that must be rejected.
pub(crate) struct Conflicted;

struct MergeContext<'a> {
    processor: &'a MergeProcessor,
    guard: &'a BranchWriteGuard<'a>,
    request: &'a MergeRequest,
    cancel: &'a Cancellation,
    source: Branch,
    target: Branch,
    direction: Direction,
    /// New target base, for rebases that move it.
    new_base: Option<Timestamp>,
    /// Target state the merge result is written through.
    effective_view: ReadChain,
    pairs: BTreeMap<ObjectId, ChangePair>,
    /// Merged state of every object either side changed; `None` removes it.
    staged: BTreeMap<ObjectId, Option<ObjectState>>,
    conflicts: Vec<Conflict>,
}

/// A merge in progress; `State` is its phase.
pub(crate) struct PendingMerge<'a, State> {
    ctx: MergeContext<'a>,
    _state: PhantomData<State>,
}

pub(crate) enum Detected<'a> {
    Clean(PendingMerge<'a, Clean>),
    Conflicted(PendingMerge<'a, Conflicted>),
}

impl<'a, State> PendingMerge<'a, State> {
    fn into_phase<Next>(self) -> PendingMerge<'a, Next> {
        PendingMerge {
            ctx: self.ctx,
            _state: PhantomData,
        }
    }

    fn outcome(self, status: MergeStatus, commit: Option<Commit>) -> MergeOutcome {
        MergeOutcome {
            source: self.ctx.source.path,
            target: self.ctx.target.path,
            status,
            commit,
            conflicts: self.ctx.conflicts,
        }
    }
}

impl<'a> PendingMerge<'a, Preparing> {
    fn start(
        processor: &'a MergeProcessor,
        guard: &'a BranchWriteGuard<'a>,
        request: &'a MergeRequest,
        cancel: &'a Cancellation,
    ) -> StoreResult<Self> {
        let source = processor.branches.get(&request.source)?;
        let target = processor.branches.get(&request.target)?;
        if target.state == BranchState::Stray {
            return Err(StoreError::invalid(format!("merge target {} is stray", target.path)));
        }

        let direction = Direction::of(&source.path, &target.path);
        let new_base = (direction == Direction::Rebase && source.head_timestamp > target.base_timestamp)
            .then_some(source.head_timestamp);
        let mut effective_view = processor.branches.read_chain(&target.path, None)?;
        if let Some(base) = new_base {
            effective_view = effective_view.with_base(base);
        }

        Ok(Self {
            ctx: MergeContext {
                processor,
                guard,
                request,
                cancel,
                source,
                target,
                direction,
                new_base,
                effective_view,
                pairs: BTreeMap::new(),
                staged: BTreeMap::new(),
                conflicts: Vec::new(),
            },
            _state: PhantomData,
        })
    }

    /// Collect each side's changes since the common ancestor.
    fn prepare(mut self) -> StoreResult<PendingMerge<'a, Detecting>> {
        let ctx = &mut self.ctx;
        let divergence = ctx.processor.compare.diverge(&ctx.target.path, &ctx.source.path)?;
        let objects: BTreeSet<ObjectId> = divergence
            .left_touched
            .union(&divergence.right_touched)
            .cloned()
            .collect();

        let revisions = &ctx.processor.revisions;
        let before = live_states(revisions, &objects, &divergence.ancestor_view)?;
        let target_after = live_states(revisions, &objects, &divergence.left_view)?;
        let source_after = live_states(revisions, &objects, &divergence.right_view)?;

        for object in objects {
            ctx.cancel.check(&format!("merge {} into {}", ctx.source.path, ctx.target.path))?;
            let source = SideChange::between(before.get(&object), source_after.get(&object));
            let target = SideChange::between(before.get(&object), target_after.get(&object));
            if source.is_none() && target.is_none() {
                continue;
            }
            ctx.pairs.insert(
                object.clone(),
                ChangePair {
                    before: before.get(&object).cloned(),
                    object,
                    source,
                    target,
                },
            );
        }

        debug!(
            source = %ctx.source.path,
            target = %ctx.target.path,
            ancestor = %divergence.ancestor,
            since = divergence.since,
            direction = ?ctx.direction,
            changed = ctx.pairs.len(),
            "prepared merge"
        );
        Ok(self.into_phase())
    }
}

impl<'a> PendingMerge<'a, Detecting> {
    /// Run the conflict rules, stage the merged state and check invariants.
    fn detect(mut self) -> StoreResult<Detected<'a>> {
        let rules = ctx_rules(&self.ctx);
        let detector = Detector::new(rules, &self.ctx.pairs);
        let mut conflicts = Vec::new();
        for pair in self.ctx.pairs.values() {
            self.ctx.cancel.check("merge conflict detection")?;
            for (kind, rule) in RULES {
                let found = rule(&detector, pair);
                if !found.is_empty() {
                    debug!(object = %pair.object, %kind, count = found.len(), "merge conflict");
                    conflicts.extend(found);
                    break;
                }
            }
        }
        drop(detector);

        if !conflicts.is_empty() {
            self.ctx.conflicts = conflicts;
            return Ok(Detected::Conflicted(self.into_phase()));
        }

        self.stage()?;
        let view = MergedView::new(&self.ctx.processor.revisions, &self.ctx.effective_view, &self.ctx.staged);
        let violations = invariants::check(rules, &view)?;
        if !violations.is_empty() {
            self.ctx.conflicts = violations;
            return Ok(Detected::Conflicted(self.into_phase()));
        }
        Ok(Detected::Clean(self.into_phase()))
    }

    fn stage(&mut self) -> StoreResult<()> {
        let rules = ctx_rules(&self.ctx);
        let ctx = &mut self.ctx;
        for pair in ctx.pairs.values() {
            if let Some(desired) = desired_state(rules, pair) {
                ctx.staged.insert(pair.object.clone(), desired);
            }
        }

        // removing a container removes what it contains; the target's own
        // removals already did so when they were committed
        let mut pending: Vec<ObjectId> = ctx
            .pairs
            .values()
            .filter(|pair| pair.source.as_ref().is_some_and(|source| source.after.is_none()))
            .filter(|pair| matches!(ctx.staged.get(&pair.object), Some(None)))
            .map(|pair| pair.object.clone())
            .collect();
        while let Some(removed) = pending.pop() {
            ctx.cancel.check("merge cascade")?;
            for rev in ctx.processor.revisions.contained_in(&removed, &ctx.effective_view)? {
                if ctx.staged.contains_key(&rev.object) {
                    continue;
                }
                ctx.staged.insert(rev.object.clone(), None);
                pending.push(rev.object);
            }
        }
        Ok(())
    }
}

fn ctx_rules<'a>(ctx: &MergeContext<'a>) -> &'a MergeRules {
    let processor: &'a MergeProcessor = ctx.processor;
    &processor.rules
}

/// State a conflict-free pair holds once merged, or `None` when the merge
/// has no opinion on it.
///
/// Target-only changes are staged too. They normally match what the target
/// already reads, but a rebase hides the target's earlier revisions and
/// needs them recorded again on top of the new base.
fn desired_state(rules: &MergeRules, pair: &ChangePair) -> Option<Option<ObjectState>> {
    match (&pair.source, &pair.target) {
        (None, None) => None,
        (Some(source), None) => Some(source.after.clone()),
        (None, Some(target)) => Some(target.after.clone()),
        (Some(source), Some(target)) => match (&source.after, &target.after) {
            // delete wins
            (None, _) | (_, None) => Some(None),
            (Some(s), Some(t)) if s == t => Some(Some(s.clone())),
            (Some(s), Some(t)) => three_way(rules, &pair.object, pair.before.as_ref(), s, t)
                .ok()
                .map(Some),
        },
    }
}

impl<'a> PendingMerge<'a, Clean> {
    /// Write the staged state to the target.
    fn apply(self) -> StoreResult<MergeOutcome> {
        let ctx = &self.ctx;
        let processor = ctx.processor;
        let objects: BTreeSet<ObjectId> = ctx.staged.keys().cloned().collect();
        let current = processor.revisions.resolve_many(&objects, &ctx.effective_view)?;

        let mut changes = ChangeSet::new();
        for (object, desired) in &ctx.staged {
            let live = current.get(object).and_then(|rev| rev.state());
            match (live, desired) {
                (None, Some(state)) => changes.push(Mutation::Create {
                    object: object.clone(),
                    container: state.container.clone(),
                    attributes: state.attributes.clone(),
                }),
                (Some(live), Some(state)) if &live != state => changes.push(Mutation::Update {
                    object: object.clone(),
                    container: state.container.clone(),
                    attributes: state.attributes.clone(),
                }),
                (Some(_), None) => changes.push(Mutation::Delete { object: object.clone() }),
                _ => {}
            }
        }
        ctx.cancel.check(&format!("merge {} into {}", ctx.source.path, ctx.target.path))?;

        if changes.is_empty() {
            if let Some(base) = ctx.new_base {
                processor.branches.advance_base(ctx.guard, &ctx.target.path, base)?;
            }
            info!(source = %ctx.source.path, target = %ctx.target.path, "merge applied without changes");
            return Ok(self.outcome(MergeStatus::Applied, None));
        }

        let comment = ctx
            .request
            .comment
            .clone()
            .unwrap_or_else(|| format!("Merge {} into {}", ctx.source.path, ctx.target.path));
        let options = PublishOptions {
            new_base: ctx.new_base,
            merge_source: (!ctx.request.squash).then(|| MergeSource {
                source: ctx.source.path.clone(),
                source_head: ctx.source.head_timestamp,
            }),
        };
        let commit = processor.commits.commit_locked(
            ctx.guard,
            &ctx.target.path,
            &ctx.request.author,
            &comment,
            &changes,
            options,
        )?;

        info!(
            source = %ctx.source.path,
            target = %ctx.target.path,
            commit = %commit.id,
            changes = commit.change_count,
            "merge applied"
        );
        Ok(self.outcome(MergeStatus::Applied, Some(commit)))
    }
}

impl<'a> PendingMerge<'a, Conflicted> {
    fn reject(self) -> MergeOutcome {
        warn!(
            source = %self.ctx.source.path,
            target = %self.ctx.target.path,
            conflicts = self.ctx.conflicts.len(),
            "merge rejected"
        );
        self.outcome(MergeStatus::Rejected, None)
    }
}

fn live_states(
    revisions: &RevisionStore,
    objects: &BTreeSet<ObjectId>,
    view: &ReadChain,
) -> StoreResult<BTreeMap<ObjectId, ObjectState>> {
    Ok(revisions
        .resolve_many(objects, view)?
        .into_iter()
        .filter_map(|(object, rev)| rev.state().map(|s| (object, s)))
        .collect())
}

/// Merges branches and reports conflicts.
#[derive(Clone)]
pub struct MergeProcessor {
    branches: BranchManager,
    revisions: RevisionStore,
    commits: CommitCoordinator,
    compare: CompareEngine,
    rules: Arc<MergeRules>,
}

impl MergeProcessor {
    pub fn new(
        branches: BranchManager,
        revisions: RevisionStore,
        commits: CommitCoordinator,
        rules: MergeRules,
    ) -> Self {
        let compare = CompareEngine::new(branches.clone(), revisions.clone());
        Self {
            branches,
            revisions,
            commits,
            compare,
            rules: Arc::new(rules),
        }
    }

    pub fn rules(&self) -> &MergeRules {
        &self.rules
    }

    /// Merge `request.source` into `request.target`.
    ///
    /// Conflicts are not errors: a merge that cannot be applied returns a
    /// `REJECTED` outcome listing them and leaves the target untouched.
    pub fn merge(&self, request: &MergeRequest, cancel: &Cancellation) -> StoreResult<MergeOutcome> {
        if request.source == request.target {
            return Err(StoreError::invalid(format!("cannot merge {} into itself", request.source)));
        }
        let guard = self
            .branches
            .locks()
            .lock_all(&[request.source.clone(), request.target.clone()])?;

        let detecting = PendingMerge::start(self, &guard, request, cancel)?.prepare()?;
        match detecting.detect()? {
            Detected::Clean(merge) => merge.apply(),
            Detected::Conflicted(merge) => Ok(merge.reject()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::clock::{Clock, MonotonicClock};
    use crate::commit::BranchLocks;
    use crate::merge::rules::PreferredRule;
    use crate::retry::RetryPolicy;
    use crate::storage::MemoryIndex;

    struct Fixture {
        branches: BranchManager,
        revisions: RevisionStore,
        commits: CommitCoordinator,
        processor: MergeProcessor,
    }

    fn setup(rules: MergeRules) -> Fixture {
        let index = Arc::new(MemoryIndex::new());
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let branches = BranchManager::new(
            index.clone(),
            Arc::new(BranchLocks::new(Duration::from_millis(200))),
            clock.clone(),
            RetryPolicy::none(),
        );
        branches.init().unwrap();
        let revisions = RevisionStore::new(index.clone(), RetryPolicy::none());
        let commits = CommitCoordinator::new(index, branches.clone(), revisions.clone(), clock, RetryPolicy::none());
        let processor = MergeProcessor::new(branches.clone(), revisions.clone(), commits.clone(), rules);
        Fixture {
            branches,
            revisions,
            commits,
            processor,
        }
    }

    fn path(s: &str) -> BranchPath {
        BranchPath::new(s).unwrap()
    }

    fn concept(id: &str) -> ObjectId {
        ObjectId::new("concept", id).unwrap()
    }

    fn description(id: &str) -> ObjectId {
        ObjectId::new("description", id).unwrap()
    }

    fn attrs(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    fn state(value: Value) -> ObjectState {
        ObjectState::new(attrs(value))
    }

    fn branch(f: &Fixture, name: &str) -> BranchPath {
        f.branches.create(&BranchPath::main(), name, BTreeMap::new()).unwrap().path
    }

    fn commit(f: &Fixture, on: &BranchPath, changes: ChangeSet) -> Commit {
        f.commits.commit(on, "tester", "work", changes).unwrap()
    }

    fn merge(f: &Fixture, source: &BranchPath, target: &BranchPath) -> MergeOutcome {
        f.processor
            .merge(&MergeRequest::new(source.clone(), target.clone()), &Cancellation::new())
            .unwrap()
    }

    fn read(f: &Fixture, on: &BranchPath, object: &ObjectId) -> Option<ObjectState> {
        let chain = f.branches.read_chain(on, None).unwrap();
        f.revisions.get(object, &chain).unwrap().and_then(|rev| rev.state())
    }

    #[test]
    fn test_duplicate_identity_between_siblings() {
        let f = setup(MergeRules::new().with_natural_key("concept", "term"));
        let task1 = branch(&f, "task1");
        let task2 = branch(&f, "task2");
        commit(&f, &task1, ChangeSet::new().create(concept("y1"), state(json!({"term": "Burn"}))));
        commit(&f, &task2, ChangeSet::new().create(concept("y2"), state(json!({"term": "Burn"}))));
        let head = f.branches.get(&task2).unwrap().head_timestamp;

        let outcome = merge(&f, &task1, &task2);
        assert_eq!(outcome.status, MergeStatus::Rejected);
        assert_eq!(outcome.conflicts.len(), 1);
        let conflict = &outcome.conflicts[0];
        assert_eq!(conflict.kind(), ConflictKind::DuplicateIdentity);
        assert_eq!(conflict.object_a(), &concept("y1"));
        assert_eq!(conflict.object_b(), Some(&concept("y2")));

        assert_eq!(f.branches.get(&task2).unwrap().head_timestamp, head);
        assert!(read(&f, &task2, &concept("y1")).is_none());

        let wire = serde_json::to_value(outcome.result()).unwrap();
        assert_eq!(wire["status"], json!("REJECTED"));
        assert_eq!(wire["conflicts"][0]["kind"], json!("DUPLICATE_IDENTITY"));
        assert!(wire.get("commitId").is_none());
    }

    #[test]
    fn test_promote_then_merge_again_is_empty() {
        let f = setup(MergeRules::new());
        let main = BranchPath::main();
        commit(&f, &main, ChangeSet::new().create(concept("x"), state(json!({"term": "v1"}))));
        let task = branch(&f, "task1");
        let base = f.branches.get(&task).unwrap().base_timestamp;
        commit(&f, &task, ChangeSet::new().update(concept("x"), attrs(json!({"term": "v2"}))));

        let first = merge(&f, &task, &main);
        assert!(first.is_applied());
        let merged = first.commit.as_ref().unwrap();
        assert_eq!(merged.merge_source.as_ref().map(|m| &m.source), Some(&task));
        assert_eq!(read(&f, &main, &concept("x")), Some(state(json!({"term": "v2"}))));
        assert_eq!(f.branches.get(&task).unwrap().base_timestamp, base);

        let second = merge(&f, &task, &main);
        assert!(second.is_applied());
        assert!(second.commit.is_none());
        assert_eq!(f.commits.commits(&main).unwrap().len(), 2);
    }

    #[test]
    fn test_rebase_moves_base_without_copying() {
        let f = setup(MergeRules::new());
        let main = BranchPath::main();
        let task = branch(&f, "task1");
        commit(&f, &main, ChangeSet::new().create(concept("late"), state(json!({"term": "new"}))));
        let main_head = f.branches.get(&main).unwrap().head_timestamp;

        let outcome = merge(&f, &main, &task);
        assert!(outcome.is_applied());
        assert!(outcome.commit.is_none());

        let rebased = f.branches.get(&task).unwrap();
        assert_eq!(rebased.base_timestamp, main_head);
        assert_eq!(rebased.state, BranchState::Active);
        assert_eq!(read(&f, &task, &concept("late")), Some(state(json!({"term": "new"}))));
        assert!(f.revisions.history(&concept("late"), [&task]).unwrap().is_empty());
    }

    #[test]
    fn test_rebase_merges_attributes_of_shadowed_object() {
        let f = setup(MergeRules::new());
        let main = BranchPath::main();
        commit(&f, &main, ChangeSet::new().create(concept("x"), state(json!({"term": "a", "status": 1}))));
        let task = branch(&f, "task1");
        commit(&f, &task, ChangeSet::new().update(concept("x"), attrs(json!({"term": "b", "status": 1}))));
        commit(&f, &main, ChangeSet::new().update(concept("x"), attrs(json!({"term": "a", "status": 2}))));
        let main_head = f.branches.get(&main).unwrap().head_timestamp;

        let outcome = merge(&f, &main, &task);
        assert!(outcome.is_applied());
        let commit = outcome.commit.unwrap();
        assert!(commit.timestamp > main_head);
        assert_eq!(read(&f, &task, &concept("x")), Some(state(json!({"term": "b", "status": 2}))));
        assert_eq!(f.branches.get(&task).unwrap().base_timestamp, main_head);
        assert_eq!(read(&f, &main, &concept("x")), Some(state(json!({"term": "a", "status": 2}))));
    }

    #[test]
    fn test_branch_work_survives_rebase_and_promotes() {
        let f = setup(MergeRules::new());
        let main = BranchPath::main();
        let task = branch(&f, "task1");
        commit(&f, &task, ChangeSet::new().create(concept("x"), state(json!({"term": "mine"}))));
        let old_base = f.branches.get(&task).unwrap().base_timestamp;
        let worked = f.branches.get(&task).unwrap().head_timestamp;
        commit(&f, &main, ChangeSet::new().create(concept("y"), state(json!({"term": "theirs"}))));

        let rebase = merge(&f, &main, &task);
        assert!(rebase.is_applied());
        let rebase_commit = rebase.commit.unwrap();
        assert_eq!(rebase_commit.change_count, 1);
        let rebased = f.branches.get(&task).unwrap();
        assert!(rebased.base_timestamp > old_base);
        assert_eq!(read(&f, &task, &concept("x")), Some(state(json!({"term": "mine"}))));
        assert_eq!(read(&f, &task, &concept("y")), Some(state(json!({"term": "theirs"}))));

        // the branch's new history starts at its new base
        let touched = f
            .revisions
            .touched(&task, rebased.base_timestamp, rebased.head_timestamp)
            .unwrap();
        assert_eq!(touched, BTreeSet::from([concept("x")]));

        // reads between the old and new base see only the parent
        for at in [worked, rebased.base_timestamp] {
            let past = f.branches.read_chain(&task, Some(at)).unwrap();
            assert!(f.revisions.get(&concept("x"), &past).unwrap().is_none());
        }

        let promote = merge(&f, &task, &main);
        assert!(promote.is_applied());
        assert!(promote.commit.is_some());
        assert_eq!(read(&f, &main, &concept("x")), Some(state(json!({"term": "mine"}))));
    }

    #[test]
    fn test_rebase_keeps_branch_deletions() {
        let f = setup(MergeRules::new());
        let main = BranchPath::main();
        commit(&f, &main, ChangeSet::new().create(concept("x"), state(json!({"term": "a"}))));
        let task = branch(&f, "task1");
        commit(&f, &task, ChangeSet::new().delete(concept("x")));
        commit(&f, &main, ChangeSet::new().create(concept("y"), state(json!({"term": "b"}))));

        let outcome = merge(&f, &main, &task);
        assert!(outcome.is_applied());
        assert!(read(&f, &task, &concept("x")).is_none());
        assert_eq!(read(&f, &task, &concept("y")), Some(state(json!({"term": "b"}))));
        assert_eq!(read(&f, &main, &concept("x")), Some(state(json!({"term": "a"}))));
    }

    #[test]
    fn test_attribute_conflict_and_last_writer_wins() {
        let seed = json!({"term": "a", "effectiveTime": "20240101"});

        let f = setup(MergeRules::new());
        commit(&f, &BranchPath::main(), ChangeSet::new().create(concept("x"), state(seed.clone())));
        let task1 = branch(&f, "task1");
        let task2 = branch(&f, "task2");
        commit(&f, &task1, ChangeSet::new().update(concept("x"), attrs(json!({"term": "b", "effectiveTime": "20240101"}))));
        commit(&f, &task2, ChangeSet::new().update(concept("x"), attrs(json!({"term": "c", "effectiveTime": "20240101"}))));
        let outcome = merge(&f, &task1, &task2);
        assert_eq!(outcome.status, MergeStatus::Rejected);
        assert!(matches!(
            &outcome.conflicts[..],
            [Conflict::AttributeConflict { attribute, .. }] if attribute == "term"
        ));

        let f = setup(MergeRules::new().with_last_writer_wins("effectiveTime"));
        commit(&f, &BranchPath::main(), ChangeSet::new().create(concept("x"), state(seed)));
        let task1 = branch(&f, "task1");
        let task2 = branch(&f, "task2");
        commit(&f, &task1, ChangeSet::new().update(concept("x"), attrs(json!({"term": "a", "effectiveTime": "20240301"}))));
        commit(&f, &task2, ChangeSet::new().update(concept("x"), attrs(json!({"term": "a", "effectiveTime": "20240201"}))));
        let outcome = merge(&f, &task1, &task2);
        assert!(outcome.is_applied());
        assert_eq!(
            read(&f, &task2, &concept("x")),
            Some(state(json!({"term": "a", "effectiveTime": "20240301"})))
        );
    }

    #[test]
    fn test_delete_wins_and_cascades() {
        let f = setup(MergeRules::new());
        let main = BranchPath::main();
        commit(
            &f,
            &main,
            ChangeSet::new()
                .create(concept("x"), state(json!({"term": "x"})))
                .create(description("d"), state(json!({"term": "syn"})).with_container(concept("x"))),
        );
        let task1 = branch(&f, "task1");
        let task2 = branch(&f, "task2");
        commit(&f, &task1, ChangeSet::new().delete(concept("x")));
        commit(&f, &task2, ChangeSet::new().update(concept("x"), attrs(json!({"term": "y"}))));

        let outcome = merge(&f, &task1, &task2);
        assert!(outcome.is_applied(), "{:?}", outcome.conflicts);
        assert!(read(&f, &task2, &concept("x")).is_none());
        assert!(read(&f, &task2, &description("d")).is_none());
        assert_eq!(outcome.commit.unwrap().change_count, 2);
        assert!(read(&f, &main, &description("d")).is_some());
    }

    #[test]
    fn test_added_vs_detached() {
        let f = setup(MergeRules::new());
        commit(&f, &BranchPath::main(), ChangeSet::new().create(concept("x"), state(json!({"term": "x"}))));
        let task1 = branch(&f, "task1");
        let task2 = branch(&f, "task2");
        commit(&f, &task1, ChangeSet::new().delete(concept("x")));
        commit(
            &f,
            &task2,
            ChangeSet::new().create(description("d2"), state(json!({"term": "new"})).with_container(concept("x"))),
        );

        let outcome = merge(&f, &task1, &task2);
        assert_eq!(outcome.status, MergeStatus::Rejected);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].kind(), ConflictKind::AddedVsDetached);
        assert_eq!(outcome.conflicts[0].object_a(), &description("d2"));
        assert_eq!(outcome.conflicts[0].object_b(), Some(&concept("x")));
    }

    #[test]
    fn test_invariant_violation_rejects_clean_merge() {
        let rules = MergeRules::new().with_preferred(PreferredRule {
            object_type: "description".to_string(),
            group_attribute: "conceptId".to_string(),
            flag_attribute: "preferred".to_string(),
            flag_value: json!(true),
        });
        let f = setup(rules);
        commit(&f, &BranchPath::main(), ChangeSet::new().create(concept("c"), ObjectState::default()));
        let task1 = branch(&f, "task1");
        let task2 = branch(&f, "task2");
        let preferred = || state(json!({"conceptId": "c", "preferred": true})).with_container(concept("c"));
        commit(&f, &task1, ChangeSet::new().create(description("d1"), preferred()));
        commit(&f, &task2, ChangeSet::new().create(description("d2"), preferred()));

        let outcome = merge(&f, &task1, &task2);
        assert_eq!(outcome.status, MergeStatus::Rejected);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].kind(), ConflictKind::InvariantViolation);
        assert!(read(&f, &task2, &description("d1")).is_none());
    }

    #[test]
    fn test_squash_records_no_provenance() {
        let f = setup(MergeRules::new());
        let main = BranchPath::main();
        let task = branch(&f, "task1");
        commit(&f, &task, ChangeSet::new().create(concept("x"), ObjectState::default()));

        let outcome = f
            .processor
            .merge(
                &MergeRequest::new(task.clone(), main.clone()).squash(true).comment("ship it"),
                &Cancellation::new(),
            )
            .unwrap();
        let commit = outcome.commit.unwrap();
        assert!(!commit.is_merge());
        assert_eq!(commit.comment, "ship it");
        assert!(read(&f, &main, &concept("x")).is_some());
    }

    #[test]
    fn test_cancelled_merge_leaves_target_untouched() {
        let f = setup(MergeRules::new());
        let main = BranchPath::main();
        let task = branch(&f, "task1");
        commit(&f, &task, ChangeSet::new().create(concept("x"), ObjectState::default()));
        let head = f.branches.get(&main).unwrap().head_timestamp;

        let cancel = Cancellation::new();
        cancel.cancel();
        let err = f
            .processor
            .merge(&MergeRequest::new(task.clone(), main.clone()), &cancel)
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled(_)));
        assert_eq!(f.branches.get(&main).unwrap().head_timestamp, head);
        assert!(!f.branches.locks().is_locked(&main));
    }

    #[test]
    fn test_invalid_merges() {
        let f = setup(MergeRules::new());
        let task = branch(&f, "task1");
        let same = f
            .processor
            .merge(&MergeRequest::new(task.clone(), task.clone()), &Cancellation::new())
            .unwrap_err();
        assert!(matches!(same, StoreError::InvalidArgument(_)));

        let missing = f
            .processor
            .merge(&MergeRequest::new(path("MAIN/nope"), task), &Cancellation::new())
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[test]
    fn test_request_wire_shape() {
        let request: MergeRequest =
            serde_json::from_str(r#"{"sourcePath":"MAIN/task1","targetPath":"MAIN","squash":true}"#).unwrap();
        assert_eq!(request.source, path("MAIN/task1"));
        assert!(request.squash);
        assert_eq!(request.author, "merge");
    }
}
