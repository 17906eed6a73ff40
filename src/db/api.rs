//! Database API - high-level interface for revdb.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::branch::{Branch, BranchManager, BranchPath};
use crate::cancel::Cancellation;
use crate::clock::{Clock, MonotonicClock, Timestamp};
use crate::commit::{
    BranchLocks, ChangeSet, Commit, CommitCoordinator, CommitHook, CommitQuery, UniqueNaturalKeyHook,
};
use crate::compare::{CompareEngine, CompareOptions, CompareRequest, RevisionCompare};
use crate::config::{BackendConfig, ConfigError, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::merge::{MergeOutcome, MergeProcessor, MergeRequest};
use crate::revision::{ChangeOp, ObjectId, ObjectState, Revision, RevisionStore};
use crate::storage::{DocumentIndex, GitIndex, MemoryIndex};

/// Result type for opening a database.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Errors from opening a database.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The main database handle.
///
/// Cheap to share across threads by reference; every component is
/// internally synchronized.
pub struct Database {
    config: StoreConfig,
    branches: BranchManager,
    revisions: RevisionStore,
    commits: CommitCoordinator,
    compare: CompareEngine,
    merges: MergeProcessor,
}

impl Database {
    /// Open (or create) the store described by `config`.
    pub fn open(config: StoreConfig) -> DatabaseResult<Self> {
        config.validate()?;
        let index: Arc<dyn DocumentIndex> = match &config.backend {
            BackendConfig::Memory => Arc::new(MemoryIndex::new()),
            BackendConfig::Git { path } => Arc::new(GitIndex::open_or_init(path).map_err(StoreError::from)?),
        };

        let clock = Arc::new(MonotonicClock::new());
        let db = Self::with_clock(index, config, clock.clone())?;
        // never hand out a timestamp at or below one already persisted
        if let Some(head) = db.branches.latest_head()? {
            clock.observe(head);
        }
        info!(backend = ?db.config.backend, "opened database");
        Ok(db)
    }

    /// Create a new in-memory database (for testing).
    pub fn in_memory() -> DatabaseResult<Self> {
        Self::open(StoreConfig::default())
    }

    /// Assemble a database over an existing index with an injected clock.
    pub fn with_clock(index: Arc<dyn DocumentIndex>, config: StoreConfig, clock: Arc<dyn Clock>) -> DatabaseResult<Self> {
        config.validate()?;
        let retry = config.retry_policy();
        let locks = Arc::new(BranchLocks::new(config.lock_timeout()));

        let branches = BranchManager::new(index.clone(), locks, clock.clone(), retry);
        branches.init()?;
        let revisions = RevisionStore::new(index.clone(), retry);
        let mut commits = CommitCoordinator::new(index, branches.clone(), revisions.clone(), clock, retry);
        if config.enforce_natural_keys && !config.merge.natural_keys.is_empty() {
            commits.add_hook(Arc::new(UniqueNaturalKeyHook::new(config.merge.natural_keys.clone())));
        }
        let compare = CompareEngine::new(branches.clone(), revisions.clone());
        let merges = MergeProcessor::new(branches.clone(), revisions.clone(), commits.clone(), config.merge.clone());

        Ok(Self {
            config,
            branches,
            revisions,
            commits,
            compare,
            merges,
        })
    }

    /// Register a pre-commit hook; it also runs for merge commits.
    pub fn with_hook(mut self, hook: Arc<dyn CommitHook>) -> Self {
        self.commits.add_hook(hook);
        self.merges = MergeProcessor::new(
            self.branches.clone(),
            self.revisions.clone(),
            self.commits.clone(),
            self.config.merge.clone(),
        );
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ==================== Branches ====================

    pub fn get_branch(&self, path: &BranchPath) -> StoreResult<Branch> {
        self.branches.get(path)
    }

    pub fn create_branch(
        &self,
        parent: &BranchPath,
        name: &str,
        metadata: BTreeMap<String, String>,
    ) -> StoreResult<Branch> {
        self.branches.create(parent, name, metadata)
    }

    pub fn delete_branch(&self, path: &BranchPath) -> StoreResult<()> {
        self.branches.delete(path)
    }

    /// Live branches, optionally limited to `prefix` and its descendants.
    pub fn list_branches(&self, prefix: Option<&BranchPath>) -> StoreResult<Vec<Branch>> {
        self.branches.list(prefix)
    }

    /// Bring a branch up to date with its parent.
    pub fn rebase(&self, path: &BranchPath, cancel: &Cancellation) -> StoreResult<MergeOutcome> {
        let branch = self.branches.get(path)?;
        let Some(parent) = branch.parent_path else {
            return Err(StoreError::invalid("MAIN has no parent to rebase on"));
        };
        let request = MergeRequest::new(parent.clone(), path.clone()).comment(format!("Rebase {} on {}", path, parent));
        self.merges.merge(&request, cancel)
    }

    // ==================== Reads ====================

    /// Live revision of `object` on `branch` at `at` (default: head).
    pub fn get(&self, object: &ObjectId, branch: &BranchPath, at: Option<Timestamp>) -> StoreResult<Option<Revision>> {
        let chain = self.branches.read_chain(branch, at)?;
        self.revisions.get(object, &chain)
    }

    /// Every live object on `branch` at `at`, optionally of one type.
    pub fn snapshot(
        &self,
        branch: &BranchPath,
        at: Option<Timestamp>,
        object_type: Option<&str>,
    ) -> StoreResult<BTreeMap<ObjectId, Revision>> {
        let chain = self.branches.read_chain(branch, at)?;
        self.revisions.visible(&chain, object_type)
    }

    /// Revisions of `object` along `branch`'s ancestry, in key order.
    pub fn object_history(&self, object: &ObjectId, branch: &BranchPath) -> StoreResult<Vec<Revision>> {
        let chain = self.branches.read_chain(branch, None)?;
        self.revisions.history(object, chain.segments())
    }

    // ==================== Writes ====================

    pub fn commit(&self, branch: &BranchPath, author: &str, comment: &str, changes: ChangeSet) -> StoreResult<Commit> {
        self.commits.commit(branch, author, comment, changes)
    }

    // ==================== Compare & merge ====================

    pub fn compare(
        &self,
        base: Option<&BranchPath>,
        compare: &BranchPath,
        options: CompareOptions,
        cancel: &Cancellation,
    ) -> StoreResult<RevisionCompare> {
        self.compare.compare(base, compare, options, cancel)
    }

    /// Compare from the wire request form.
    pub fn compare_request(&self, request: &CompareRequest) -> StoreResult<RevisionCompare> {
        let (base, compare, options) = request.parse()?;
        self.compare(base.as_ref(), &compare, options, &Cancellation::new())
    }

    /// Apply a complete compare result to its base branch, making the base
    /// match the compare branch's state at the compared head.
    pub fn apply_compare(&self, compare: &RevisionCompare, author: &str, comment: &str) -> StoreResult<Commit> {
        let chain = self
            .branches
            .read_chain(&compare.compare_path, Some(compare.compare_head_timestamp))?;
        let wanted: BTreeSet<ObjectId> = compare
            .details
            .iter()
            .filter(|d| d.op != ChangeOp::Remove)
            .map(|d| d.object_id.clone())
            .collect();
        let states: BTreeMap<ObjectId, ObjectState> = self
            .revisions
            .resolve_many(&wanted, &chain)?
            .into_iter()
            .filter_map(|(object, rev)| rev.state().map(|s| (object, s)))
            .collect();

        let changes = ChangeSet::from_compare(compare, &states)?;
        self.commits.commit(&compare.base_branch_path, author, comment, changes)
    }

    pub fn merge(&self, request: &MergeRequest, cancel: &Cancellation) -> StoreResult<MergeOutcome> {
        self.merges.merge(request, cancel)
    }

    // ==================== Commit log ====================

    pub fn commits(&self, branch: &BranchPath) -> StoreResult<Vec<Commit>> {
        self.commits.commits(branch)
    }

    pub fn search_commits(&self, query: &CommitQuery) -> StoreResult<Vec<Commit>> {
        self.commits.search(query)
    }

    pub fn get_commit(&self, id: &str) -> StoreResult<Commit> {
        self.commits.get_commit(id)
    }

    /// Rebuild a branch's head state from its base plus its commit log.
    pub fn replay(&self, branch: &BranchPath) -> StoreResult<BTreeMap<ObjectId, ObjectState>> {
        self.commits.replay(branch)
    }
}
