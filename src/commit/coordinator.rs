//! Commit coordinator - the only writer of revisions.
//!
//! A commit is published in two index batches:
//!
//! ```text
//!   1. stage    close superseded intervals (replaced = ts)
//!               write new revisions / tombstones (created = ts)
//!               write the commit record
//!   2. publish  branch.head = ts
//! ```
//!
//! Readers bound every lookup by the branch head, so nothing staged in step 1
//! is visible until step 2 lands: a closed interval still contains every
//! timestamp up to the old head and the new revisions start after it. If
//! step 2 fails the staged documents are compensated (intervals re-opened,
//! new documents removed) before the error is returned.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::branch::{Branch, BranchManager, BranchPath, BranchState};
use crate::clock::{Clock, Timestamp};
use crate::commit::changeset::{ChangeSet, Mutation};
use crate::commit::hooks::{CommitHook, HookContext, HookVerdict};
use crate::commit::lock::BranchWriteGuard;
use crate::commit::record::{Commit, CommitQuery, MergeSource, ObjectChange};
use crate::error::{StoreError, StoreResult};
use crate::retry::RetryPolicy;
use crate::revision::{ChangeOp, ObjectId, ObjectState, ReadChain, Revision, RevisionStore};
use crate::storage::{CollectionName, DocKey, Document, DocumentIndex, Filter, WriteBatch};

/// Extra effects a merge attaches to its commit.
#[derive(Debug, Clone, Default)]
pub(crate) struct PublishOptions {
    /// New base for the target branch, published together with the head.
    pub new_base: Option<Timestamp>,
    pub merge_source: Option<MergeSource>,
}

/// Documents written by the staging batch, kept for compensation.
struct Staged {
    reopened: Vec<Revision>,
    written: Vec<DocKey>,
    commit_key: DocKey,
}

/// Applies change sets to branches atomically and keeps the commit log.
#[derive(Clone)]
pub struct CommitCoordinator {
    index: Arc<dyn DocumentIndex>,
    branches: BranchManager,
    revisions: RevisionStore,
    clock: Arc<dyn Clock>,
    hooks: Vec<Arc<dyn CommitHook>>,
    retry: RetryPolicy,
}

impl CommitCoordinator {
    pub fn new(
        index: Arc<dyn DocumentIndex>,
        branches: BranchManager,
        revisions: RevisionStore,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            index,
            branches,
            revisions,
            clock,
            hooks: Vec::new(),
            retry,
        }
    }

    /// Register a pre-commit hook. Hooks run in registration order.
    pub fn add_hook(&mut self, hook: Arc<dyn CommitHook>) {
        self.hooks.push(hook);
    }

    /// Apply `changes` to `branch` as one commit.
    pub fn commit(&self, branch: &BranchPath, author: &str, comment: &str, changes: ChangeSet) -> StoreResult<Commit> {
        let guard = self.branches.locks().lock(branch)?;
        self.commit_locked(&guard, branch, author, comment, &changes, PublishOptions::default())
    }

    /// Commit while the caller already holds the branch's write lock.
    pub(crate) fn commit_locked(
        &self,
        guard: &BranchWriteGuard<'_>,
        path: &BranchPath,
        author: &str,
        comment: &str,
        changes: &ChangeSet,
        options: PublishOptions,
    ) -> StoreResult<Commit> {
        if !guard.covers(path) {
            return Err(StoreError::Conflict(format!("write lock for {} not held", path)));
        }
        if changes.is_empty() {
            return Err(StoreError::invalid(format!("empty change set for {}", path)));
        }
        changes.validate()?;

        let branch = self.branches.get(path)?;
        if branch.state == BranchState::Stray {
            return Err(StoreError::invalid(format!("branch {} is stray", path)));
        }

        let mut chain = self.branches.read_chain(path, None)?;
        if let Some(base) = options.new_base {
            chain = chain.with_base(base);
        }

        let objects: BTreeSet<ObjectId> = changes.mutations().iter().map(|m| m.object().clone()).collect();
        let current = self.revisions.resolve_many(&objects, &chain)?;
        self.check_preconditions(&branch, changes, &current, &chain)?;

        let ctx = HookContext {
            branch: &branch,
            chain: &chain,
            revisions: &self.revisions,
        };
        for hook in &self.hooks {
            if let HookVerdict::Reject(reason) = hook.validate(&ctx, changes)? {
                warn!(branch = %path, hook = hook.name(), %reason, "commit rejected");
                return Err(StoreError::Rejected {
                    branch: path.to_string(),
                    reason: format!("{}: {}", hook.name(), reason),
                });
            }
        }

        let floor = branch.head_timestamp.max(options.new_base.unwrap_or(Timestamp::MIN));
        let timestamp = self.clock.now().max(floor + 1);
        let commit_key = DocKey::generate();
        let id = commit_key.as_str().to_string();

        let mut stage = WriteBatch::new(format!("commit {} on {}", id, path));
        let mut staged = Staged {
            reopened: Vec::new(),
            written: Vec::new(),
            commit_key,
        };
        let mut recorded = Vec::with_capacity(changes.len());

        for mutation in changes.mutations() {
            let object = mutation.object();
            let previous = current.get(object);

            if let Some(own) = previous.filter(|rev| &rev.segment == path && rev.replaced.is_none()) {
                let mut closed = own.clone();
                closed.replaced = Some(timestamp);
                stage.upsert(CollectionName::revisions(), RevisionStore::to_document(&closed)?);
                staged.reopened.push(own.clone());
            }

            let (op, revision) = match mutation {
                Mutation::Create {
                    container, attributes, ..
                } => {
                    let state = ObjectState {
                        container: container.clone(),
                        attributes: attributes.clone(),
                    };
                    (ChangeOp::Add, Revision::live(object.clone(), path.clone(), timestamp, &id, state))
                }
                Mutation::Update {
                    container, attributes, ..
                } => {
                    let state = ObjectState {
                        container: container.clone().or_else(|| previous.and_then(|p| p.container.clone())),
                        attributes: attributes.clone(),
                    };
                    (ChangeOp::Change, Revision::live(object.clone(), path.clone(), timestamp, &id, state))
                }
                Mutation::Delete { .. } => (
                    ChangeOp::Remove,
                    Revision::tombstone(object.clone(), path.clone(), timestamp, &id),
                ),
            };

            let doc = RevisionStore::to_document(&revision)?;
            staged.written.push(doc.key.clone());
            stage.upsert(CollectionName::revisions(), doc);

            recorded.push(ObjectChange {
                object: object.clone(),
                op,
                before: previous.filter(|rev| !rev.deleted).map(Revision::reference),
                after: (op != ChangeOp::Remove).then(|| revision.reference()),
            });
        }

        let commit = Commit {
            id: id.clone(),
            branch: path.clone(),
            timestamp,
            author: author.to_string(),
            comment: comment.to_string(),
            change_count: recorded.len(),
            changes: recorded,
            merge_source: options.merge_source,
            committed_at: Utc::now(),
        };
        stage.upsert(
            CollectionName::commits(),
            Document::from_serialize(staged.commit_key.clone(), &commit)?,
        );

        self.retry.run("stage commit", || self.index.bulk_write(stage.clone()))?;
        debug!(branch = %path, commit = %id, timestamp, "staged commit");

        let mut published = branch;
        published.head_timestamp = timestamp;
        if let Some(base) = options.new_base {
            published.base_timestamp = base;
            published.state = BranchState::Active;
        }
        let mut publish = WriteBatch::new(format!("publish {}@{}", path, timestamp));
        publish.upsert(CollectionName::branches(), self.branches.publish_document(guard, &published)?);

        if let Err(e) = self.retry.run("publish commit", || self.index.bulk_write(publish.clone())) {
            self.compensate(path, &id, staged);
            return Err(e.into());
        }

        info!(
            branch = %path,
            commit = %id,
            timestamp,
            changes = commit.change_count,
            merge = commit.is_merge(),
            "published commit"
        );
        Ok(commit)
    }

    fn check_preconditions(
        &self,
        branch: &Branch,
        changes: &ChangeSet,
        current: &BTreeMap<ObjectId, Revision>,
        chain: &ReadChain,
    ) -> StoreResult<()> {
        let live = |object: &ObjectId| current.get(object).is_some_and(|rev| !rev.deleted);
        let created: BTreeSet<&ObjectId> = changes.created().map(|(object, _)| object).collect();

        for mutation in changes.mutations() {
            let object = mutation.object();
            match mutation {
                Mutation::Create { container, .. } => {
                    if live(object) {
                        return Err(StoreError::AlreadyExists {
                            kind: "object",
                            id: format!("{} on {}", object, branch.path),
                        });
                    }
                    if let Some(container) = container {
                        if !created.contains(container) && self.revisions.get(container, chain)?.is_none() {
                            return Err(StoreError::NotFound {
                                kind: "container",
                                id: format!("{} on {}", container, branch.path),
                            });
                        }
                    }
                }
                Mutation::Update { .. } | Mutation::Delete { .. } => {
                    if !live(object) {
                        return Err(StoreError::object_not_found(format!("{} on {}", object, branch.path)));
                    }
                }
            }
        }
        Ok(())
    }

    /// Undo a staged commit whose publication failed.
    fn compensate(&self, path: &BranchPath, id: &str, staged: Staged) {
        let mut batch = WriteBatch::new(format!("rollback {} on {}", id, path));
        for original in &staged.reopened {
            match RevisionStore::to_document(original) {
                Ok(doc) => {
                    batch.upsert(CollectionName::revisions(), doc);
                }
                Err(e) => error!(branch = %path, commit = %id, error = %e, "cannot re-open revision"),
            }
        }
        for key in staged.written {
            batch.delete(CollectionName::revisions(), key);
        }
        batch.delete(CollectionName::commits(), staged.commit_key);

        match self.retry.run("rollback commit", || self.index.bulk_write(batch.clone())) {
            Ok(()) => warn!(branch = %path, commit = %id, "rolled back unpublished commit"),
            Err(e) => error!(branch = %path, commit = %id, error = %e, "rollback failed; staged revisions remain unpublished"),
        }
    }

    /// Look up a published commit by id.
    pub fn get_commit(&self, id: &str) -> StoreResult<Commit> {
        let not_found = || StoreError::NotFound {
            kind: "commit",
            id: id.to_string(),
        };
        let key = DocKey::new(id).map_err(|_| not_found())?;
        let collection = CollectionName::commits();
        let doc = self
            .retry
            .run("load commit", || self.index.get(&collection, &key))?
            .ok_or_else(not_found)?;
        let commit: Commit = doc.to_payload()?;

        let head = self.branches.load(&commit.branch)?.map(|b| b.head_timestamp);
        if head.map_or(true, |head| commit.timestamp > head) {
            return Err(not_found());
        }
        Ok(commit)
    }

    /// Published commits of a branch, oldest first.
    pub fn commits(&self, branch: &BranchPath) -> StoreResult<Vec<Commit>> {
        self.search(&CommitQuery::new().branch(branch.clone()))
    }

    /// Search the commit log. Results are ordered by timestamp.
    pub fn search(&self, query: &CommitQuery) -> StoreResult<Vec<Commit>> {
        let mut filter = Filter::All;
        if let Some(branch) = &query.branch {
            filter = filter.and(Filter::eq("branch", branch.to_string()));
        }
        if let Some(author) = &query.author {
            filter = filter.and(Filter::eq("author", author.as_str()));
        }
        if let Some(from) = query.from {
            filter = filter.and(Filter::gt("timestamp", from.saturating_sub(1)));
        }
        if let Some(to) = query.to {
            filter = filter.and(Filter::lte("timestamp", to));
        }

        let collection = CollectionName::commits();
        let docs = self
            .retry
            .run("search commits", || self.index.search(&collection, &filter))?;

        let mut heads: HashMap<BranchPath, Option<Timestamp>> = HashMap::new();
        let mut commits = Vec::new();
        for doc in docs {
            let commit: Commit = doc.to_payload()?;
            if !query.matches_comment(&commit.comment) {
                continue;
            }
            let head = match heads.get(&commit.branch) {
                Some(head) => *head,
                None => {
                    let head = self.branches.load(&commit.branch)?.map(|b| b.head_timestamp);
                    heads.insert(commit.branch.clone(), head);
                    head
                }
            };
            // staged but unpublished commits are not part of the log yet
            if head.is_some_and(|head| commit.timestamp <= head) {
                commits.push(commit);
            }
        }

        commits.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            commits.truncate(limit);
        }
        Ok(commits)
    }

    /// Rebuild a branch's head state from the state at its base plus its own
    /// commits since then.
    pub fn replay(&self, path: &BranchPath) -> StoreResult<BTreeMap<ObjectId, ObjectState>> {
        let branch = self.branches.get(path)?;
        let base_view = self.branches.read_chain(path, Some(branch.base_timestamp))?;

        let mut state: BTreeMap<ObjectId, ObjectState> = self
            .revisions
            .visible(&base_view, None)?
            .into_iter()
            .filter_map(|(object, rev)| rev.state().map(|s| (object, s)))
            .collect();

        let commits = self.search(&CommitQuery::new().branch(path.clone()).between(Some(branch.base_timestamp + 1), None))?;
        for commit in &commits {
            for change in &commit.changes {
                match (&change.op, &change.after) {
                    (ChangeOp::Remove, _) | (_, None) => {
                        state.remove(&change.object);
                    }
                    (_, Some(after)) => {
                        let revision = self
                            .revisions
                            .load(&change.object, after)?
                            .ok_or_else(|| StoreError::object_not_found(&change.object))?;
                        if let Some(s) = revision.state() {
                            state.insert(change.object.clone(), s);
                        }
                    }
                }
            }
        }

        debug!(branch = %path, commits = commits.len(), objects = state.len(), "replayed branch");
        Ok(state)
    }
}
