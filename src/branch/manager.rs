//! Branch hierarchy management.
//!
//! Branch documents live in the `branches` collection keyed by path. Paths are
//! never reused: deletion sets a tombstone flag and leaves the document (and
//! every revision written on the branch) in place for audit and compare.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::branch::model::{Branch, BranchState};
use crate::branch::path::BranchPath;
use crate::clock::{Clock, Timestamp};
use crate::commit::lock::{BranchLocks, BranchWriteGuard};
use crate::error::{StoreError, StoreResult};
use crate::retry::RetryPolicy;
use crate::revision::ReadChain;
use crate::storage::{CollectionName, Document, DocumentIndex, Filter, StorageError, StorageResult, WriteBatch};

/// Creates, reads and retires branches.
#[derive(Clone)]
pub struct BranchManager {
    index: Arc<dyn DocumentIndex>,
    locks: Arc<BranchLocks>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl BranchManager {
    pub fn new(
        index: Arc<dyn DocumentIndex>,
        locks: Arc<BranchLocks>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            index,
            locks,
            clock,
            retry,
        }
    }

    /// Serialize a branch into its index document.
    pub fn to_document(branch: &Branch) -> StorageResult<Document> {
        Document::from_serialize(branch.path.doc_key()?, branch)
    }

    /// Make sure `MAIN` exists, creating it empty if the index is new.
    pub fn init(&self) -> StoreResult<Branch> {
        let main = BranchPath::main();
        if let Some(branch) = self.load(&main)? {
            return Ok(branch);
        }

        let _guard = self.locks.lock(&main)?;
        if let Some(branch) = self.load(&main)? {
            return Ok(branch);
        }
        let branch = Branch::root(self.clock.now());
        self.write(&branch, "init MAIN")?;
        info!(branch = %branch.path, timestamp = branch.head_timestamp, "created root branch");
        Ok(branch)
    }

    /// Stored branch document, tombstoned or not, with its persisted state.
    pub(crate) fn load(&self, path: &BranchPath) -> StoreResult<Option<Branch>> {
        let key = path.doc_key().map_err(StorageError::from)?;
        let collection = CollectionName::branches();
        let doc = self.retry.run("load branch", || self.index.get(&collection, &key))?;
        doc.map(|d| d.to_payload::<Branch>().map_err(Into::into)).transpose()
    }

    fn write(&self, branch: &Branch, message: &str) -> StoreResult<()> {
        let mut batch = WriteBatch::new(message);
        batch.upsert(CollectionName::branches(), Self::to_document(branch)?);
        self.retry.run("write branch", || self.index.bulk_write(batch.clone()))?;
        Ok(())
    }

    /// Fill in the state a reader should see.
    fn derive_state(&self, mut branch: Branch) -> StoreResult<Branch> {
        if branch.state == BranchState::Stray {
            return Ok(branch);
        }
        let Some(parent_path) = branch.parent_path.clone() else {
            branch.state = BranchState::Active;
            return Ok(branch);
        };
        branch.state = match self.load(&parent_path)? {
            Some(parent) if !parent.deleted && parent.state != BranchState::Stray => {
                if parent.head_timestamp > branch.base_timestamp {
                    BranchState::Stale
                } else {
                    BranchState::Active
                }
            }
            _ => BranchState::Stray,
        };
        Ok(branch)
    }

    /// Look up a live branch.
    pub fn get(&self, path: &BranchPath) -> StoreResult<Branch> {
        match self.load(path)? {
            Some(branch) if !branch.deleted => self.derive_state(branch),
            _ => Err(StoreError::branch_not_found(path)),
        }
    }

    pub fn exists(&self, path: &BranchPath) -> StoreResult<bool> {
        Ok(self.load(path)?.is_some_and(|b| !b.deleted))
    }

    /// Fork a new branch from the parent's current head.
    pub fn create(&self, parent: &BranchPath, name: &str, metadata: BTreeMap<String, String>) -> StoreResult<Branch> {
        let path = parent
            .child(name)
            .map_err(|e| StoreError::invalid(format!("branch name '{}' under {}: {}", name, parent, e)))?;

        let _guard = self.locks.lock(&path)?;
        if self.load(&path)?.is_some() {
            return Err(StoreError::AlreadyExists {
                kind: "branch",
                id: path.to_string(),
            });
        }

        let parent = self.get(parent)?;
        let branch = Branch::fork(&parent, path, metadata);
        self.write(&branch, &format!("create {}", branch.path))?;

        info!(branch = %branch.path, base = branch.base_timestamp, "created branch");
        Ok(branch)
    }

    /// Tombstone a branch and mark every descendant STRAY.
    pub fn delete(&self, path: &BranchPath) -> StoreResult<()> {
        if path.is_main() {
            return Err(StoreError::invalid("MAIN cannot be deleted"));
        }

        // descendant commits rewrite their branch document; hold them off
        // while the STRAY marks go in
        let mut locked: Vec<BranchPath> = self
            .search(&Filter::prefix("path", path.descendant_prefix()))?
            .into_iter()
            .filter(|b| !b.deleted)
            .map(|b| b.path)
            .collect();
        locked.push(path.clone());
        let _guard = self.locks.lock_all(&locked)?;

        let mut branch = match self.load(path)? {
            Some(branch) if !branch.deleted => branch,
            _ => return Err(StoreError::branch_not_found(path)),
        };
        branch.deleted = true;

        let mut batch = WriteBatch::new(format!("delete {}", path));
        batch.upsert(CollectionName::branches(), Self::to_document(&branch)?);

        let mut strays = 0;
        for mut descendant in self.search(&Filter::prefix("path", path.descendant_prefix()))? {
            if descendant.state != BranchState::Stray {
                descendant.state = BranchState::Stray;
                batch.upsert(CollectionName::branches(), Self::to_document(&descendant)?);
                strays += 1;
            }
        }

        self.retry.run("delete branch", || self.index.bulk_write(batch.clone()))?;
        info!(branch = %path, strays, "deleted branch");
        Ok(())
    }

    fn search(&self, filter: &Filter) -> StoreResult<Vec<Branch>> {
        let collection = CollectionName::branches();
        let docs = self
            .retry
            .run("search branches", || self.index.search(&collection, filter))?;
        docs.iter()
            .map(|doc| doc.to_payload::<Branch>().map_err(Into::into))
            .collect()
    }

    /// Live branches, ordered by path. With a prefix, only that branch and its
    /// descendants are returned.
    pub fn list(&self, prefix: Option<&BranchPath>) -> StoreResult<Vec<Branch>> {
        let filter = match prefix {
            Some(prefix) => Filter::prefix("path", prefix.as_str()),
            None => Filter::All,
        };

        let mut branches = Vec::new();
        for branch in self.search(&filter)? {
            if branch.deleted {
                continue;
            }
            if let Some(prefix) = prefix {
                if &branch.path != prefix && !prefix.is_ancestor_of(&branch.path) {
                    continue;
                }
            }
            branches.push(self.derive_state(branch)?);
        }
        branches.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(branches)
    }

    /// Direct children of a branch.
    pub fn children(&self, path: &BranchPath) -> StoreResult<Vec<Branch>> {
        Ok(self
            .list(Some(path))?
            .into_iter()
            .filter(|b| b.parent_path.as_ref() == Some(path))
            .collect())
    }

    /// The branch followed by its ancestors up to `MAIN`.
    ///
    /// Tombstoned ancestors are included; their revisions stay readable.
    pub fn chain(&self, path: &BranchPath) -> StoreResult<Vec<Branch>> {
        path.chain()
            .iter()
            .map(|p| self.load(p)?.ok_or_else(|| StoreError::branch_not_found(p)))
            .collect()
    }

    /// Resolution chain for reads on a live branch at `at` (default: head).
    pub fn read_chain(&self, path: &BranchPath, at: Option<Timestamp>) -> StoreResult<ReadChain> {
        let chain = self.chain(path)?;
        if chain.first().map_or(true, |b| b.deleted) {
            return Err(StoreError::branch_not_found(path));
        }
        Ok(ReadChain::new(&chain, at))
    }

    /// Publish a new head (and optionally base) for a branch the caller holds
    /// the write lock on.
    pub(crate) fn publish_document(
        &self,
        guard: &BranchWriteGuard<'_>,
        branch: &Branch,
    ) -> StoreResult<Document> {
        if !guard.covers(&branch.path) {
            return Err(StoreError::Conflict(format!("write lock for {} not held", branch.path)));
        }
        Ok(Self::to_document(branch)?)
    }

    /// Move a locked branch's base forward, e.g. after absorbing its parent.
    pub(crate) fn advance_base(
        &self,
        guard: &BranchWriteGuard<'_>,
        path: &BranchPath,
        base: Timestamp,
    ) -> StoreResult<Branch> {
        let mut branch = self.get(path)?;
        if base <= branch.base_timestamp {
            return Ok(branch);
        }
        branch.base_timestamp = base;
        branch.head_timestamp = branch.head_timestamp.max(base);
        branch.state = BranchState::Active;

        let mut batch = WriteBatch::new(format!("rebase {}", path));
        batch.upsert(CollectionName::branches(), self.publish_document(guard, &branch)?);
        self.retry.run("advance base", || self.index.bulk_write(batch.clone()))?;

        info!(branch = %path, base, "advanced branch base");
        Ok(branch)
    }

    /// Highest head timestamp recorded in the index.
    pub fn latest_head(&self) -> StoreResult<Option<Timestamp>> {
        Ok(self.search(&Filter::All)?.iter().map(|b| b.head_timestamp).max())
    }

    pub fn locks(&self) -> &Arc<BranchLocks> {
        &self.locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::clock::MonotonicClock;
    use crate::storage::MemoryIndex;

    fn setup() -> BranchManager {
        let manager = BranchManager::new(
            Arc::new(MemoryIndex::new()),
            Arc::new(BranchLocks::new(Duration::from_millis(100))),
            Arc::new(MonotonicClock::new()),
            RetryPolicy::none(),
        );
        manager.init().unwrap();
        manager
    }

    fn path(s: &str) -> BranchPath {
        BranchPath::new(s).unwrap()
    }

    /// simulate a commit on a branch by moving its head
    fn bump_head(manager: &BranchManager, p: &BranchPath, head: Timestamp) {
        let mut branch = manager.load(p).unwrap().unwrap();
        branch.head_timestamp = head;
        manager.write(&branch, "bump").unwrap();
    }

    #[test]
    fn test_init_is_idempotent() {
        let manager = setup();
        let main = manager.get(&BranchPath::main()).unwrap();
        assert_eq!(manager.init().unwrap(), main);
        assert_eq!(main.state, BranchState::Active);
        assert_eq!(main.base_timestamp, main.head_timestamp);
    }

    #[test]
    fn test_create_forks_at_parent_head() {
        let manager = setup();
        let main = manager.get(&BranchPath::main()).unwrap();
        let meta = BTreeMap::from([("owner".to_string(), "alice".to_string())]);
        let task = manager.create(&BranchPath::main(), "task1", meta.clone()).unwrap();

        assert_eq!(task.path, path("MAIN/task1"));
        assert_eq!(task.base_timestamp, main.head_timestamp);
        assert_eq!(task.metadata, meta);
        assert_eq!(manager.get(&task.path).unwrap().state, BranchState::Active);
    }

    #[test]
    fn test_create_errors() {
        let manager = setup();
        manager.create(&BranchPath::main(), "a", BTreeMap::new()).unwrap();

        let dup = manager.create(&BranchPath::main(), "a", BTreeMap::new()).unwrap_err();
        assert!(matches!(dup, StoreError::AlreadyExists { .. }));

        let orphan = manager.create(&path("MAIN/missing"), "x", BTreeMap::new()).unwrap_err();
        assert!(orphan.is_not_found());

        let bad = manager.create(&BranchPath::main(), "a/b", BTreeMap::new()).unwrap_err();
        assert!(matches!(bad, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_state_goes_stale_when_parent_moves() {
        let manager = setup();
        let task = manager.create(&BranchPath::main(), "task1", BTreeMap::new()).unwrap();
        bump_head(&manager, &BranchPath::main(), task.base_timestamp + 10);

        assert_eq!(manager.get(&task.path).unwrap().state, BranchState::Stale);

        let guard = manager.locks().lock(&task.path).unwrap();
        let rebased = manager.advance_base(&guard, &task.path, task.base_timestamp + 10).unwrap();
        drop(guard);
        assert_eq!(rebased.base_timestamp, task.base_timestamp + 10);
        assert!(rebased.head_timestamp >= rebased.base_timestamp);
        assert_eq!(manager.get(&task.path).unwrap().state, BranchState::Active);
    }

    #[test]
    fn test_delete_tombstones_and_cascades() {
        let manager = setup();
        manager.create(&BranchPath::main(), "a", BTreeMap::new()).unwrap();
        manager.create(&path("MAIN/a"), "b", BTreeMap::new()).unwrap();
        manager.create(&BranchPath::main(), "ab", BTreeMap::new()).unwrap();

        manager.delete(&path("MAIN/a")).unwrap();

        assert!(manager.get(&path("MAIN/a")).unwrap_err().is_not_found());
        assert_eq!(manager.get(&path("MAIN/a/b")).unwrap().state, BranchState::Stray);
        assert_eq!(manager.get(&path("MAIN/ab")).unwrap().state, BranchState::Active);

        // deleted paths are never reused
        let reuse = manager.create(&BranchPath::main(), "a", BTreeMap::new()).unwrap_err();
        assert!(matches!(reuse, StoreError::AlreadyExists { .. }));

        // the tombstoned ancestor still participates in resolution chains
        assert_eq!(manager.chain(&path("MAIN/a/b")).unwrap().len(), 3);
        assert!(manager.read_chain(&path("MAIN/a"), None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_waits_for_descendant_writers() {
        let manager = setup();
        manager.create(&BranchPath::main(), "a", BTreeMap::new()).unwrap();
        let child = manager.create(&path("MAIN/a"), "b", BTreeMap::new()).unwrap().path;

        let guard = manager.locks().lock(&child).unwrap();
        let err = manager.delete(&path("MAIN/a")).unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        assert!(manager.exists(&path("MAIN/a")).unwrap());
        assert_eq!(manager.get(&child).unwrap().state, BranchState::Active);

        drop(guard);
        manager.delete(&path("MAIN/a")).unwrap();
        assert_eq!(manager.get(&child).unwrap().state, BranchState::Stray);
    }

    #[test]
    fn test_main_cannot_be_deleted() {
        let manager = setup();
        assert!(matches!(
            manager.delete(&BranchPath::main()),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(manager.delete(&path("MAIN/nope")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_and_children() {
        let manager = setup();
        manager.create(&BranchPath::main(), "a", BTreeMap::new()).unwrap();
        manager.create(&path("MAIN/a"), "b", BTreeMap::new()).unwrap();
        manager.create(&BranchPath::main(), "ab", BTreeMap::new()).unwrap();
        manager.create(&BranchPath::main(), "gone", BTreeMap::new()).unwrap();
        manager.delete(&path("MAIN/gone")).unwrap();

        let all: Vec<String> = manager.list(None).unwrap().iter().map(|b| b.path.to_string()).collect();
        assert_eq!(all, vec!["MAIN", "MAIN/a", "MAIN/a/b", "MAIN/ab"]);

        let under_a: Vec<String> = manager
            .list(Some(&path("MAIN/a")))
            .unwrap()
            .iter()
            .map(|b| b.path.to_string())
            .collect();
        assert_eq!(under_a, vec!["MAIN/a", "MAIN/a/b"]);

        let children = manager.children(&BranchPath::main()).unwrap();
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_create_waits_for_lock() {
        let manager = setup();
        let target = path("MAIN/busy");
        let _guard = manager.locks().lock(&target).unwrap();

        let err = manager.create(&BranchPath::main(), "busy", BTreeMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
    }
}
