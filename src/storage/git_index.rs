//!   Git-backed document index.
//!
//!  This wraps `git2::Repository` with thread-safe access. Every batch becomes
//!  one git commit, so the repository history doubles as an audit trail of
//!  index writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::Repository;
use parking_lot::Mutex;
use tracing::debug;

use crate::storage::commit::{self, CommitBuilder};
use crate::storage::document::{self, Document};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::filter::Filter;
use crate::storage::index::{DocumentIndex, WriteBatch, WriteOp};
use crate::storage::refs::RefManager;
use crate::storage::tree::TreeMutator;
use crate::storage::types::{BlobId, CollectionName, DocKey, GitSignature};

/// The git-backed index.
///
/// Clone this to share across threads - it uses Arc internally.
#[derive(Clone)]
pub struct GitIndex {
    inner: Arc<GitIndexInner>,
}

struct GitIndexInner {
    // git2::Repository is Send but not Sync, so access is serialized
    repo: Mutex<Repository>,
    path: PathBuf,
    signature: GitSignature,
}

impl GitIndex {
    /// Open an existing index repository.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::open(path).map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;
        if !RefManager::exists(&repo) {
            return Err(StorageError::NotInitialized(path.to_path_buf()));
        }

        Ok(Self::from_repo(repo, path))
    }

    /// Initialize a new index repository.
    pub fn init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::init(path)?;

        let initial = commit::create_initial_commit(&repo, &GitSignature::revdb())?;
        RefManager::init(&repo, initial)?;
        debug!(path = %path.display(), "initialized git index");

        Ok(Self::from_repo(repo, path))
    }

    /// Open or initialize an index repository.
    pub fn open_or_init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if path.join(".git").exists() {
            Self::open(path)
        } else {
            Self::init(path)
        }
    }

    fn from_repo(repo: Repository, path: &Path) -> Self {
        Self {
            inner: Arc::new(GitIndexInner {
                repo: Mutex::new(repo),
                path: path.to_path_buf(),
                signature: GitSignature::revdb(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Execute a function with exclusive access to the repository.
    pub fn with_repo<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.lock();
        f(&repo)
    }

    fn read_document(
        repo: &Repository,
        blob_id: BlobId,
        key: &DocKey,
    ) -> StorageResult<Document> {
        let bytes = document::read_blob(repo, blob_id)?;
        document::deserialize_document(&bytes, key)
    }
}

impl DocumentIndex for GitIndex {
    fn get(&self, collection: &CollectionName, key: &DocKey) -> StorageResult<Option<Document>> {
        self.with_repo(|repo| {
            let head = RefManager::resolve(repo)?;
            let tree = commit::get_tree_at_commit(repo, head)?;

            match tree.get_document_blob_id(repo, collection, key)? {
                Some(blob_id) => Ok(Some(Self::read_document(repo, blob_id, key)?)),
                None => Ok(None),
            }
        })
    }

    fn search(&self, collection: &CollectionName, filter: &Filter) -> StorageResult<Vec<Document>> {
        self.with_repo(|repo| {
            let head = RefManager::resolve(repo)?;
            let tree = commit::get_tree_at_commit(repo, head)?;

            let mut hits = Vec::new();
            for (key, blob_id) in tree.list_documents(repo, collection)? {
                let doc = Self::read_document(repo, blob_id, &key)?;
                if filter.matches(&doc) {
                    hits.push(doc);
                }
            }
            hits.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(hits)
        })
    }

    fn bulk_write(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        self.with_repo(|repo| {
            let head = RefManager::resolve(repo)?;
            let tree = commit::get_tree_at_commit(repo, head)?;
            let mut mutator = TreeMutator::from_tree(repo, &tree)?;

            let message = format!("[revdb] {} ({} ops)", batch.message(), batch.len());
            for op in batch.into_ops() {
                match op {
                    WriteOp::Upsert { collection, doc } => {
                        let previous = match tree.get_document_blob_id(repo, &collection, &doc.key)? {
                            Some(blob_id) => Some(Self::read_document(repo, blob_id, &doc.key)?),
                            None => None,
                        };
                        let doc = doc.succeeding(previous.as_ref());
                        let blob_id = document::write_blob(repo, &doc)?;
                        mutator.upsert_document(&collection, &doc.key, blob_id)?;
                    }
                    WriteOp::Delete { collection, key } => {
                        mutator.delete_document(&collection, &key)?;
                    }
                }
            }

            let new_tree_id = mutator.write()?;
            let new_commit = CommitBuilder::new(repo)
                .tree(new_tree_id)
                .parent(head)
                .message(message)
                .signature(self.inner.signature.clone())
                .commit()?;

            RefManager::update_if_unchanged(repo, head, new_commit)
        })
    }
}

impl std::fmt::Debug for GitIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitIndex").field("path", &self.inner.path).finish()
    }
}
