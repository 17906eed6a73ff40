//!  Index reference management.
//!
//!  The git-backed index keeps a single ref pointing at the commit that holds
//!  the current document set. Writers move it with compare-and-swap so that
//!  two processes sharing a repository never lose each other's batches.

use git2::Repository;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::CommitId;

/// Manages the index ref.
pub struct RefManager;

impl RefManager {
    /// the ref holding the current index state
    pub const INDEX_REF: &'static str = "refs/heads/index";

    /// Resolve the index ref to its current commit ID.
    pub fn resolve(repo: &Repository) -> StorageResult<CommitId> {
        let reference = repo
            .find_reference(Self::INDEX_REF)
            .map_err(|_| StorageError::Internal(format!("ref {} missing", Self::INDEX_REF)))?;

        let commit = reference.peel_to_commit()?;
        Ok(CommitId::new(commit.id()))
    }

    /// Check if the index ref exists.
    pub fn exists(repo: &Repository) -> bool {
        repo.find_reference(Self::INDEX_REF).is_ok()
    }

    /// Create the index ref at the initial commit and point HEAD at it.
    pub fn init(repo: &Repository, initial_commit: CommitId) -> StorageResult<()> {
        if !Self::exists(repo) {
            repo.reference(Self::INDEX_REF, initial_commit.raw(), false, "initialize index")?;
        }
        repo.set_head(Self::INDEX_REF)?;
        Ok(())
    }

    /// Move the index ref only if it still points to the expected commit.
    ///
    /// Returns `ConcurrentModification` if another writer got there first.
    pub fn update_if_unchanged(repo: &Repository, expected: CommitId, new_target: CommitId) -> StorageResult<()> {
        let current = Self::resolve(repo)?;
        if current != expected {
            return Err(StorageError::ConcurrentModification);
        }

        repo.reference_matching(
            Self::INDEX_REF,
            new_target.raw(),
            true,
            expected.raw(),
            &format!("advance index to {}", new_target.short()),
        )
        .map_err(|e| match e.code() {
            git2::ErrorCode::Modified => StorageError::ConcurrentModification,
            _ => StorageError::Git(e),
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::commit::{create_initial_commit, CommitBuilder};
    use crate::storage::tree::create_initial_tree;
    use crate::storage::types::GitSignature;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Repository, CommitId) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let initial = create_initial_commit(&repo, &GitSignature::revdb()).unwrap();
        RefManager::init(&repo, initial).unwrap();
        (dir, repo, initial)
    }

    #[test]
    fn test_init_and_resolve() {
        let (_dir, repo, initial) = setup();
        assert!(RefManager::exists(&repo));
        assert_eq!(RefManager::resolve(&repo).unwrap(), initial);
    }

    #[test]
    fn test_update_if_unchanged() {
        let (_dir, repo, c1) = setup();
        let tree_id = create_initial_tree(&repo).unwrap();
        let c2 = CommitBuilder::new(&repo).tree(tree_id).parent(c1).message("next").commit().unwrap();

        RefManager::update_if_unchanged(&repo, c1, c2).unwrap();
        assert_eq!(RefManager::resolve(&repo).unwrap(), c2);

        let stale = RefManager::update_if_unchanged(&repo, c1, c2);
        assert!(matches!(stale, Err(StorageError::ConcurrentModification)));
    }
}
