//!  Git commit creation for the git-backed index.
//!
//!  every batch written to the git-backed index becomes one commit whose tree
//!  holds the full document set; the index ref always points at the latest.

use git2::Repository;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tree::TreeHandle;
use crate::storage::types::{CommitId, GitSignature, TreeId};

/// builder for creating commits with a fluent interface
pub struct CommitBuilder<'a> {
    repo: &'a Repository,
    tree_id: Option<TreeId>,
    parents: Vec<CommitId>,
    message: String,
    signature: GitSignature,
}

impl<'a> CommitBuilder<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            tree_id: None,
            parents: Vec::new(),
            message: String::new(),
            signature: GitSignature::revdb(),
        }
    }

    pub fn tree(mut self, tree_id: TreeId) -> Self {
        self.tree_id = Some(tree_id);
        self
    }

    pub fn parent(mut self, parent: CommitId) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }

    /// create the commit without moving any ref
    pub fn commit(self) -> StorageResult<CommitId> {
        let tree_id = self
            .tree_id
            .ok_or_else(|| StorageError::Internal("commit requires a tree".to_string()))?;

        let tree = self.repo.find_tree(tree_id.raw())?;
        let sig = self.signature.to_git2_signature()?;

        let parent_commits: Vec<git2::Commit<'_>> = self
            .parents
            .iter()
            .map(|id| self.repo.find_commit(id.raw()))
            .collect::<Result<_, _>>()?;
        let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();

        let oid = self.repo.commit(None, &sig, &sig, &self.message, &tree, &parent_refs)?;
        Ok(CommitId::new(oid))
    }
}

/// get the tree snapshot at a specific commit
pub fn get_tree_at_commit(repo: &Repository, commit_id: CommitId) -> StorageResult<TreeHandle<'_>> {
    let commit = repo
        .find_commit(commit_id.raw())
        .map_err(|_| StorageError::Internal(format!("index commit {} not found", commit_id.short())))?;

    Ok(TreeHandle::new(commit.tree()?))
}

/// create the initial commit for a new index
pub fn create_initial_commit(repo: &Repository, signature: &GitSignature) -> StorageResult<CommitId> {
    let tree_id = crate::storage::tree::create_initial_tree(repo)?;

    CommitBuilder::new(repo)
        .tree(tree_id)
        .message("[revdb] Initialize index")
        .signature(signature.clone())
        .commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tree::create_initial_tree;
    use crate::storage::types::CollectionName;
    use tempfile::TempDir;

    fn setup_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_initial_commit() {
        let (_dir, repo) = setup_repo();
        let commit_id = create_initial_commit(&repo, &GitSignature::revdb()).unwrap();
        let tree = get_tree_at_commit(&repo, commit_id).unwrap();
        assert!(tree
            .get_collection_tree(&repo, &CollectionName::revisions())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_builder_links_parent() {
        let (_dir, repo) = setup_repo();
        let c1 = create_initial_commit(&repo, &GitSignature::revdb()).unwrap();

        let tree_id = create_initial_tree(&repo).unwrap();
        let c2 = CommitBuilder::new(&repo)
            .tree(tree_id)
            .parent(c1)
            .message("second batch")
            .commit()
            .unwrap();

        let commit = repo.find_commit(c2.raw()).unwrap();
        assert_eq!(commit.message(), Some("second batch"));
        assert_eq!(commit.parent_count(), 1);
        assert_eq!(CommitId::new(commit.parent_id(0).unwrap()), c1);
        assert!(get_tree_at_commit(&repo, CommitId::new(git2::Oid::zero())).is_err());
    }

    #[test]
    fn test_commit_requires_tree() {
        let (_dir, repo) = setup_repo();
        assert!(matches!(
            CommitBuilder::new(&repo).message("empty").commit(),
            Err(StorageError::Internal(_))
        ));
    }
}
