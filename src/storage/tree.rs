//!  tree operations for the git-backed index.
//!
//! in Git, a tree is a directory. In the git-backed index:
//! - the root tree contains one directory per collection
//! - each collection directory contains document blobs (JSON files)
//!
//! this module provides safe abstractions over Git's tree manipulation,
//! which is notoriously fiddly to get right.

use std::collections::HashMap;

use git2::{FileMode, ObjectType, Repository, Tree, TreeBuilder as Git2TreeBuilder};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BlobId, CollectionName, DocKey, TreeId};

/// A read only handle to a git tree at a specific commit
///
/// think of it as a snapshot - it won't change even if new commits are made.
#[derive(Debug)]
pub struct TreeHandle<'repo> {
    tree: Tree<'repo>,
}

impl<'repo> TreeHandle<'repo> {
    pub(crate) fn new(tree: Tree<'repo>) -> Self {
        Self { tree }
    }

    pub fn id(&self) -> TreeId {
        TreeId::new(self.tree.id())
    }

    pub(crate) fn inner(&self) -> &Tree<'repo> {
        &self.tree
    }

    /// get the tree for a specific collection
    pub fn get_collection_tree(
        &self,
        repo: &'repo Repository,
        collection: &CollectionName,
    ) -> StorageResult<Option<TreeHandle<'repo>>> {
        match self.tree.get_name(collection.as_str()) {
            Some(entry) => {
                if entry.kind() != Some(ObjectType::Tree) {
                    return Err(StorageError::UnexpectedEntryType {
                        path: collection.as_str().into(),
                        expected: "tree (directory)".to_string(),
                        found: format!("{:?}", entry.kind()),
                    });
                }
                let tree = repo.find_tree(entry.id())?;
                Ok(Some(TreeHandle::new(tree)))
            }
            None => Ok(None),
        }
    }

    /// list every document key with its blob in a collection
    ///
    /// an absent collection has no documents
    pub fn list_documents(
        &self,
        repo: &'repo Repository,
        collection: &CollectionName,
    ) -> StorageResult<Vec<(DocKey, BlobId)>> {
        let Some(collection_tree) = self.get_collection_tree(repo, collection)? else {
            return Ok(Vec::new());
        };

        let docs = collection_tree
            .tree
            .iter()
            .filter_map(|entry| {
                if entry.kind() != Some(ObjectType::Blob) {
                    return None;
                }
                let key = DocKey::new(entry.name()?.strip_suffix(".json")?).ok()?;
                Some((key, BlobId::new(entry.id())))
            })
            .collect();

        Ok(docs)
    }

    /// get the blob ID for a specific document
    pub fn get_document_blob_id(
        &self,
        repo: &'repo Repository,
        collection: &CollectionName,
        key: &DocKey,
    ) -> StorageResult<Option<BlobId>> {
        let Some(collection_tree) = self.get_collection_tree(repo, collection)? else {
            return Ok(None);
        };

        let filename = format!("{}.json", key);
        let Some(entry) = collection_tree.tree.get_name(&filename) else {
            return Ok(None);
        };
        if entry.kind() != Some(ObjectType::Blob) {
            return Err(StorageError::UnexpectedEntryType {
                path: format!("{}/{}", collection, filename).into(),
                expected: "blob (file)".to_string(),
                found: format!("{:?}", entry.kind()),
            });
        }
        Ok(Some(BlobId::new(entry.id())))
    }
}

/// a mutable tree builder for making changes
///
/// this adds up changes and produces a new tree when its final;
/// the original tree is not modified
///
/// ```ignore
/// let mut builder = TreeMutator::from_tree(repo, &tree)?;
/// builder.upsert_document(&revisions, &key, blob_id)?;
/// builder.delete_document(&commits, &old_key)?;
/// let new_tree_id = builder.write()?;
/// ```
pub struct TreeMutator<'repo> {
    repo: &'repo Repository,
    root_builder: Git2TreeBuilder<'repo>,
    /// collections touched by this mutator
    modified: HashMap<String, Git2TreeBuilder<'repo>>,
    /// original collection tree IDs for collections we haven't touched
    original: HashMap<String, git2::Oid>,
}

impl<'repo> TreeMutator<'repo> {
    /// create a new TreeMutator from an existing tree
    pub fn from_tree(repo: &'repo Repository, tree: &TreeHandle<'_>) -> StorageResult<Self> {
        let root_builder = repo.treebuilder(Some(tree.inner()))?;

        let mut original = HashMap::new();
        for entry in tree.inner().iter() {
            if entry.kind() == Some(ObjectType::Tree) {
                if let Some(name) = entry.name() {
                    original.insert(name.to_string(), entry.id());
                }
            }
        }

        Ok(Self {
            repo,
            root_builder,
            modified: HashMap::new(),
            original,
        })
    }

    /// create a new TreeMutator for an empty tree
    pub fn empty(repo: &'repo Repository) -> StorageResult<Self> {
        Ok(Self {
            repo,
            root_builder: repo.treebuilder(None)?,
            modified: HashMap::new(),
            original: HashMap::new(),
        })
    }

    /// get or create a builder for a collection's subtree
    fn collection_builder(&mut self, collection: &CollectionName) -> StorageResult<&mut Git2TreeBuilder<'repo>> {
        let name = collection.as_str();
        if !self.modified.contains_key(name) {
            let builder = match self.original.get(name) {
                Some(original_id) => {
                    let original_tree = self.repo.find_tree(*original_id)?;
                    self.repo.treebuilder(Some(&original_tree))?
                }
                None => self.repo.treebuilder(None)?,
            };
            self.modified.insert(name.to_string(), builder);
        }

        self.modified
            .get_mut(name)
            .ok_or_else(|| StorageError::Internal(format!("missing builder for {}", collection)))
    }

    /// insert or replace a document blob, creating the collection on demand
    pub fn upsert_document(&mut self, collection: &CollectionName, key: &DocKey, blob_id: BlobId) -> StorageResult<()> {
        let filename = format!("{}.json", key);
        self.collection_builder(collection)?
            .insert(&filename, blob_id.raw(), FileMode::Blob.into())?;
        Ok(())
    }

    /// delete a document; absent documents are ignored
    pub fn delete_document(&mut self, collection: &CollectionName, key: &DocKey) -> StorageResult<()> {
        let filename = format!("{}.json", key);
        let builder = self.collection_builder(collection)?;
        if builder.get(&filename)?.is_some() {
            builder.remove(&filename)?;
        }
        Ok(())
    }

    /// write all changes and return the new root tree ID
    pub fn write(mut self) -> StorageResult<TreeId> {
        for (name, builder) in self.modified {
            let collection_tree_id = builder.write()?;
            self.root_builder.insert(&name, collection_tree_id, FileMode::Tree.into())?;
        }

        let root_id = self.root_builder.write()?;
        Ok(TreeId::new(root_id))
    }
}

/// helper function to create an initial empty tree
pub fn create_initial_tree(repo: &Repository) -> StorageResult<TreeId> {
    TreeMutator::empty(repo)?.write()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    fn handle(repo: &Repository, tree_id: TreeId) -> TreeHandle<'_> {
        TreeHandle::new(repo.find_tree(tree_id.raw()).unwrap())
    }

    #[test]
    fn test_empty_tree_has_no_collections() {
        let (_dir, repo) = setup_repo();
        let tree_id = create_initial_tree(&repo).unwrap();
        let tree = handle(&repo, tree_id);
        assert!(tree.get_collection_tree(&repo, &CollectionName::revisions()).unwrap().is_none());
    }

    #[test]
    fn test_upsert_creates_collection_and_lists_documents() {
        let (_dir, repo) = setup_repo();
        let tree_id = create_initial_tree(&repo).unwrap();
        let revisions = CollectionName::revisions();
        let blob_id = BlobId::new(repo.blob(b"{}").unwrap());

        let mut mutator = TreeMutator::from_tree(&repo, &handle(&repo, tree_id)).unwrap();
        mutator.upsert_document(&revisions, &DocKey::new("r1").unwrap(), blob_id).unwrap();
        mutator.upsert_document(&revisions, &DocKey::new("r2").unwrap(), blob_id).unwrap();
        let tree_id = mutator.write().unwrap();

        let tree = handle(&repo, tree_id);
        assert!(tree.get_collection_tree(&repo, &revisions).unwrap().is_some());
        assert!(tree.get_collection_tree(&repo, &CollectionName::commits()).unwrap().is_none());
        let docs = tree.list_documents(&repo, &revisions).unwrap();
        assert_eq!(docs.len(), 2);
        assert!(tree
            .get_document_blob_id(&repo, &revisions, &DocKey::new("r1").unwrap())
            .unwrap()
            .is_some());
        assert!(tree
            .get_document_blob_id(&repo, &revisions, &DocKey::new("r9").unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_delete_document() {
        let (_dir, repo) = setup_repo();
        let tree_id = create_initial_tree(&repo).unwrap();
        let commits = CollectionName::commits();
        let key = DocKey::new("c1").unwrap();
        let blob_id = BlobId::new(repo.blob(b"test").unwrap());

        let mut mutator = TreeMutator::from_tree(&repo, &handle(&repo, tree_id)).unwrap();
        mutator.upsert_document(&commits, &key, blob_id).unwrap();
        let tree_id = mutator.write().unwrap();

        let mut mutator = TreeMutator::from_tree(&repo, &handle(&repo, tree_id)).unwrap();
        mutator.delete_document(&commits, &key).unwrap();
        mutator.delete_document(&commits, &DocKey::new("absent").unwrap()).unwrap();
        let tree_id = mutator.write().unwrap();

        let tree = handle(&repo, tree_id);
        assert!(tree.list_documents(&repo, &commits).unwrap().is_empty());
        assert!(tree.get_document_blob_id(&repo, &commits, &key).unwrap().is_none());
    }

    #[test]
    fn test_missing_collection_reads_empty() {
        let (_dir, repo) = setup_repo();
        let tree_id = create_initial_tree(&repo).unwrap();
        let tree = handle(&repo, tree_id);
        assert!(tree.list_documents(&repo, &CollectionName::branches()).unwrap().is_empty());
    }
}
