//! In-memory document index.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::storage::document::Document;
use crate::storage::error::StorageResult;
use crate::storage::filter::Filter;
use crate::storage::index::{DocumentIndex, WriteBatch, WriteOp};
use crate::storage::types::{CollectionName, DocKey};

/// A process-local index backed by ordered maps.
///
/// A single writer lock covers a whole batch, which gives `bulk_write` its
/// atomicity.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    collections: RwLock<HashMap<CollectionName, BTreeMap<DocKey, Document>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// number of documents in a collection
    pub fn count(&self, collection: &CollectionName) -> usize {
        self.collections.read().get(collection).map_or(0, BTreeMap::len)
    }
}

impl DocumentIndex for MemoryIndex {
    fn get(&self, collection: &CollectionName, key: &DocKey) -> StorageResult<Option<Document>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    fn search(&self, collection: &CollectionName, filter: &Filter) -> StorageResult<Vec<Document>> {
        let collections = self.collections.read();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        Ok(docs.values().filter(|doc| filter.matches(doc)).cloned().collect())
    }

    fn bulk_write(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut collections = self.collections.write();

        for op in batch.into_ops() {
            match op {
                WriteOp::Upsert { collection, doc } => {
                    let docs = collections.entry(collection).or_default();
                    let previous = docs.get(&doc.key);
                    let doc = doc.succeeding(previous);
                    docs.insert(doc.key.clone(), doc);
                }
                WriteOp::Delete { collection, key } => {
                    if let Some(docs) = collections.get_mut(&collection) {
                        docs.remove(&key);
                    }
                }
            }
        }

        Ok(())
    }
}
