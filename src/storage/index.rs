//! The document index abstraction every backend implements.

use crate::storage::document::Document;
use crate::storage::error::StorageResult;
use crate::storage::filter::Filter;
use crate::storage::types::{CollectionName, DocKey};

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// insert or replace a document
    Upsert { collection: CollectionName, doc: Document },
    /// remove a document; removing an absent document is a no-op
    Delete { collection: CollectionName, key: DocKey },
}

/// An ordered group of mutations applied atomically by [`DocumentIndex::bulk_write`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
    message: String,
}

impl WriteBatch {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            ops: Vec::new(),
            message: message.into(),
        }
    }

    pub fn upsert(&mut self, collection: CollectionName, doc: Document) -> &mut Self {
        self.ops.push(WriteOp::Upsert { collection, doc });
        self
    }

    pub fn delete(&mut self, collection: CollectionName, key: DocKey) -> &mut Self {
        self.ops.push(WriteOp::Delete { collection, key });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    /// description recorded by backends that keep a write history
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Opaque searchable document store.
///
/// Implementations must make each `bulk_write` all-or-nothing: readers either
/// see every operation of the batch or none of them.
pub trait DocumentIndex: Send + Sync {
    /// fetch a document by key
    fn get(&self, collection: &CollectionName, key: &DocKey) -> StorageResult<Option<Document>>;

    /// all documents of the collection matching the filter, ordered by key
    fn search(&self, collection: &CollectionName, filter: &Filter) -> StorageResult<Vec<Document>>;

    /// apply the batch atomically
    fn bulk_write(&self, batch: WriteBatch) -> StorageResult<()>;
}
