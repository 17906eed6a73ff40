//! storage layer: the opaque document index
//!
//! The revision store, branch manager and commit log only talk to the
//! [`DocumentIndex`] trait: get by key, search with a filter, and atomic bulk
//! writes. Two backends are provided.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     DocumentIndex                           │
//! │        (get / search-with-filter / atomic bulk write)       │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//!          ┌─────────────┐                ┌─────────────┐
//!          │ MemoryIndex │                │  GitIndex   │
//!          │   (maps)    │                │ (git repo)  │
//!          └─────────────┘                └─────────────┘
//!                                                │
//!                              ┌─────────────────┼──────────────┐
//!                              ▼                 ▼              ▼
//!                        ┌──────────┐     ┌──────────┐   ┌──────────┐
//!                        │   tree   │     │ document │   │   refs   │
//!                        │(collect.)│     │  (blobs) │   │ (head)   │
//!                        └──────────┘     └──────────┘   └──────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use revdb::storage::{CollectionName, DocKey, Document, DocumentIndex, Filter, MemoryIndex, WriteBatch};
//!
//! let index = MemoryIndex::new();
//! let mut batch = WriteBatch::new("seed");
//! batch.upsert(CollectionName::branches(), Document::from_serialize(DocKey::new("MAIN")?, &branch)?);
//! index.bulk_write(batch)?;
//!
//! let hits = index.search(&CollectionName::branches(), &Filter::prefix("path", "MAIN/"))?;
//! ```

mod commit;
mod document;
mod error;
mod filter;
mod git_index;
mod index;
mod memory;
mod refs;
mod tree;
mod types;

pub use document::Document;
pub use error::{StorageError, StorageResult};
pub use filter::Filter;
pub use git_index::GitIndex;
pub use index::{DocumentIndex, WriteBatch, WriteOp};
pub use memory::MemoryIndex;
pub use types::{CollectionName, CommitId, DocKey, GitSignature, InvalidNameError};
