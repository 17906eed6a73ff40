//! revdb - a revision-indexed branching document store
//!
//! Objects are kept as immutable revisions on a tree of branches rooted at
//! `MAIN`. A child branch sees its parent's state as of its base timestamp
//! plus its own commits; branches can be compared and merged, and merges
//! report semantic conflicts instead of applying them.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//!
//! use revdb::{BranchPath, Cancellation, ChangeSet, CompareRequest, Database, ObjectId, ObjectState, StoreConfig};
//!
//! let db = Database::open(StoreConfig::git(".revdb")).unwrap();
//! let task = db.create_branch(&BranchPath::main(), "task1", BTreeMap::new()).unwrap();
//! let concept = ObjectId::new("concept", "100").unwrap();
//! db.commit(&task.path, "alice", "add concept", ChangeSet::new().create(concept, ObjectState::default()))
//!     .unwrap();
//!
//! let diff = db.compare_request(&CompareRequest::new("MAIN/task1").against("MAIN")).unwrap();
//! assert_eq!(diff.total_added, 1);
//! ```

pub mod branch;
pub mod cancel;
pub mod clock;
pub mod commit;
pub mod compare;
pub mod config;
pub mod db;
pub mod error;
pub mod merge;
pub mod retry;
pub mod revision;
pub mod storage;

pub use branch::{Branch, BranchPath, BranchState};
pub use cancel::Cancellation;
pub use commit::{ChangeSet, Commit, CommitQuery};
pub use compare::{CompareOptions, CompareRequest, RevisionCompare};
pub use config::{ConfigError, StoreConfig};
pub use db::{Database, DatabaseError};
pub use error::{StoreError, StoreResult};
pub use merge::{MergeOutcome, MergeRequest, MergeRules, MergeStatus};
pub use revision::{ObjectId, ObjectState, Revision};
