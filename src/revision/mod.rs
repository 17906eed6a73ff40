//! Revisions: immutable per-object snapshots and their resolution against a
//! branch's ancestor chain.

pub mod chain;
pub mod store;
pub mod types;

pub use chain::{ChainLink, ReadChain};
pub use store::RevisionStore;
pub use types::{ChangeOp, ObjectId, ObjectState, Revision, RevisionRef};
