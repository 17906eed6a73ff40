//! Commit coordination: per-branch write locks, change sets, pre-commit
//! hooks and the append-only commit log.

pub mod changeset;
pub mod coordinator;
pub mod hooks;
pub mod lock;
pub mod record;

pub use changeset::{ChangeSet, Mutation};
pub use coordinator::CommitCoordinator;
pub use hooks::{CommitHook, HookContext, HookVerdict, UniqueNaturalKeyHook};
pub use lock::{BranchLocks, BranchWriteGuard};
pub use record::{Commit, CommitQuery, MergeSource, ObjectChange};
