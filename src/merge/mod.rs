//! Merge conflict processing.
//!
//! ```text
//!   MergeRequest ──▶ MergeProcessor ──▶ per-side changes (CompareEngine::diverge)
//!                                          │
//!                         conflict rules ◀─┘ (DuplicateIdentity, AddedVsDetached,
//!                                          │   AttributeConflict)
//!                      invariant checks ◀──┘ (references, preferred flag, acyclic
//!                                          │   hierarchy)
//!                     CommitCoordinator ◀──┘ one commit on the target
//! ```

pub mod conflict;
mod invariants;
pub mod processor;
pub mod rules;

pub use conflict::{Conflict, ConflictKind, ConflictReport};
pub use processor::{MergeOutcome, MergeProcessor, MergeRequest, MergeResult, MergeStatus};
pub use rules::{HierarchyRule, MergeRules, NaturalKey, PreferredRule, ReferenceRule};
