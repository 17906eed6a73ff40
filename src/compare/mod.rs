//! Compare/diff engine: classifies differences between branch states as
//! additions, changes and removals.

pub mod engine;
pub mod result;

pub use engine::CompareEngine;
pub use result::{CompareOptions, CompareRequest, RevisionCompare, RevisionCompareDetail};
