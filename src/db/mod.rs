//! High-level database API.
//!
//! [`Database`] wires the branch manager, revision store, commit
//! coordinator, compare engine and merge processor over one document index.

mod api;

pub use api::{Database, DatabaseError, DatabaseResult};
