//! Branch hierarchy: paths, branch records and the manager that creates and
//! retires them.
//!
//! ```text
//!   MAIN ──────●────────●──────────●────▶ head
//!               \ base            /
//!   MAIN/task1   ●───●───●───────        (own segment, forked at base)
//! ```

pub mod manager;
pub mod model;
pub mod path;

pub use manager::BranchManager;
pub use model::{Branch, BranchState};
pub use path::{BranchPath, MAIN};
