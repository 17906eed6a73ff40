//! Per-branch exclusive write locks.
//!
//! Writers targeting the same branch path are serialized; writers on
//! different paths never wait for each other. A merge locks both of its
//! branches in one step, so two merges crossing the same pair of branches in
//! opposite directions cannot deadlock.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::branch::BranchPath;
use crate::error::{StoreError, StoreResult};

/// Table of branch paths currently held by a writer.
#[derive(Debug)]
pub struct BranchLocks {
    held: Mutex<HashSet<BranchPath>>,
    released: Condvar,
    timeout: Duration,
}

impl BranchLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire the write lock for one branch.
    pub fn lock(&self, path: &BranchPath) -> StoreResult<BranchWriteGuard<'_>> {
        self.lock_all(std::slice::from_ref(path))
    }

    /// Acquire the write locks for several branches at once.
    ///
    /// Paths are taken together in lexical order; nothing is held while
    /// waiting, and the call fails with [`StoreError::LockTimeout`] once the
    /// configured bound elapses.
    pub fn lock_all(&self, paths: &[BranchPath]) -> StoreResult<BranchWriteGuard<'_>> {
        let mut paths = paths.to_vec();
        paths.sort();
        paths.dedup();

        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut held = self.held.lock();
        while paths.iter().any(|p| held.contains(p)) {
            if self.released.wait_until(&mut held, deadline).timed_out()
                && paths.iter().any(|p| held.contains(p))
            {
                let names: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
                warn!(branches = ?names, waited_ms = started.elapsed().as_millis() as u64, "write lock timeout");
                return Err(StoreError::LockTimeout {
                    paths: names,
                    waited: started.elapsed(),
                });
            }
        }

        for path in &paths {
            held.insert(path.clone());
        }
        debug!(branches = ?paths, "write lock acquired");

        Ok(BranchWriteGuard { locks: self, paths })
    }

    /// True if a writer currently holds `path`.
    pub fn is_locked(&self, path: &BranchPath) -> bool {
        self.held.lock().contains(path)
    }
}

/// Held write locks, released on drop.
#[derive(Debug)]
pub struct BranchWriteGuard<'a> {
    locks: &'a BranchLocks,
    paths: Vec<BranchPath>,
}

impl BranchWriteGuard<'_> {
    pub fn paths(&self) -> &[BranchPath] {
        &self.paths
    }

    pub fn covers(&self, path: &BranchPath) -> bool {
        self.paths.contains(path)
    }
}

impl Drop for BranchWriteGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock();
        for path in &self.paths {
            held.remove(path);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
