use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};

/// Cooperative cancellation for long-running merges.
///
/// Clones share the same flag, so a caller can keep one half and hand the
/// other to the merge processor.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with [`StoreError::Cancelled`] once cancellation was requested.
    pub fn check(&self, operation: &str) -> StoreResult<()> {
        if self.is_cancelled() {
            return Err(StoreError::Cancelled(operation.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = Cancellation::new();
        let handle = token.clone();
        assert!(token.check("merge").is_ok());

        handle.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check("merge MAIN/a"), Err(StoreError::Cancelled(op)) if op == "merge MAIN/a"));
    }
}
