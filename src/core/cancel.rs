//! Cooperative cancellation for in-flight computations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::error::CoreError;

/// Shared cancellation flag checked at computation boundaries.
///
/// A cancelled computation installs nothing into the registry; compute
/// functions that run long loops should call [`CancelToken::check`]
/// themselves.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), CoreError> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_visible_through_clones() {
        let token = CancelToken::new();
        let seen_by_worker = token.clone();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(seen_by_worker.is_cancelled());
        assert!(matches!(seen_by_worker.check(), Err(CoreError::Cancelled)));
    }
}
