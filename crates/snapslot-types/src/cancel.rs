//! Cooperative cancellation for long-running polls.
//!
//! The merge poll in `process_update_state` can run for minutes; callers
//! hand it a [`CancelToken`] and trip it from another thread to make the
//! poll return after its current iteration. Cancellation is level-triggered
//! and one-way: once tripped, a token stays tripped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Clonable stop flag. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    tripped: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tripped.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        // Idempotent.
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
