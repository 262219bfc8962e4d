//! Operation context threaded through storage calls.
//!
//! A cancellation signal delivered through the paired [`CancelHandle`]
//! makes every subsequent storage call fail, which aborts the surrounding
//! transaction; rollback-on-drop guarantees no partial state becomes
//! visible.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// The operation was cancelled by its caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Context for one logical operation against the log.
///
/// Cheap to clone; clones observe the same cancellation signal.
#[derive(Debug, Clone)]
pub struct OpContext {
    cancelled: Arc<AtomicBool>,
}

impl OpContext {
    /// A context that is never cancelled.
    #[must_use]
    pub fn background() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A context with a handle that can cancel it.
    #[must_use]
    pub fn cancellable() -> (Self, CancelHandle) {
        let cancelled = Arc::new(AtomicBool::new(false));
        (
            Self {
                cancelled: Arc::clone(&cancelled),
            },
            CancelHandle { cancelled },
        )
    }

    /// Whether the operation has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fails once the operation has been cancelled.
    ///
    /// Storage backends call this at the top of every operation so a
    /// cancellation aborts the transaction at the next suspension point.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] after the paired handle fired.
    pub fn ensure_active(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

/// Cancels the [`OpContext`] it was created with.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Delivers the cancellation signal. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_context_stays_active() {
        let ctx = OpContext::background();
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.ensure_active(), Ok(()));
    }

    #[test]
    fn cancel_reaches_all_clones() {
        let (ctx, handle) = OpContext::cancellable();
        let clone = ctx.clone();
        handle.cancel();
        assert_eq!(ctx.ensure_active(), Err(Cancelled));
        assert_eq!(clone.ensure_active(), Err(Cancelled));
    }
}
