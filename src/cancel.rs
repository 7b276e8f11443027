//! Resolution cancellation (spec.md §5: "the resolver polls a cancellation
//! handle between waves so a caller can abort a long-running resolution").
//!
//! Mirrors the donor's `resource.rs` `ResourceTracker` pattern: a trait
//! carried as a generic type parameter so the zero-cost default
//! (`NeverCancel`) monomorphizes away, with a concrete atomic-flag
//! implementation for real callers.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Why resolution was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelCause(pub String);

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resolution cancelled: {}", self.0)
    }
}

impl std::error::Error for CancelCause {}

/// Trait for polling cancellation during resolution.
///
/// Checked at wave boundaries and before entering a for-loop's next
/// iteration (spec.md §5), not per-expression — cancellation is coarse by
/// design, matching the donor's `check_time` being called "periodically (at
/// statement boundaries)" rather than per-opcode.
pub trait CancellationHandle: fmt::Debug {
    fn check(&self) -> Result<(), CancelCause>;
}

/// Zero-cost default: resolution never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

impl CancellationHandle for NeverCancel {
    #[inline(always)]
    fn check(&self) -> Result<(), CancelCause> {
        Ok(())
    }
}

/// An atomic-bool-backed handle. Cloning shares the same underlying flag, so
/// a caller can hold one clone and flip it from another thread while the
/// resolver holds another.
#[derive(Debug, Clone, Default)]
pub struct FlagCancellation {
    flag: Arc<AtomicBool>,
}

impl FlagCancellation {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl CancellationHandle for FlagCancellation {
    fn check(&self) -> Result<(), CancelCause> {
        if self.is_cancelled() {
            Err(CancelCause("cancellation flag was set".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_cancel_always_ok() {
        assert!(NeverCancel.check().is_ok());
    }

    #[test]
    fn flag_cancellation_starts_uncancelled() {
        let handle = FlagCancellation::new();
        assert!(handle.check().is_ok());
    }

    #[test]
    fn flag_cancellation_trips_after_cancel() {
        let handle = FlagCancellation::new();
        handle.cancel();
        assert!(handle.check().is_err());
    }

    #[test]
    fn clones_share_the_same_flag() {
        let handle = FlagCancellation::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.check().is_err());
    }
}
