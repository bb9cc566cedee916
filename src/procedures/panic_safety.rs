//! Cancellation and panic safety for procedure runs.
//!
//! A procedure that is interrupted must still leave its instruments in a safe,
//! de-energized state. This module provides the two primitives the worker relies on:
//!
//! - [`StopFlag`]: the cooperative "stop requested" flag shared between the controlling
//!   thread and the worker thread. It is set at most once per run and never reset.
//! - [`PanicGuard`]: an RAII guard that runs synchronous cleanup on drop, including
//!   while unwinding, so the end-of-run signals are sent no matter how the worker
//!   thread exits.
//!
//! # Example
//!
//! ```rust
//! use rust_measure::procedures::panic_safety::StopFlag;
//!
//! let flag = StopFlag::new();
//! let seen_by_worker = flag.clone();
//!
//! flag.request("operator pressed abort");
//! assert!(seen_by_worker.is_requested());
//! assert_eq!(flag.reason().as_deref(), Some("operator pressed abort"));
//! ```

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{error, warn};

// =============================================================================
// Panic Guard (Synchronous)
// =============================================================================

/// A synchronous RAII guard that executes cleanup when dropped.
///
/// # Limitations
///
/// - Must not block for long in the cleanup function
/// - Must not panic in the cleanup function (a panic there is caught and logged)
pub struct PanicGuard {
    cleanup: Option<Box<dyn FnOnce() + Send + 'static>>,
    name: String,
}

impl PanicGuard {
    /// Create a new panic guard with a cleanup function.
    pub fn new<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::named("unnamed", cleanup)
    }

    /// Create a named panic guard (for logging).
    pub fn named<F>(name: impl Into<String>, cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cleanup: Some(Box::new(cleanup)),
            name: name.into(),
        }
    }

    /// Dismiss the guard without running cleanup.
    pub fn dismiss(mut self) {
        self.cleanup = None;
    }

    /// Check if the guard is still armed.
    pub fn is_armed(&self) -> bool {
        self.cleanup.is_some()
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            if std::thread::panicking() {
                warn!(guard = %self.name, "Guard triggered during panic, executing cleanup");
            }

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(cleanup));
            if let Err(payload) = result {
                error!(guard = %self.name, panic = %panic_message(payload.as_ref()), "Cleanup panicked");
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// =============================================================================
// Stop Flag
// =============================================================================

/// Monotonic, lock-free "stop requested" flag.
///
/// Readers never block. The first request wins and records its reason; later
/// requests are ignored.
#[derive(Clone, Debug, Default)]
pub struct StopFlag {
    flag: Arc<AtomicBool>,
    reason: Arc<RwLock<Option<String>>>,
}

impl StopFlag {
    /// Create a new, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Returns `true` if this call set the flag.
    pub fn request(&self, reason: impl Into<String>) -> bool {
        let first = !self.flag.swap(true, Ordering::SeqCst);
        if first {
            let mut slot = self.reason.write().unwrap_or_else(|e| e.into_inner());
            *slot = Some(reason.into());
        }
        first
    }

    /// Check whether a stop was requested.
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Reason given with the first request.
    pub fn reason(&self) -> Option<String> {
        self.reason
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Create a panic guard that requests a stop on drop.
    pub fn guard(&self, context: impl Into<String>) -> PanicGuard {
        let flag = self.clone();
        let ctx = context.into();
        PanicGuard::named(ctx.clone(), move || {
            flag.request(format!("Panic in: {ctx}"));
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_panic_guard_runs_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        {
            let _guard = PanicGuard::new(move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_guard_dismiss() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let guard = PanicGuard::new(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(guard.is_armed());
        guard.dismiss();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panic_guard_on_panic() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = PanicGuard::new(move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            });
            panic!("Test panic");
        }));

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_flag_is_monotonic() {
        let flag = StopFlag::new();
        assert!(!flag.is_requested());
        assert_eq!(flag.reason(), None);

        assert!(flag.request("first"));
        assert!(!flag.request("second"));

        assert!(flag.is_requested());
        assert_eq!(flag.reason(), Some("first".to_string()));
    }

    #[test]
    fn test_stop_flag_guard_requests_on_panic() {
        let flag = StopFlag::new();
        let guarded = flag.clone();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = guarded.guard("execute");
            panic!("boom");
        }));
        assert!(flag.is_requested());
        assert_eq!(flag.reason(), Some("Panic in: execute".to_string()));
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let payload = std::panic::catch_unwind(|| panic!("bad value {}", 3)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "bad value 3");
    }
}
