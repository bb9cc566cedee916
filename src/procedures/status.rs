//! Procedure lifecycle status.
//!
//! # State Machine
//!
//! ```text
//! Queued ──start──> Running ──execute returns──> Finished
//!                     │
//!                     ├──hook error / panic──> Failed
//!                     │
//!                     └──stop requested──────> Aborted
//! ```
//!
//! Terminal states are never left within one run. A freshly constructed
//! procedure instance starts in `Queued` again.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of one procedure run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Constructed, not started
    Queued,
    /// Worker thread is executing the hooks
    Running,
    /// `execute()` returned normally and no stop was requested
    Finished,
    /// A hook raised an error or panicked
    Failed,
    /// A stop was requested
    Aborted,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Queued => write!(f, "Queued"),
            Status::Running => write!(f, "Running"),
            Status::Finished => write!(f, "Finished"),
            Status::Failed => write!(f, "Failed"),
            Status::Aborted => write!(f, "Aborted"),
        }
    }
}

impl Status {
    /// Finished, Failed or Aborted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Finished | Status::Failed | Status::Aborted)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: Status) -> bool {
        match self {
            Status::Queued => next == Status::Running,
            Status::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Shared, observable status of one procedure instance.
///
/// Cloning yields another handle onto the same status. Observers subscribe to a
/// `tokio::sync::watch` channel and see every change.
#[derive(Debug, Clone)]
pub struct StatusCell {
    tx: Arc<watch::Sender<Status>>,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Status::Queued);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Status {
        *self.tx.borrow()
    }

    /// Receiver that observes every subsequent transition.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }

    /// Moves to `next` if the transition is legal. Returns whether it happened.
    pub fn transition(&self, next: Status) -> bool {
        let mut changed = false;
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(from = %current, to = %next, "Procedure status changed");
                *current = next;
                changed = true;
            }
            changed
        });
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(Status::Queued.can_transition_to(Status::Running));
        assert!(!Status::Queued.can_transition_to(Status::Finished));
        assert!(Status::Running.can_transition_to(Status::Aborted));
        assert!(!Status::Finished.can_transition_to(Status::Running));
        assert!(!Status::Failed.can_transition_to(Status::Finished));
    }

    #[test]
    fn terminal_states_are_sticky() {
        let status = StatusCell::new();
        assert_eq!(status.get(), Status::Queued);
        assert!(status.transition(Status::Running));
        assert!(status.transition(Status::Failed));
        assert!(!status.transition(Status::Finished));
        assert_eq!(status.get(), Status::Failed);
    }

    #[tokio::test]
    async fn subscribers_observe_changes() {
        let status = StatusCell::new();
        let mut rx = status.subscribe();
        status.transition(Status::Running);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Status::Running);
    }
}
