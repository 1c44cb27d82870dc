//! Readiness gate
//!
//! A settle-once broadcast cell: it starts `Pending` and moves to exactly one
//! of `Ready` or `Failed`, after which it never changes. Any number of waiters,
//! registered before or after settlement, observe the same terminal state.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{ConduitError, Result};

/// Settlement state of a [`ReadinessGate`]
#[derive(Debug, Clone)]
pub enum GateState {
    Pending,
    Ready,
    Failed(ConduitError),
}

impl GateState {
    pub fn is_pending(&self) -> bool {
        matches!(self, GateState::Pending)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, GateState::Ready)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, GateState::Failed(_))
    }
}

/// Single-settlement synchronization primitive.
///
/// Cloning is cheap; all clones share one state.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    tx: Arc<watch::Sender<GateState>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    /// Create a gate in the `Pending` state
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::Pending);
        Self { tx: Arc::new(tx) }
    }

    /// Wait until the gate settles.
    ///
    /// Returns immediately when already settled.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|s| !s.is_pending())
            .await
            .map(|s| s.clone())
            .map_err(|_| ConduitError::InvalidState("readiness gate dropped".to_string()))?;

        match state {
            GateState::Ready => Ok(()),
            GateState::Failed(err) => Err(err),
            GateState::Pending => Err(ConduitError::InvalidState("readiness gate still pending".to_string())),
        }
    }

    /// Transition `Pending -> Ready`.
    ///
    /// Returns `true` only for the call that settled the gate.
    pub fn mark_ready(&self) -> bool {
        self.settle(GateState::Ready)
    }

    /// Transition `Pending -> Failed(err)`.
    ///
    /// Returns `true` only for the call that settled the gate.
    pub fn mark_failed(&self, err: ConduitError) -> bool {
        self.settle(GateState::Failed(err))
    }

    /// Snapshot of the current state
    pub fn state(&self) -> GateState {
        self.tx.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        !self.tx.borrow().is_pending()
    }

    fn settle(&self, next: GateState) -> bool {
        let settled = self.tx.send_if_modified(|current| {
            if current.is_pending() {
                *current = next;
                true
            } else {
                false
            }
        });
        if !settled {
            log::debug!("readiness gate already settled, ignoring");
        }
        settled
    }
}
