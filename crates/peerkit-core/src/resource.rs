//! Resource transfer records
//!
//! Bulk data is sent to each target peer as an independent transfer. A
//! [`ResourceTransfer`] tracks one such transfer; it is owned by the
//! coordinator while pending and becomes an immutable record once
//! [`ResourceTransfer::finish`] has been applied.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::types::PeerIdentity;

// ----------------------------------------------------------------------------
// Transfer Identifier
// ----------------------------------------------------------------------------

/// Unique identifier for a single per-peer transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Generate a new random transfer ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Progress
// ----------------------------------------------------------------------------

/// Live progress counter shared between the transport and the caller
#[derive(Debug, Default)]
pub struct Progress {
    completed: AtomicU64,
    total: AtomicU64,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total number of units (usually bytes) to transfer
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Release);
    }

    /// Record `units` more units as transferred
    pub fn advance(&self, units: u64) {
        self.completed.fetch_add(units, Ordering::AcqRel);
    }

    pub fn set_completed(&self, completed: u64) {
        self.completed.store(completed, Ordering::Release);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Fraction complete in `0.0..=1.0`; zero while the total is unknown
    pub fn fraction(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.completed() as f64 / total as f64).min(1.0)
    }
}

// ----------------------------------------------------------------------------
// Completion State
// ----------------------------------------------------------------------------

/// Why a transfer did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TransferFailure {
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Terminal (or pending) outcome of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionState {
    Pending,
    Succeeded,
    Failed(TransferFailure),
}

impl CompletionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CompletionState::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CompletionState::Succeeded)
    }
}

// ----------------------------------------------------------------------------
// Resource Transfer Record
// ----------------------------------------------------------------------------

/// One resource being sent to one peer
#[derive(Debug, Clone)]
pub struct ResourceTransfer {
    id: TransferId,
    name: String,
    peer: PeerIdentity,
    local_path: PathBuf,
    progress: Arc<Progress>,
    state: CompletionState,
}

impl ResourceTransfer {
    /// Create a pending transfer
    pub fn new<N: Into<String>, P: Into<PathBuf>>(name: N, peer: PeerIdentity, local_path: P) -> Self {
        Self {
            id: TransferId::generate(),
            name: name.into(),
            peer,
            local_path: local_path.into(),
            progress: Arc::new(Progress::new()),
            state: CompletionState::Pending,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn progress(&self) -> &Arc<Progress> {
        &self.progress
    }

    pub fn state(&self) -> &CompletionState {
        &self.state
    }

    /// Seal the record with its outcome.
    ///
    /// A record that already carries a terminal outcome keeps it; the first
    /// reported outcome wins.
    pub fn finish(mut self, outcome: CompletionState) -> Self {
        if !self.state.is_terminal() {
            self.state = outcome;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        let progress = Progress::new();
        assert_eq!(progress.fraction(), 0.0);
        progress.set_total(200);
        progress.advance(50);
        assert_eq!(progress.fraction(), 0.25);
        progress.set_completed(400);
        assert_eq!(progress.fraction(), 1.0);
    }

    #[test]
    fn test_first_outcome_wins() {
        let transfer = ResourceTransfer::new("f.bin", PeerIdentity::new("b"), "/tmp/f.bin");
        assert_eq!(transfer.state(), &CompletionState::Pending);

        let done = transfer
            .finish(CompletionState::Failed(TransferFailure::Cancelled))
            .finish(CompletionState::Succeeded);
        assert_eq!(
            done.state(),
            &CompletionState::Failed(TransferFailure::Cancelled)
        );
        assert_eq!(done.name(), "f.bin");
        assert_eq!(done.local_path(), Path::new("/tmp/f.bin"));
    }
}
