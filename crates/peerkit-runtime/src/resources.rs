//! Resource transfer coordination
//!
//! A resource send fans out into one independent transfer per target peer.
//! Each transfer runs on its own task, racing the transport against a
//! cancellation signal, and reports its outcome back to the dispatcher as a
//! command. The [`ResourceLedger`] lives on the dispatcher task: it owns
//! pending records, invokes the caller's completion callback and moves
//! finished records into a bounded history.
//!
//! Callers observe a transfer through its [`ResourceHandle`].

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use peerkit_core::{
    CompletionState, PeerIdentity, Progress, ResourceTransfer, TransferFailure, TransferId,
    TransportProvider,
};
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::dispatcher::{guarded, Command, CommandSender};

/// Callback invoked once per peer with the finished transfer record
pub type CompletionCallback = Box<dyn FnMut(&ResourceTransfer) + Send>;

// ----------------------------------------------------------------------------
// Cancellation
// ----------------------------------------------------------------------------

/// One-shot cancellation flag with an awaitable edge
#[derive(Debug, Default)]
pub(crate) struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            // a stored permit wakes a waiter that has not polled yet
            self.notify.notify_one();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

// ----------------------------------------------------------------------------
// Resource Handle
// ----------------------------------------------------------------------------

/// Caller-side view of one per-peer transfer
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    id: TransferId,
    name: String,
    peer: PeerIdentity,
    progress: Arc<Progress>,
    state: watch::Receiver<CompletionState>,
    cancel: Arc<CancelSignal>,
}

impl ResourceHandle {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Live progress in `0.0..=1.0`
    pub fn fraction(&self) -> f64 {
        self.progress.fraction()
    }

    /// Current completion state
    pub fn state(&self) -> CompletionState {
        self.state.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    /// Request cancellation; a transfer that already finished keeps its outcome
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal outcome.
    ///
    /// Resolves after the completion callback for this peer has run. If the
    /// runtime shuts down first the transfer reports `Failed(Cancelled)`.
    pub async fn wait(&self) -> CompletionState {
        let mut state = self.state.clone();
        let outcome = match state.wait_for(CompletionState::is_terminal).await {
            Ok(done) => (*done).clone(),
            Err(_) => CompletionState::Failed(TransferFailure::Cancelled),
        };
        outcome
    }
}

// ----------------------------------------------------------------------------
// Transfer Spawning
// ----------------------------------------------------------------------------

/// Pending transfer as handed to the ledger
pub struct TrackedTransfer {
    record: ResourceTransfer,
    state: watch::Sender<CompletionState>,
    cancel: Arc<CancelSignal>,
}

/// Everything needed to run one transfer task
pub(crate) struct TransferJob {
    id: TransferId,
    path: PathBuf,
    name: String,
    peer: PeerIdentity,
    progress: Arc<Progress>,
    cancel: Arc<CancelSignal>,
}

/// Build the ledger entry, the caller handle and the task input for one peer
pub(crate) fn prepare_transfer(
    path: PathBuf,
    name: &str,
    peer: PeerIdentity,
) -> (TrackedTransfer, ResourceHandle, TransferJob) {
    let record = ResourceTransfer::new(name, peer.clone(), path.clone());
    let (state_tx, state_rx) = watch::channel(CompletionState::Pending);
    let cancel = Arc::new(CancelSignal::default());

    let handle = ResourceHandle {
        id: record.id(),
        name: name.to_string(),
        peer: peer.clone(),
        progress: record.progress().clone(),
        state: state_rx,
        cancel: cancel.clone(),
    };
    let job = TransferJob {
        id: record.id(),
        path,
        name: name.to_string(),
        peer,
        progress: record.progress().clone(),
        cancel: cancel.clone(),
    };
    let tracked = TrackedTransfer {
        record,
        state: state_tx,
        cancel,
    };
    (tracked, handle, job)
}

/// Run one transfer to completion and report the outcome to the dispatcher
pub(crate) async fn run_transfer(
    transport: Arc<dyn TransportProvider>,
    job: TransferJob,
    commands: CommandSender,
) {
    let outcome = tokio::select! {
        result = transport.send_resource(&job.path, &job.name, &job.peer, job.progress.clone()) => {
            match result {
                Ok(()) => CompletionState::Succeeded,
                Err(e) => {
                    warn!("Resource '{}' to {} failed: {}", job.name, job.peer, e);
                    CompletionState::Failed(TransferFailure::Transport(e.to_string()))
                }
            }
        }
        _ = job.cancel.cancelled() => {
            debug!("Resource '{}' to {} cancelled", job.name, job.peer);
            CompletionState::Failed(TransferFailure::Cancelled)
        }
    };

    if commands
        .send(Command::ResourceCompleted {
            id: job.id,
            state: outcome,
        })
        .is_err()
    {
        debug!("Dispatcher gone before resource '{}' completed", job.name);
    }
}

// ----------------------------------------------------------------------------
// Resource Ledger
// ----------------------------------------------------------------------------

struct PendingTransfer {
    tracked: TrackedTransfer,
    batch: u64,
}

struct CompletionBatch {
    on_complete: CompletionCallback,
    remaining: usize,
}

/// Dispatcher-owned bookkeeping for every transfer
pub struct ResourceLedger {
    pending: HashMap<TransferId, PendingTransfer>,
    batches: HashMap<u64, CompletionBatch>,
    next_batch: u64,
    history: VecDeque<ResourceTransfer>,
    history_limit: usize,
    succeeded: u64,
    failed: u64,
}

impl ResourceLedger {
    pub fn new(history_limit: usize) -> Self {
        Self {
            pending: HashMap::new(),
            batches: HashMap::new(),
            next_batch: 0,
            history: VecDeque::new(),
            history_limit,
            succeeded: 0,
            failed: 0,
        }
    }

    /// Take ownership of a batch of transfers sharing one callback
    pub(crate) fn track(&mut self, transfers: Vec<TrackedTransfer>, on_complete: CompletionCallback) {
        if transfers.is_empty() {
            return;
        }
        let batch = self.next_batch;
        self.next_batch += 1;
        self.batches.insert(
            batch,
            CompletionBatch {
                on_complete,
                remaining: transfers.len(),
            },
        );
        for tracked in transfers {
            debug!(
                "Tracking resource '{}' to {}",
                tracked.record.name(),
                tracked.record.peer()
            );
            self.pending
                .insert(tracked.record.id(), PendingTransfer { tracked, batch });
        }
    }

    /// Seal a transfer with its outcome, invoke its callback and archive it.
    ///
    /// Unknown ids (already finished) are ignored.
    pub fn complete(&mut self, id: TransferId, outcome: CompletionState) -> Option<&ResourceTransfer> {
        let PendingTransfer { tracked, batch } = self.pending.remove(&id)?;
        let record = tracked.record.finish(outcome);
        if record.state().is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }

        if let Some(entry) = self.batches.get_mut(&batch) {
            guarded("resource completion", || (entry.on_complete)(&record));
            entry.remaining -= 1;
            if entry.remaining == 0 {
                self.batches.remove(&batch);
            }
        }
        tracked.state.send_replace(record.state().clone());

        self.history.push_back(record);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        self.history.back()
    }

    /// Signal every in-flight transfer to stop; outcomes arrive as completions
    pub fn cancel_all(&self) {
        for pending in self.pending.values() {
            pending.tracked.cancel.cancel();
        }
        if !self.pending.is_empty() {
            debug!("Cancelling {} in-flight transfers", self.pending.len());
        }
    }

    /// Finish every pending transfer as cancelled without waiting for tasks
    pub fn abort_all(&mut self) {
        self.cancel_all();
        let ids: Vec<TransferId> = self.pending.keys().copied().collect();
        for id in ids {
            self.complete(id, CompletionState::Failed(TransferFailure::Cancelled));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Finished transfers, oldest first
    pub fn history(&self) -> &VecDeque<ResourceTransfer> {
        &self.history
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }
}
