//! Event Dispatcher
//!
//! The dispatcher is the single consumer of the runtime. Public operations
//! arrive as [`Command`]s, transport callbacks as `TransportEvent`s, and the
//! [`DispatcherTask`] handles both on one task. Handler registration,
//! lifecycle callbacks, envelope dispatch and resource completion are
//! therefore serialised with each other.

mod registry;
mod task;

pub(crate) use registry::guarded;
pub use registry::{DispatchOutcome, HandlerRegistry};
pub use task::{DispatcherTask, RuntimeStats, SessionSnapshot};

use std::path::Path;

use peerkit_core::{DiscoveryInfo, EventEnvelope, Payload, PeerIdentity, PeerKitResult, ServiceId};
use peerkit_core::{CompletionState, TransferId};
use tokio::sync::{mpsc, oneshot};

use crate::resources::{CompletionCallback, TrackedTransfer};
use crate::transceiver::Role;

// ----------------------------------------------------------------------------
// Handler Types
// ----------------------------------------------------------------------------

/// Identifier returned when registering a named handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u64);

/// Lifecycle callback: `(local peer, remote peer)`
pub type PeerCallback = Box<dyn FnMut(&PeerIdentity, &PeerIdentity) + Send>;
/// Invoked for every decoded envelope: `(sender, event name, payload)`
pub type GeneralHandler = Box<dyn FnMut(&PeerIdentity, &str, Option<&Payload>) + Send>;
/// Named event handler: `(sender, payload)`
pub type EventHandler = Box<dyn FnMut(&PeerIdentity, Option<&Payload>) + Send>;
/// Incoming resource: `(local peer, resource name, sender, location)`
pub type ResourceFinishedCallback = Box<dyn FnMut(&PeerIdentity, &str, &PeerIdentity, &Path) + Send>;
/// Envelope with no named handler: `(sender, envelope)`
pub type UnhandledCallback = Box<dyn FnMut(&PeerIdentity, &EventEnvelope) + Send>;

/// Single-slot callbacks of the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleSlot {
    Connecting,
    Connected,
    Disconnected,
    ResourceFinished,
    General,
    Unhandled,
}

/// A callback destined for one of the [`LifecycleSlot`]s
pub enum LifecycleCallback {
    Connecting(PeerCallback),
    Connected(PeerCallback),
    Disconnected(PeerCallback),
    ResourceFinished(ResourceFinishedCallback),
    General(GeneralHandler),
    Unhandled(UnhandledCallback),
}

impl LifecycleCallback {
    pub fn slot(&self) -> LifecycleSlot {
        match self {
            LifecycleCallback::Connecting(_) => LifecycleSlot::Connecting,
            LifecycleCallback::Connected(_) => LifecycleSlot::Connected,
            LifecycleCallback::Disconnected(_) => LifecycleSlot::Disconnected,
            LifecycleCallback::ResourceFinished(_) => LifecycleSlot::ResourceFinished,
            LifecycleCallback::General(_) => LifecycleSlot::General,
            LifecycleCallback::Unhandled(_) => LifecycleSlot::Unhandled,
        }
    }
}

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Requests handled by the dispatcher task
pub enum Command {
    Start {
        role: Role,
        service: ServiceId,
        info: Option<DiscoveryInfo>,
        reply: oneshot::Sender<PeerKitResult<()>>,
    },
    Stop,
    Shutdown,
    SetLifecycle(LifecycleCallback),
    ClearLifecycle(LifecycleSlot),
    Register {
        id: HandlerId,
        event: String,
        handler: EventHandler,
    },
    Unregister(HandlerId),
    UnregisterEvent(String),
    TrackResources {
        transfers: Vec<TrackedTransfer>,
        on_complete: CompletionCallback,
    },
    ResourceCompleted {
        id: TransferId,
        state: CompletionState,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

impl Command {
    /// Short command name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Start { .. } => "start",
            Command::Stop => "stop",
            Command::Shutdown => "shutdown",
            Command::SetLifecycle(_) => "set_lifecycle",
            Command::ClearLifecycle(_) => "clear_lifecycle",
            Command::Register { .. } => "register",
            Command::Unregister(_) => "unregister",
            Command::UnregisterEvent(_) => "unregister_event",
            Command::TrackResources { .. } => "track_resources",
            Command::ResourceCompleted { .. } => "resource_completed",
            Command::Snapshot(_) => "snapshot",
        }
    }
}

pub type CommandSender = mpsc::UnboundedSender<Command>;
pub type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Create the command channel feeding the dispatcher
pub fn create_command_channel() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}
