//! PeerKit Runtime
//!
//! The session engine on top of `peerkit-core`:
//! - `PeerKit`: the cloneable handle applications drive
//! - `DispatcherTask`: the single task that owns session state, handlers and
//!   resource bookkeeping
//! - `Transceiver`: advertise, browse or both for one service
//! - `OutboundTask`: per-peer ordered delivery of encoded envelopes
//!
//! Any `TransportProvider` can sit underneath; `peerkit-harness` provides an
//! in-memory one for tests.

pub mod advertiser;
pub mod browser;
pub mod builder;
pub mod dispatcher;
pub mod outbound;
pub mod resources;
pub mod session;
pub mod transceiver;

pub use advertiser::Advertiser;
pub use browser::{Browser, DiscoveredPeer};
pub use builder::{PeerKit, PeerKitBuilder};
pub use dispatcher::{
    DispatchOutcome, DispatcherTask, HandlerId, HandlerRegistry, LifecycleSlot, RuntimeStats,
    SessionSnapshot,
};
pub use outbound::{OutboundStats, OutboundTask};
pub use resources::{CompletionCallback, ResourceHandle, ResourceLedger};
pub use session::{ConnectedPeersReceiver, SessionManager};
pub use transceiver::{Role, Transceiver};

// Re-export core types for convenience
pub use peerkit_core::{
    AcceptAll, CompletionState, ConnectionState, DiscoveryInfo, DiscoveryPolicy,
    EncryptionPreference, EventEnvelope, EventPayload, InvitationPolicy, InviteAll, Payload,
    PeerId, PeerIdentity, PeerKitError, PeerKitResult, ResourceTransfer, ServiceId,
    SessionConfig, StateTransition, TransferFailure, TransportProvider,
};
