//! PeerKit Core
//!
//! Foundational types for the PeerKit session layer: peer identities, the
//! per-peer connection state machine, the event envelope wire format, session
//! configuration, resource transfer records and the transport abstraction
//! the runtime drives.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod connection_state;
pub mod envelope;
pub mod errors;
pub mod policy;
pub mod resource;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{EncryptionPreference, SessionConfig};
pub use connection_state::{
    ConnectionEvent, ConnectionState, StateTransition, StateTransitionError,
};
pub use envelope::{
    EventEnvelope, EventPayload, Payload, DEFAULT_MAX_ENVELOPE_SIZE, MAX_PAYLOAD_DEPTH,
    PROTOCOL_VERSION,
};
pub use errors::{
    EnvelopeError, PeerKitError, PeerKitResult, Result, ServiceError, TransportError,
};
pub use policy::{AcceptAll, DiscoveryPolicy, InvitationPolicy, InviteAll};
pub use resource::{CompletionState, Progress, ResourceTransfer, TransferFailure, TransferId};
pub use transport::{
    create_transport_event_channel, DiscoveryRole, SendMode, TransportEvent,
    TransportEventReceiver, TransportEventSender, TransportProvider,
};
pub use types::{DiscoveryInfo, PeerId, PeerIdentity, ServiceId};
