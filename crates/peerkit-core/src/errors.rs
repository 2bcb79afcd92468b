//! Error types for the PeerKit session layer
//!
//! This module contains all error types used throughout the core crate,
//! including transport errors, envelope codec errors, connection state
//! transition errors, and the main PeerKitError type that unifies them all.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Specific transport error types
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Peer not connected: {peer_id}")]
    PeerNotConnected { peer_id: String },
    #[error("Peer not found: {peer_id}")]
    PeerNotFound { peer_id: String },
    #[error("Send failed to peer {peer_id}: {reason}")]
    SendFailed { peer_id: String, reason: String },
    #[error("Resource transfer to peer {peer_id} failed: {reason}")]
    ResourceFailed { peer_id: String, reason: String },
    #[error("Transport is not available: {reason}")]
    Unavailable { reason: String },
    #[error("Transport events already attached")]
    AlreadyAttached,
    #[error("Transport shutdown: {reason}")]
    Shutdown { reason: String },
    #[error("Network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
}

/// Envelope encoding/decoding error types
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Envelope is empty")]
    Empty,
    #[error("Unsupported envelope version: expected {expected}, got {actual}")]
    UnsupportedVersion { expected: u8, actual: u8 },
    #[error("Envelope too large (max {max}, got {actual})")]
    TooLarge { max: usize, actual: usize },
    #[error("Event name must not be empty")]
    EmptyEventName,
    #[error("Payload nested too deep (max {max}, got {actual})")]
    TooDeep { max: usize, actual: usize },
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("Payload schema mismatch: expected {expected}, got {actual}")]
    SchemaMismatch { expected: String, actual: String },
}

/// Service identifier and discovery metadata validation errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Invalid service id '{service}': {reason}")]
    InvalidServiceId { service: String, reason: &'static str },
    #[error("Discovery info entry '{key}' is {size} bytes (max {max})")]
    DiscoveryInfoTooLarge { key: String, size: usize, max: usize },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Core error types for the PeerKit session layer
#[derive(Debug, thiserror::Error)]
pub enum PeerKitError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] crate::connection_state::StateTransitionError),

    /// Channel communication error (dispatcher task gone)
    #[error("Channel error: {message}")]
    Channel { message: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl PeerKitError {
    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        PeerKitError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        PeerKitError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a peer-not-connected transport error
    pub fn peer_not_connected<P: Into<String>>(peer_id: P) -> Self {
        PeerKitError::Transport(TransportError::PeerNotConnected {
            peer_id: peer_id.into(),
        })
    }

    /// Create a send failure transport error
    pub fn send_failed<P: Into<String>, R: Into<String>>(peer_id: P, reason: R) -> Self {
        PeerKitError::Transport(TransportError::SendFailed {
            peer_id: peer_id.into(),
            reason: reason.into(),
        })
    }

    /// Create a resource failure transport error
    pub fn resource_failed<P: Into<String>, R: Into<String>>(peer_id: P, reason: R) -> Self {
        PeerKitError::Transport(TransportError::ResourceFailed {
            peer_id: peer_id.into(),
            reason: reason.into(),
        })
    }

    /// Whether this error originates from the envelope codec
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, PeerKitError::Envelope(_))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, PeerKitError>;
pub type PeerKitResult<T> = Result<T>;
