//! Connection State Machine
//!
//! Per-peer connection lifecycle. States only move forward along
//! `Discovering → Connecting → Connected → Disconnected`; after
//! `Disconnected` a peer may start a new cycle at `Discovering` (found again
//! by the browser) or at `Connecting` (invited again).

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Connection State Types
// ----------------------------------------------------------------------------

/// Connection state of a single peer within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Peer has been seen advertising but no connection is in progress
    Discovering,
    /// Link establishment is in progress
    Connecting,
    /// Peer is part of the session and can exchange data
    Connected,
    /// Peer left the session, or never made it in
    Disconnected,
}

/// Lifecycle signals that drive state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Browser found the peer advertising our service
    Found,
    /// Transport reported the link is being established
    Connecting,
    /// Transport reported the link is up
    Connected,
    /// Transport reported the link is gone (or never came up)
    Disconnected,
}

// ----------------------------------------------------------------------------
// State Transition Results
// ----------------------------------------------------------------------------

/// Result of applying an event to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub peer_id: PeerId,
    /// State before the event, `None` if the peer was unknown
    pub from: Option<ConnectionState>,
    pub to: ConnectionState,
    pub event: ConnectionEvent,
}

impl StateTransition {
    /// Whether the event actually moved the peer to a new state
    pub fn is_change(&self) -> bool {
        self.from != Some(self.to)
    }
}

/// Errors that can occur during state transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid transition for peer {peer_id} from {from} on {event:?}")]
    InvalidTransition {
        peer_id: String,
        from: String,
        event: ConnectionEvent,
    },
}

// ----------------------------------------------------------------------------
// State Machine Implementation
// ----------------------------------------------------------------------------

impl ConnectionState {
    /// Get current state name for logging
    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionState::Discovering => "Discovering",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Disconnected",
        }
    }

    /// Whether the peer can currently receive data
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether a connection attempt is underway or established
    pub fn is_engaged(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    /// State entered by a peer the session has never seen before
    pub fn initial(
        peer_id: PeerId,
        event: ConnectionEvent,
    ) -> Result<StateTransition, StateTransitionError> {
        let to = match event {
            ConnectionEvent::Found => ConnectionState::Discovering,
            ConnectionEvent::Connecting => ConnectionState::Connecting,
            ConnectionEvent::Disconnected => ConnectionState::Disconnected,
            ConnectionEvent::Connected => {
                return Err(StateTransitionError::InvalidTransition {
                    peer_id: peer_id.to_string(),
                    from: "Unknown".to_string(),
                    event,
                })
            }
        };

        Ok(StateTransition {
            peer_id,
            from: None,
            to,
            event,
        })
    }

    /// Apply an event to the current state
    ///
    /// Repeated signals for the state a peer is already in are accepted as
    /// no-ops; anything that would move a peer backwards, or skip the
    /// `Connecting` step, is rejected.
    pub fn transition(
        self,
        peer_id: PeerId,
        event: ConnectionEvent,
    ) -> Result<StateTransition, StateTransitionError> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let to = match (self, event) {
            // Discovery never demotes an engaged peer
            (S::Discovering, E::Found) => S::Discovering,
            (S::Connecting, E::Found) => S::Connecting,
            (S::Connected, E::Found) => S::Connected,
            (S::Disconnected, E::Found) => S::Discovering,

            (S::Discovering, E::Connecting) => S::Connecting,
            (S::Connecting, E::Connecting) => S::Connecting,
            (S::Disconnected, E::Connecting) => S::Connecting,

            (S::Connecting, E::Connected) => S::Connected,
            (S::Connected, E::Connected) => S::Connected,

            (_, E::Disconnected) => S::Disconnected,

            (from, event) => {
                return Err(StateTransitionError::InvalidTransition {
                    peer_id: peer_id.to_string(),
                    from: from.state_name().to_string(),
                    event,
                })
            }
        };

        Ok(StateTransition {
            peer_id,
            from: Some(self),
            to,
            event,
        })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
