//! Transport abstraction for PeerKit
//!
//! The transport provider is the external layer that performs actual peer
//! discovery, link establishment and byte/resource delivery. This module
//! defines the interface the session layer drives and the callback events
//! the transport reports back.
//!
//! ## Callback delivery
//!
//! Transports report lifecycle and data callbacks by pushing
//! [`TransportEvent`]s into the [`TransportEventSender`] handed to
//! [`TransportProvider::attach`]. The sender is an unbounded channel so it
//! can be used from any thread, including non-async radio callback threads.
//! Events for a single peer must be pushed in the order they happened; no
//! ordering across peers is assumed.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EncryptionPreference;
use crate::resource::Progress;
use crate::types::{DiscoveryInfo, PeerIdentity, ServiceId};
use crate::Result;

// ----------------------------------------------------------------------------
// Transport Events
// ----------------------------------------------------------------------------

/// Callbacks reported by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer advertising the browsed service came into range
    FoundPeer {
        peer: PeerIdentity,
        info: Option<DiscoveryInfo>,
    },
    /// A previously found peer went out of range
    LostPeer { peer: PeerIdentity },
    /// A remote browser invited us into its session
    Invitation {
        from: PeerIdentity,
        context: Option<Vec<u8>>,
    },
    /// Link establishment with `peer` started
    Connecting { peer: PeerIdentity },
    /// Link with `peer` is up
    Connected { peer: PeerIdentity },
    /// Link with `peer` is gone, or never came up
    Disconnected { peer: PeerIdentity },
    /// Raw bytes arrived from `from`
    ReceivedData { from: PeerIdentity, data: Vec<u8> },
    /// A resource sent by `from` finished arriving at `location`
    ReceivedResourceFinished {
        from: PeerIdentity,
        name: String,
        location: PathBuf,
    },
    /// Advertising or browsing could not be started
    DiscoveryFailed { role: DiscoveryRole, reason: String },
}

impl TransportEvent {
    /// Peer the event concerns, if any
    pub fn peer(&self) -> Option<&PeerIdentity> {
        match self {
            TransportEvent::FoundPeer { peer, .. }
            | TransportEvent::LostPeer { peer }
            | TransportEvent::Connecting { peer }
            | TransportEvent::Connected { peer }
            | TransportEvent::Disconnected { peer } => Some(peer),
            TransportEvent::Invitation { from, .. }
            | TransportEvent::ReceivedData { from, .. }
            | TransportEvent::ReceivedResourceFinished { from, .. } => Some(from),
            TransportEvent::DiscoveryFailed { .. } => None,
        }
    }

    /// Short event name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::FoundPeer { .. } => "found_peer",
            TransportEvent::LostPeer { .. } => "lost_peer",
            TransportEvent::Invitation { .. } => "invitation",
            TransportEvent::Connecting { .. } => "connecting",
            TransportEvent::Connected { .. } => "connected",
            TransportEvent::Disconnected { .. } => "disconnected",
            TransportEvent::ReceivedData { .. } => "received_data",
            TransportEvent::ReceivedResourceFinished { .. } => "received_resource_finished",
            TransportEvent::DiscoveryFailed { .. } => "discovery_failed",
        }
    }
}

/// Which side of discovery failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryRole {
    Advertising,
    Browsing,
}

pub type TransportEventSender = tokio::sync::mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = tokio::sync::mpsc::UnboundedReceiver<TransportEvent>;

/// Create the channel a transport reports its callbacks on
pub fn create_transport_event_channel() -> (TransportEventSender, TransportEventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

// ----------------------------------------------------------------------------
// Send Mode
// ----------------------------------------------------------------------------

/// Delivery guarantee requested for a data send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Guaranteed, in-order per destination, retried by the transport
    #[default]
    Reliable,
    /// Best effort
    Unreliable,
}

// ----------------------------------------------------------------------------
// Transport Provider Trait
// ----------------------------------------------------------------------------

/// Interface the session layer requires from the underlying transport.
///
/// Methods take `&self`: a provider is shared between the dispatcher task,
/// the outbound queue and resource transfer tasks, so implementations keep
/// their own interior state.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Identity of the local peer
    fn local_peer(&self) -> PeerIdentity;

    /// Register the channel callbacks are reported on
    fn attach(&self, events: TransportEventSender) -> Result<()>;

    /// Announce local presence under `service`
    async fn start_advertising(
        &self,
        service: &ServiceId,
        info: Option<&DiscoveryInfo>,
    ) -> Result<()>;

    /// Withdraw the announcement
    async fn stop_advertising(&self) -> Result<()>;

    /// Answer an invitation previously reported as [`TransportEvent::Invitation`]
    async fn respond_to_invitation(&self, from: &PeerIdentity, accept: bool) -> Result<()>;

    /// Look for peers advertising `service`
    async fn start_browsing(&self, service: &ServiceId) -> Result<()>;

    /// Stop looking for peers
    async fn stop_browsing(&self) -> Result<()>;

    /// Invite a discovered peer into the session
    async fn invite(
        &self,
        peer: &PeerIdentity,
        context: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<()>;

    /// Open the local session
    async fn connect(&self, encryption: EncryptionPreference) -> Result<()>;

    /// Drop every link and close the local session
    async fn disconnect(&self) -> Result<()>;

    /// Queue `data` for delivery to `peers`
    async fn send_data(&self, data: &[u8], peers: &[PeerIdentity], mode: SendMode) -> Result<()>;

    /// Send the file at `path` to `peer`, resolving once the transfer ends.
    ///
    /// Implementations report progress through `progress` while the
    /// transfer runs.
    async fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peer: &PeerIdentity,
        progress: Arc<Progress>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_peer_and_kind() {
        let peer = PeerIdentity::new("b");
        let event = TransportEvent::ReceivedData {
            from: peer.clone(),
            data: vec![1],
        };
        assert_eq!(event.peer(), Some(&peer));
        assert_eq!(event.kind(), "received_data");

        let failed = TransportEvent::DiscoveryFailed {
            role: DiscoveryRole::Browsing,
            reason: "radio off".into(),
        };
        assert!(failed.peer().is_none());
    }

    #[tokio::test]
    async fn test_event_channel_is_usable_from_threads() {
        let (sender, mut receiver) = create_transport_event_channel();
        let peer = PeerIdentity::new("a");
        let sent = peer.clone();
        std::thread::spawn(move || {
            sender.send(TransportEvent::Connecting { peer: sent }).unwrap();
        })
        .join()
        .unwrap();

        match receiver.recv().await {
            Some(TransportEvent::Connecting { peer: got }) => assert_eq!(got, peer),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
