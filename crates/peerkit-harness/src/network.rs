//! Shared in-memory network
//!
//! A [`LoopbackNetwork`] is the "air" between [`LoopbackTransport`] nodes.
//! It tracks who advertises and browses which service, pending invitations
//! and established links, and routes [`TransportEvent`]s to every node
//! involved in an operation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use peerkit_core::{
    DiscoveryInfo, PeerId, PeerIdentity, SendMode, ServiceId, TransportEvent,
    TransportEventSender,
};
use smallvec::SmallVec;
use tracing::trace;

use crate::transport::LoopbackTransport;

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Network-wide counters
#[derive(Debug, Default)]
pub struct NetworkStats {
    pub data_sends: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub invitations: AtomicU64,
    pub resources_sent: AtomicU64,
    pub resources_failed: AtomicU64,
}

impl NetworkStats {
    pub fn data_sends(&self) -> u64 {
        self.data_sends.load(Ordering::Relaxed)
    }

    pub fn invitations(&self) -> u64 {
        self.invitations.load(Ordering::Relaxed)
    }

    pub fn resources_sent(&self) -> u64 {
        self.resources_sent.load(Ordering::Relaxed)
    }

    pub fn resources_failed(&self) -> u64 {
        self.resources_failed.load(Ordering::Relaxed)
    }
}

/// One delivered `send_data` call, kept for assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub from: PeerId,
    pub to: PeerId,
    pub data: Vec<u8>,
    pub mode: SendMode,
}

// ----------------------------------------------------------------------------
// Network State
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct NodeState {
    pub identity: PeerIdentity,
    pub events: Option<TransportEventSender>,
    pub advertising: Option<(ServiceId, Option<DiscoveryInfo>)>,
    pub browsing: Option<ServiceId>,
    pub session_open: bool,
    pub links: HashSet<PeerId>,
    /// Invitations received and not yet answered, keyed by inviter
    pub pending_invites: HashSet<PeerId>,
    pub fail_resources_to: HashSet<PeerId>,
}

impl NodeState {
    fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            events: None,
            advertising: None,
            browsing: None,
            session_open: false,
            links: HashSet::new(),
            pending_invites: HashSet::new(),
            fail_resources_to: HashSet::new(),
        }
    }

    fn advertises(&self, service: &ServiceId) -> bool {
        matches!(&self.advertising, Some((advertised, _)) if advertised == service)
    }

    fn browses(&self, service: &ServiceId) -> bool {
        self.browsing.as_ref() == Some(service)
    }
}

#[derive(Debug, Default)]
pub(crate) struct NetworkState {
    pub nodes: HashMap<PeerId, NodeState>,
    pub sent: Vec<SentRecord>,
    pub transfer_step_delay: Duration,
}

impl NetworkState {
    /// Deliver `event` to `target`, dropping it if the node is detached
    pub fn emit(&self, target: PeerId, event: TransportEvent) {
        let Some(node) = self.nodes.get(&target) else {
            return;
        };
        match &node.events {
            Some(events) => {
                trace!("loopback -> {}: {}", node.identity, event.kind());
                let _ = events.send(event);
            }
            None => trace!("loopback drop for detached {}: {}", node.identity, event.kind()),
        }
    }

    pub fn identity(&self, peer: PeerId) -> Option<PeerIdentity> {
        self.nodes.get(&peer).map(|node| node.identity.clone())
    }

    pub fn node_mut(&mut self, peer: PeerId) -> Option<&mut NodeState> {
        self.nodes.get_mut(&peer)
    }

    /// Peers other than `me` advertising `service`
    pub fn advertisers_of(&self, service: &ServiceId, me: PeerId) -> SmallVec<[PeerId; 8]> {
        self.nodes
            .iter()
            .filter(|(id, node)| **id != me && node.advertises(service))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Peers other than `me` browsing for `service`
    pub fn browsers_of(&self, service: &ServiceId, me: PeerId) -> SmallVec<[PeerId; 8]> {
        self.nodes
            .iter()
            .filter(|(id, node)| **id != me && node.browses(service))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        self.nodes
            .get(&a)
            .map(|node| node.links.contains(&b))
            .unwrap_or(false)
    }

    pub fn link(&mut self, a: PeerId, b: PeerId) {
        if let Some(node) = self.nodes.get_mut(&a) {
            node.links.insert(b);
        }
        if let Some(node) = self.nodes.get_mut(&b) {
            node.links.insert(a);
        }
    }

    /// Tear down the link between `a` and `b`, notifying both sides
    pub fn unlink(&mut self, a: PeerId, b: PeerId) {
        let was_linked = self.is_linked(a, b);
        if let Some(node) = self.nodes.get_mut(&a) {
            node.links.remove(&b);
        }
        if let Some(node) = self.nodes.get_mut(&b) {
            node.links.remove(&a);
        }
        if !was_linked {
            return;
        }
        if let (Some(a_identity), Some(b_identity)) = (self.identity(a), self.identity(b)) {
            self.emit(a, TransportEvent::Disconnected { peer: b_identity });
            self.emit(b, TransportEvent::Disconnected { peer: a_identity });
        }
    }
}

// ----------------------------------------------------------------------------
// Loopback Network
// ----------------------------------------------------------------------------

/// In-memory network shared by any number of loopback nodes
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
    stats: Arc<NetworkStats>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay between simulated resource chunks (zero by default)
    pub fn with_transfer_step_delay(self, delay: Duration) -> Self {
        self.lock().transfer_step_delay = delay;
        self
    }

    /// Join a new node with the given display name
    pub fn add_node<N: Into<String>>(&self, display_name: N) -> Arc<LoopbackTransport> {
        let identity = PeerIdentity::new(display_name);
        self.lock()
            .nodes
            .insert(identity.id(), NodeState::new(identity.clone()));
        Arc::new(LoopbackTransport::new(identity, self.clone()))
    }

    /// Drop the link between two nodes as if they went out of range
    pub fn sever(&self, a: &PeerIdentity, b: &PeerIdentity) {
        self.lock().unlink(a.id(), b.id());
    }

    /// Every `send_data` delivery so far, in send order
    pub fn sent(&self) -> Vec<SentRecord> {
        self.lock().sent.clone()
    }

    /// Deliveries from `from` to `to`, in send order
    pub fn sent_between(&self, from: &PeerIdentity, to: &PeerIdentity) -> Vec<SentRecord> {
        self.lock()
            .sent
            .iter()
            .filter(|record| record.from == from.id() && record.to == to.id())
            .cloned()
            .collect()
    }

    /// Whether two nodes currently hold a link
    pub fn is_linked(&self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        self.lock().is_linked(a.id(), b.id())
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub(crate) fn stats_handle(&self) -> &Arc<NetworkStats> {
        &self.stats
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlink_only_notifies_linked_peers() {
        let network = LoopbackNetwork::new();
        let a = network.add_node("a");
        let b = network.add_node("b");
        let (a_tx, mut a_rx) = peerkit_core::create_transport_event_channel();
        network.lock().node_mut(a.identity().id()).unwrap().events = Some(a_tx);

        network.sever(a.identity(), b.identity());
        assert!(a_rx.try_recv().is_err());

        network.lock().link(a.identity().id(), b.identity().id());
        assert!(network.is_linked(a.identity(), b.identity()));
        network.sever(a.identity(), b.identity());
        assert!(matches!(
            a_rx.try_recv(),
            Ok(TransportEvent::Disconnected { .. })
        ));
        assert!(!network.is_linked(b.identity(), a.identity()));
    }
}
