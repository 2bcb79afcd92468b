//! Session management for the PeerKit runtime
//!
//! The [`SessionManager`] owns the mapping from peers to their
//! [`ConnectionState`], applies lifecycle events through the core state
//! machine and publishes the connected-peer view.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use peerkit_core::{
    ConnectionEvent, ConnectionState, EncryptionPreference, PeerId, PeerIdentity,
    PeerKitResult, StateTransition, TransportProvider,
};
use smallvec::SmallVec;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Maximum number of transitions kept in the audit trail
const AUDIT_TRAIL_LIMIT: usize = 1000;

/// Sender side of the connected-peer view
pub type ConnectedPeersSender = watch::Sender<Vec<PeerIdentity>>;
/// Receiver side of the connected-peer view
pub type ConnectedPeersReceiver = watch::Receiver<Vec<PeerIdentity>>;

/// Transitions produced by a single lifecycle event
pub type Transitions = SmallVec<[StateTransition; 2]>;

// ----------------------------------------------------------------------------
// Session Manager
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PeerRecord {
    identity: PeerIdentity,
    state: ConnectionState,
}

/// Tracks connection state for every peer of the local session
pub struct SessionManager {
    transport: Arc<dyn TransportProvider>,
    encryption: EncryptionPreference,
    open: bool,
    peers: HashMap<PeerId, PeerRecord>,
    /// Connected peers in the order they joined
    connected: Vec<PeerIdentity>,
    connected_tx: ConnectedPeersSender,
    audit_trail: VecDeque<StateTransition>,
    rejected_transitions: u64,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn TransportProvider>,
        encryption: EncryptionPreference,
        connected_tx: ConnectedPeersSender,
    ) -> Self {
        Self {
            transport,
            encryption,
            open: false,
            peers: HashMap::new(),
            connected: Vec::new(),
            connected_tx,
            audit_trail: VecDeque::new(),
            rejected_transitions: 0,
        }
    }

    /// Open the local session; no-op when already open
    pub async fn connect(&mut self) -> PeerKitResult<()> {
        if self.open {
            return Ok(());
        }
        self.transport.connect(self.encryption).await?;
        self.open = true;
        info!("Session opened (encryption: {:?})", self.encryption);
        Ok(())
    }

    /// Close the local session and forget every peer; no-op when closed
    pub async fn disconnect(&mut self) -> PeerKitResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.peers.clear();
        self.connected.clear();
        self.publish();
        self.transport.disconnect().await?;
        info!("Session closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Apply a lifecycle event for `peer`.
    ///
    /// Returns the transitions that changed the peer's state, in order.
    /// Duplicates yield nothing and rejected transitions are logged and
    /// dropped. A `Connected` for a peer that is not `Connecting` gets the
    /// `Connecting` step applied first.
    pub fn apply(&mut self, peer: &PeerIdentity, event: ConnectionEvent) -> Transitions {
        let mut applied = Transitions::new();

        if event == ConnectionEvent::Connected
            && !self.state_of(&peer.id()).is_some_and(|s| s.is_engaged())
        {
            debug!("Normalising connected for {} via connecting", peer);
            if !self.step(peer, ConnectionEvent::Connecting, &mut applied) {
                return applied;
            }
        }
        self.step(peer, event, &mut applied);

        if applied
            .iter()
            .any(|t| t.to.is_connected() || t.from.is_some_and(|s| s.is_connected()))
        {
            self.publish();
        }
        applied
    }

    /// Apply one event; false when the state machine rejected it
    fn step(&mut self, peer: &PeerIdentity, event: ConnectionEvent, applied: &mut Transitions) -> bool {
        let peer_id = peer.id();
        let result = match self.peers.get(&peer_id) {
            Some(record) => record.state.transition(peer_id, event),
            None => ConnectionState::initial(peer_id, event),
        };

        let transition = match result {
            Ok(transition) => transition,
            Err(e) => {
                self.rejected_transitions += 1;
                warn!("Ignoring lifecycle event for {}: {}", peer, e);
                return false;
            }
        };

        if !transition.is_change() {
            debug!("Duplicate {:?} for {} ignored", event, peer);
            return true;
        }

        self.peers.insert(
            peer_id,
            PeerRecord {
                identity: peer.clone(),
                state: transition.to,
            },
        );
        if transition.to.is_connected() {
            self.connected.push(peer.clone());
        } else if transition.from.is_some_and(|s| s.is_connected()) {
            self.connected.retain(|p| p.id() != peer_id);
        }

        debug!(
            "Peer {} {} -> {}",
            peer,
            transition.from.map(|s| s.state_name()).unwrap_or("Unknown"),
            transition.to
        );
        self.audit_trail.push_back(transition);
        if self.audit_trail.len() > AUDIT_TRAIL_LIMIT {
            self.audit_trail.pop_front();
        }
        applied.push(transition);
        true
    }

    fn publish(&self) {
        self.connected_tx.send_replace(self.connected.clone());
    }

    pub fn state_of(&self, peer_id: &PeerId) -> Option<ConnectionState> {
        self.peers.get(peer_id).map(|record| record.state)
    }

    /// Peers currently `Connected`, in the order they joined
    pub fn connected_peers(&self) -> &[PeerIdentity] {
        &self.connected
    }

    /// Every known peer with its state
    pub fn peers(&self) -> impl Iterator<Item = (&PeerIdentity, ConnectionState)> {
        self.peers
            .values()
            .map(|record| (&record.identity, record.state))
    }

    pub fn audit_trail(&self) -> &VecDeque<StateTransition> {
        &self.audit_trail
    }

    pub fn rejected_transitions(&self) -> u64 {
        self.rejected_transitions
    }
}
