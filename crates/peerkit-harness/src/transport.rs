//! Loopback transport provider
//!
//! Each [`LoopbackTransport`] is one node on a [`LoopbackNetwork`]. It
//! implements [`TransportProvider`] by mutating the shared network state and
//! emitting the callbacks a radio transport would produce:
//!
//! - advertising/browsing for the same service yields `FoundPeer` on the
//!   browser, and `LostPeer` when the advertiser stops;
//! - `invite` yields `Connecting` on the inviter and `Invitation` on the
//!   target; accepting yields `Connecting`/`Connected` on the target and
//!   `Connected` on the inviter, declining or expiry yields `Disconnected`
//!   on the inviter;
//! - `disconnect` tears down every link with `Disconnected` on both sides.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use peerkit_core::errors::TransportError;
use peerkit_core::{
    DiscoveryInfo, EncryptionPreference, PeerIdentity, PeerKitError, Progress, Result,
    SendMode, ServiceId, TransportEvent, TransportEventSender, TransportProvider,
};
use tracing::{debug, warn};

use crate::network::{LoopbackNetwork, SentRecord};

/// Number of chunks a simulated resource transfer is split into
const TRANSFER_STEPS: u64 = 4;

/// One node on a [`LoopbackNetwork`]
#[derive(Debug)]
pub struct LoopbackTransport {
    identity: PeerIdentity,
    network: LoopbackNetwork,
}

impl LoopbackTransport {
    pub(crate) fn new(identity: PeerIdentity, network: LoopbackNetwork) -> Self {
        Self { identity, network }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Make every resource transfer from this node to `peer` fail
    pub fn fail_resources_to(&self, peer: &PeerIdentity) {
        if let Some(node) = self.network.lock().node_mut(self.identity.id()) {
            node.fail_resources_to.insert(peer.id());
        }
    }

    /// Push a raw callback into this node, as if the radio reported it
    pub fn inject(&self, event: TransportEvent) {
        self.network.lock().emit(self.identity.id(), event);
    }

    fn not_found(peer: &PeerIdentity) -> PeerKitError {
        PeerKitError::Transport(TransportError::PeerNotFound {
            peer_id: peer.id().to_string(),
        })
    }
}

#[async_trait]
impl TransportProvider for LoopbackTransport {
    fn local_peer(&self) -> PeerIdentity {
        self.identity.clone()
    }

    fn attach(&self, events: TransportEventSender) -> Result<()> {
        let mut state = self.network.lock();
        let node = state
            .node_mut(self.identity.id())
            .ok_or_else(|| Self::not_found(&self.identity))?;
        if node.events.is_some() {
            return Err(TransportError::AlreadyAttached.into());
        }
        node.events = Some(events);
        Ok(())
    }

    async fn start_advertising(
        &self,
        service: &ServiceId,
        info: Option<&DiscoveryInfo>,
    ) -> Result<()> {
        let me = self.identity.id();
        let mut state = self.network.lock();
        if let Some(node) = state.node_mut(me) {
            node.advertising = Some((service.clone(), info.cloned()));
        }
        for browser in state.browsers_of(service, me) {
            state.emit(
                browser,
                TransportEvent::FoundPeer {
                    peer: self.identity.clone(),
                    info: info.cloned(),
                },
            );
        }
        debug!("{} advertising '{}'", self.identity, service);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        let me = self.identity.id();
        let mut state = self.network.lock();
        let previous = state
            .node_mut(me)
            .and_then(|node| node.advertising.take());
        if let Some((service, _)) = previous {
            for browser in state.browsers_of(&service, me) {
                state.emit(
                    browser,
                    TransportEvent::LostPeer {
                        peer: self.identity.clone(),
                    },
                );
            }
            debug!("{} stopped advertising '{}'", self.identity, service);
        }
        Ok(())
    }

    async fn respond_to_invitation(&self, from: &PeerIdentity, accept: bool) -> Result<()> {
        let me = self.identity.id();
        let mut state = self.network.lock();
        let was_pending = state
            .node_mut(me)
            .map(|node| node.pending_invites.remove(&from.id()))
            .unwrap_or(false);
        if !was_pending {
            return Err(Self::not_found(from));
        }

        if accept {
            state.link(me, from.id());
            state.emit(me, TransportEvent::Connecting { peer: from.clone() });
            state.emit(me, TransportEvent::Connected { peer: from.clone() });
            state.emit(
                from.id(),
                TransportEvent::Connected {
                    peer: self.identity.clone(),
                },
            );
        } else {
            state.emit(
                from.id(),
                TransportEvent::Disconnected {
                    peer: self.identity.clone(),
                },
            );
        }
        Ok(())
    }

    async fn start_browsing(&self, service: &ServiceId) -> Result<()> {
        let me = self.identity.id();
        let mut state = self.network.lock();
        if let Some(node) = state.node_mut(me) {
            node.browsing = Some(service.clone());
        }
        for advertiser in state.advertisers_of(service, me) {
            let Some(node) = state.nodes.get(&advertiser) else {
                continue;
            };
            let event = TransportEvent::FoundPeer {
                peer: node.identity.clone(),
                info: node.advertising.as_ref().and_then(|(_, info)| info.clone()),
            };
            state.emit(me, event);
        }
        debug!("{} browsing for '{}'", self.identity, service);
        Ok(())
    }

    async fn stop_browsing(&self) -> Result<()> {
        if let Some(node) = self.network.lock().node_mut(self.identity.id()) {
            node.browsing = None;
        }
        Ok(())
    }

    async fn invite(
        &self,
        peer: &PeerIdentity,
        context: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<()> {
        let me = self.identity.id();
        {
            let mut state = self.network.lock();
            let target = state
                .node_mut(peer.id())
                .filter(|node| node.advertising.is_some())
                .ok_or_else(|| Self::not_found(peer))?;
            target.pending_invites.insert(me);

            state.emit(me, TransportEvent::Connecting { peer: peer.clone() });
            state.emit(
                peer.id(),
                TransportEvent::Invitation {
                    from: self.identity.clone(),
                    context,
                },
            );
        }
        self.network
            .stats_handle()
            .invitations
            .fetch_add(1, Ordering::Relaxed);

        // Unanswered invitations expire into a plain disconnect
        let network = self.network.clone();
        let inviter = self.identity.clone();
        let target = peer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut state = network.lock();
            let expired = state
                .node_mut(target.id())
                .map(|node| node.pending_invites.remove(&inviter.id()))
                .unwrap_or(false);
            if expired {
                debug!("invitation from {} to {} expired", inviter, target);
                state.emit(inviter.id(), TransportEvent::Disconnected { peer: target });
            }
        });
        Ok(())
    }

    async fn connect(&self, encryption: EncryptionPreference) -> Result<()> {
        if let Some(node) = self.network.lock().node_mut(self.identity.id()) {
            node.session_open = true;
        }
        debug!("{} session open ({:?})", self.identity, encryption);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let me = self.identity.id();
        let mut state = self.network.lock();
        let links: Vec<_> = match state.node_mut(me) {
            Some(node) => {
                node.session_open = false;
                node.pending_invites.clear();
                node.links.iter().copied().collect()
            }
            None => return Ok(()),
        };
        for peer in links {
            state.unlink(me, peer);
        }
        Ok(())
    }

    async fn send_data(&self, data: &[u8], peers: &[PeerIdentity], mode: SendMode) -> Result<()> {
        let me = self.identity.id();
        let mut state = self.network.lock();
        for peer in peers {
            if !state.is_linked(me, peer.id()) {
                return Err(PeerKitError::peer_not_connected(peer.id().to_string()));
            }
        }

        let stats = self.network.stats_handle();
        for peer in peers {
            stats.data_sends.fetch_add(1, Ordering::Relaxed);
            stats
                .bytes_sent
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            state.sent.push(SentRecord {
                from: me,
                to: peer.id(),
                data: data.to_vec(),
                mode,
            });
            state.emit(
                peer.id(),
                TransportEvent::ReceivedData {
                    from: self.identity.clone(),
                    data: data.to_vec(),
                },
            );
        }
        Ok(())
    }

    async fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peer: &PeerIdentity,
        progress: Arc<Progress>,
    ) -> Result<()> {
        let me = self.identity.id();
        let stats = self.network.stats_handle().clone();
        let (step_delay, should_fail) = {
            let state = self.network.lock();
            if !state.is_linked(me, peer.id()) {
                return Err(PeerKitError::peer_not_connected(peer.id().to_string()));
            }
            let should_fail = state
                .nodes
                .get(&me)
                .map(|node| node.fail_resources_to.contains(&peer.id()))
                .unwrap_or(false);
            (state.transfer_step_delay, should_fail)
        };

        let size = tokio::fs::metadata(path)
            .await
            .map_err(TransportError::NetworkIo)?
            .len();
        progress.set_total(size.max(1));

        let chunk = (size / TRANSFER_STEPS).max(1);
        for _ in 0..TRANSFER_STEPS {
            if !step_delay.is_zero() {
                tokio::time::sleep(step_delay).await;
            }
            if should_fail {
                stats.resources_failed.fetch_add(1, Ordering::Relaxed);
                warn!("{} simulated resource failure to {}", self.identity, peer);
                return Err(PeerKitError::resource_failed(
                    peer.id().to_string(),
                    "link dropped mid-transfer",
                ));
            }
            progress.advance(chunk);
        }
        progress.set_completed(size.max(1));

        stats.resources_sent.fetch_add(1, Ordering::Relaxed);
        self.network.lock().emit(
            peer.id(),
            TransportEvent::ReceivedResourceFinished {
                from: self.identity.clone(),
                name: name.to_string(),
                location: path.to_path_buf(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerkit_core::{create_transport_event_channel, TransportEventReceiver};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    fn attached(network: &LoopbackNetwork, name: &str) -> (Arc<LoopbackTransport>, TransportEventReceiver) {
        init_tracing();
        let node = network.add_node(name);
        let (tx, rx) = create_transport_event_channel();
        node.attach(tx).unwrap();
        (node, rx)
    }

    #[tokio::test]
    async fn test_attach_twice_rejected() {
        let network = LoopbackNetwork::new();
        let (node, _rx) = attached(&network, "a");
        let (tx, _) = create_transport_event_channel();
        assert!(node.attach(tx).is_err());
    }

    #[tokio::test]
    async fn test_discovery_invite_accept() {
        let network = LoopbackNetwork::new();
        let (host, mut host_rx) = attached(&network, "host");
        let (guest, mut guest_rx) = attached(&network, "guest");
        let service = ServiceId::new("chat").unwrap();

        host.start_advertising(&service, None).await.unwrap();
        guest.start_browsing(&service).await.unwrap();
        match guest_rx.recv().await {
            Some(TransportEvent::FoundPeer { peer, .. }) => assert_eq!(&peer, host.identity()),
            other => panic!("unexpected event: {:?}", other),
        }

        guest
            .invite(host.identity(), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::Connecting { .. })));
        assert!(matches!(host_rx.recv().await, Some(TransportEvent::Invitation { .. })));

        host.respond_to_invitation(guest.identity(), true).await.unwrap();
        assert!(matches!(host_rx.recv().await, Some(TransportEvent::Connecting { .. })));
        assert!(matches!(host_rx.recv().await, Some(TransportEvent::Connected { .. })));
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::Connected { .. })));
        assert!(network.is_linked(host.identity(), guest.identity()));

        guest
            .send_data(b"hi", &[host.identity().clone()], SendMode::Reliable)
            .await
            .unwrap();
        match host_rx.recv().await {
            Some(TransportEvent::ReceivedData { from, data }) => {
                assert_eq!(&from, guest.identity());
                assert_eq!(data, b"hi");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(network.stats().data_sends(), 1);
    }

    #[tokio::test]
    async fn test_declined_and_expired_invitations() {
        let network = LoopbackNetwork::new();
        let (host, _host_rx) = attached(&network, "host");
        let (guest, mut guest_rx) = attached(&network, "guest");
        let service = ServiceId::new("chat").unwrap();
        host.start_advertising(&service, None).await.unwrap();

        guest
            .invite(host.identity(), None, Duration::from_secs(5))
            .await
            .unwrap();
        host.respond_to_invitation(guest.identity(), false).await.unwrap();
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::Connecting { .. })));
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::Disconnected { .. })));

        guest
            .invite(host.identity(), None, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::Connecting { .. })));
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::Disconnected { .. })));
        assert!(host.respond_to_invitation(guest.identity(), true).await.is_err());
    }

    #[tokio::test]
    async fn test_send_requires_link() {
        let network = LoopbackNetwork::new();
        let (a, _a_rx) = attached(&network, "a");
        let (b, _b_rx) = attached(&network, "b");
        let result = a
            .send_data(b"x", &[b.identity().clone()], SendMode::Reliable)
            .await;
        assert!(result.is_err());
        assert!(network.sent().is_empty());
    }
}
