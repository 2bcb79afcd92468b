//! Browser
//!
//! Looks for peers advertising a service and invites each discovered peer
//! into the local session, subject to the configured [`DiscoveryPolicy`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use peerkit_core::{
    ConnectionEvent, DiscoveryInfo, DiscoveryPolicy, PeerId, PeerIdentity, PeerKitResult,
    ServiceId, TransportProvider,
};
use tracing::{debug, info};

use crate::session::SessionManager;

// ----------------------------------------------------------------------------
// Browser
// ----------------------------------------------------------------------------

/// A peer seen advertising the browsed service
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub identity: PeerIdentity,
    pub info: Option<DiscoveryInfo>,
}

pub struct Browser {
    transport: Arc<dyn TransportProvider>,
    policy: Arc<dyn DiscoveryPolicy>,
    invite_timeout: Duration,
    service: Option<ServiceId>,
    discovered: HashMap<PeerId, DiscoveredPeer>,
    invitations_sent: u64,
}

impl Browser {
    pub fn new(
        transport: Arc<dyn TransportProvider>,
        policy: Arc<dyn DiscoveryPolicy>,
        invite_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            policy,
            invite_timeout,
            service: None,
            discovered: HashMap::new(),
            invitations_sent: 0,
        }
    }

    /// Start browsing, restarting cleanly if already active
    pub async fn start(&mut self, service: ServiceId) -> PeerKitResult<()> {
        if self.service.is_some() {
            debug!("Browser already active, restarting");
            self.stop().await?;
        }
        self.transport.start_browsing(&service).await?;
        info!("Browsing for '{}'", service);
        self.service = Some(service);
        Ok(())
    }

    /// Stop browsing and forget discovered peers; safe when never started
    pub async fn stop(&mut self) -> PeerKitResult<()> {
        self.discovered.clear();
        if let Some(service) = self.service.take() {
            self.transport.stop_browsing().await?;
            info!("Stopped browsing for '{}'", service);
        }
        Ok(())
    }

    pub fn is_browsing(&self) -> bool {
        self.service.is_some()
    }

    /// Record a found peer and invite it unless it is already engaged.
    ///
    /// Returns whether an invitation went out.
    pub async fn handle_found(
        &mut self,
        peer: PeerIdentity,
        info: Option<DiscoveryInfo>,
        session: &mut SessionManager,
    ) -> PeerKitResult<bool> {
        if !self.is_browsing() {
            return Ok(false);
        }

        session.apply(&peer, ConnectionEvent::Found);
        self.discovered.insert(
            peer.id(),
            DiscoveredPeer {
                identity: peer.clone(),
                info: info.clone(),
            },
        );

        if session.state_of(&peer.id()).is_some_and(|s| s.is_engaged()) {
            debug!("Found {} again, already engaged", peer);
            return Ok(false);
        }
        if !self.policy.should_invite(&peer, info.as_ref()) {
            debug!("Discovery policy skipped {}", peer);
            return Ok(false);
        }

        self.transport
            .invite(&peer, None, self.invite_timeout)
            .await?;
        self.invitations_sent += 1;
        debug!("Invited {} (timeout {:?})", peer, self.invite_timeout);
        Ok(true)
    }

    /// Forget a peer that went out of range; returns whether it was known
    pub fn handle_lost(&mut self, peer: &PeerIdentity) -> bool {
        let known = self.discovered.remove(&peer.id()).is_some();
        if known {
            debug!("Lost sight of {}", peer);
        }
        known
    }

    /// Peers currently in range
    pub fn discovered(&self) -> impl Iterator<Item = &DiscoveredPeer> {
        self.discovered.values()
    }

    pub fn invitations_sent(&self) -> u64 {
        self.invitations_sent
    }
}
