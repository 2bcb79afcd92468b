//! Transceiver
//!
//! Role management on top of the session: advertise, browse, or both.
//! The transceiver owns the [`SessionManager`], [`Advertiser`] and
//! [`Browser`] and keeps them consistent with the active [`Role`].

use std::sync::Arc;

use peerkit_core::{
    DiscoveryInfo, DiscoveryPolicy, InvitationPolicy, PeerIdentity, PeerKitResult, ServiceId,
    SessionConfig, TransportProvider,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::advertiser::Advertiser;
use crate::browser::Browser;
use crate::session::{ConnectedPeersSender, SessionManager};

// ----------------------------------------------------------------------------
// Role
// ----------------------------------------------------------------------------

/// Operating mode of the transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Advertise,
    Browse,
    Both,
}

impl Role {
    pub fn advertises(&self) -> bool {
        matches!(self, Role::Advertise | Role::Both)
    }

    pub fn browses(&self) -> bool {
        matches!(self, Role::Browse | Role::Both)
    }
}

// ----------------------------------------------------------------------------
// Transceiver
// ----------------------------------------------------------------------------

pub struct Transceiver {
    session: SessionManager,
    advertiser: Advertiser,
    browser: Browser,
    role: Option<Role>,
    service: Option<ServiceId>,
}

impl Transceiver {
    pub fn new(
        transport: Arc<dyn TransportProvider>,
        config: &SessionConfig,
        invitation_policy: Arc<dyn InvitationPolicy>,
        discovery_policy: Arc<dyn DiscoveryPolicy>,
        connected_tx: ConnectedPeersSender,
    ) -> Self {
        Self {
            session: SessionManager::new(transport.clone(), config.encryption, connected_tx),
            advertiser: Advertiser::new(transport.clone(), invitation_policy),
            browser: Browser::new(transport, discovery_policy, config.invite_timeout),
            role: None,
            service: None,
        }
    }

    /// Enter `role` for `service`.
    ///
    /// The session is connected first. Sub-components the role includes are
    /// (re)started; those it excludes are stopped.
    pub async fn start(
        &mut self,
        role: Role,
        service: ServiceId,
        info: Option<DiscoveryInfo>,
    ) -> PeerKitResult<()> {
        self.session.connect().await?;

        if role.advertises() {
            self.advertiser.start(service.clone(), info).await?;
        } else {
            self.advertiser.stop().await?;
        }

        if role.browses() {
            self.browser.start(service.clone()).await?;
        } else {
            self.browser.stop().await?;
        }

        if let Some(previous) = self.role.replace(role) {
            debug!("Role changed {:?} -> {:?}", previous, role);
        }
        info!("Transceiving as {:?} on '{}'", role, service);
        self.service = Some(service);
        Ok(())
    }

    /// Stop both sub-components and disconnect the session. Idempotent.
    ///
    /// Every step runs even if an earlier one fails; the first error is
    /// returned.
    pub async fn stop(&mut self) -> PeerKitResult<()> {
        if self.role.is_none() && !self.session.is_open() {
            debug!("Transceiver already stopped");
            return Ok(());
        }

        let advertiser = self.advertiser.stop().await;
        let browser = self.browser.stop().await;
        let session = self.session.disconnect().await;
        self.role = None;
        self.service = None;

        for result in [&advertiser, &browser, &session] {
            if let Err(e) = result {
                warn!("Error while stopping transceiver: {}", e);
            }
        }
        info!("Transceiver stopped");
        advertiser.and(browser).and(session)
    }

    /// Route a found peer to the browser
    pub async fn handle_found(
        &mut self,
        peer: PeerIdentity,
        info: Option<DiscoveryInfo>,
    ) -> PeerKitResult<bool> {
        self.browser.handle_found(peer, info, &mut self.session).await
    }

    pub fn handle_lost(&mut self, peer: &PeerIdentity) -> bool {
        self.browser.handle_lost(peer)
    }

    /// Route an invitation to the advertiser
    pub async fn handle_invitation(
        &mut self,
        from: &PeerIdentity,
        context: Option<&[u8]>,
    ) -> PeerKitResult<bool> {
        self.advertiser.handle_invitation(from, context).await
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn service(&self) -> Option<&ServiceId> {
        self.service.as_ref()
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionManager {
        &mut self.session
    }

    pub fn advertiser(&self) -> &Advertiser {
        &self.advertiser
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerkit_core::{AcceptAll, InviteAll};
    use peerkit_harness::LoopbackNetwork;
    use tokio::sync::watch;

    fn transceiver(network: &LoopbackNetwork) -> Transceiver {
        let (tx, _rx) = watch::channel(Vec::new());
        Transceiver::new(
            network.add_node("local"),
            &SessionConfig::testing(),
            Arc::new(AcceptAll),
            Arc::new(InviteAll),
            tx,
        )
    }

    #[test]
    fn test_role_components() {
        assert!(Role::Both.advertises() && Role::Both.browses());
        assert!(Role::Advertise.advertises() && !Role::Advertise.browses());
        assert!(!Role::Browse.advertises() && Role::Browse.browses());
    }

    #[tokio::test]
    async fn test_narrowing_role_stops_excluded_component() {
        let network = LoopbackNetwork::new();
        let mut transceiver = transceiver(&network);
        let service = ServiceId::new("chat").unwrap();

        transceiver.start(Role::Both, service.clone(), None).await.unwrap();
        assert!(transceiver.advertiser().is_advertising());
        assert!(transceiver.browser().is_browsing());
        assert!(transceiver.session().is_open());

        transceiver.start(Role::Browse, service, None).await.unwrap();
        assert_eq!(transceiver.role(), Some(Role::Browse));
        assert!(!transceiver.advertiser().is_advertising());
        assert!(transceiver.browser().is_browsing());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let network = LoopbackNetwork::new();
        let mut transceiver = transceiver(&network);

        transceiver.stop().await.unwrap();
        transceiver
            .start(Role::Advertise, ServiceId::new("chat").unwrap(), None)
            .await
            .unwrap();
        transceiver.stop().await.unwrap();
        transceiver.stop().await.unwrap();

        assert_eq!(transceiver.role(), None);
        assert!(transceiver.service().is_none());
        assert!(!transceiver.session().is_open());
        assert!(!transceiver.advertiser().is_advertising());
    }
}
