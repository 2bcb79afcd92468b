//! Advertiser
//!
//! Announces the local peer under a service identifier and answers
//! incoming invitations through the configured [`InvitationPolicy`].

use std::sync::Arc;

use peerkit_core::{
    DiscoveryInfo, InvitationPolicy, PeerIdentity, PeerKitResult, ServiceId, TransportProvider,
};
use tracing::{debug, info};

// ----------------------------------------------------------------------------
// Advertiser
// ----------------------------------------------------------------------------

pub struct Advertiser {
    transport: Arc<dyn TransportProvider>,
    policy: Arc<dyn InvitationPolicy>,
    current: Option<(ServiceId, Option<DiscoveryInfo>)>,
    accepted: u64,
    declined: u64,
}

impl Advertiser {
    pub fn new(transport: Arc<dyn TransportProvider>, policy: Arc<dyn InvitationPolicy>) -> Self {
        Self {
            transport,
            policy,
            current: None,
            accepted: 0,
            declined: 0,
        }
    }

    /// Start advertising, restarting cleanly if already active
    pub async fn start(&mut self, service: ServiceId, info: Option<DiscoveryInfo>) -> PeerKitResult<()> {
        if self.current.is_some() {
            debug!("Advertiser already active, restarting");
            self.stop().await?;
        }
        self.transport
            .start_advertising(&service, info.as_ref())
            .await?;
        info!("Advertising '{}'", service);
        self.current = Some((service, info));
        Ok(())
    }

    /// Stop advertising; safe when never started
    pub async fn stop(&mut self) -> PeerKitResult<()> {
        if let Some((service, _)) = self.current.take() {
            self.transport.stop_advertising().await?;
            info!("Stopped advertising '{}'", service);
        }
        Ok(())
    }

    pub fn is_advertising(&self) -> bool {
        self.current.is_some()
    }

    pub fn service(&self) -> Option<&ServiceId> {
        self.current.as_ref().map(|(service, _)| service)
    }

    /// Answer an invitation; returns whether it was accepted
    pub async fn handle_invitation(
        &mut self,
        from: &PeerIdentity,
        context: Option<&[u8]>,
    ) -> PeerKitResult<bool> {
        let accept = self.is_advertising() && self.policy.should_accept(from, context);
        self.transport.respond_to_invitation(from, accept).await?;
        if accept {
            self.accepted += 1;
            debug!("Accepted invitation from {}", from);
        } else {
            self.declined += 1;
            debug!("Declined invitation from {}", from);
        }
        Ok(accept)
    }

    pub fn invitations_accepted(&self) -> u64 {
        self.accepted
    }

    pub fn invitations_declined(&self) -> u64 {
        self.declined
    }
}
