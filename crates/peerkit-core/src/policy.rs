//! Invitation and discovery policies
//!
//! The advertiser consults an [`InvitationPolicy`] for every incoming
//! invitation and the browser consults a [`DiscoveryPolicy`] for every peer
//! it finds. Both default to the permissive behaviour (accept everything,
//! invite everyone); applications that need to restrict who joins the
//! session plug in their own predicate.

use crate::types::{DiscoveryInfo, PeerIdentity};

/// Decides whether an incoming invitation is accepted
pub trait InvitationPolicy: Send + Sync {
    fn should_accept(&self, from: &PeerIdentity, context: Option<&[u8]>) -> bool;
}

/// Decides whether a discovered peer is invited into the session
pub trait DiscoveryPolicy: Send + Sync {
    fn should_invite(&self, peer: &PeerIdentity, info: Option<&DiscoveryInfo>) -> bool;
}

/// Accepts every invitation
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl InvitationPolicy for AcceptAll {
    fn should_accept(&self, _from: &PeerIdentity, _context: Option<&[u8]>) -> bool {
        true
    }
}

/// Invites every discovered peer
#[derive(Debug, Clone, Copy, Default)]
pub struct InviteAll;

impl DiscoveryPolicy for InviteAll {
    fn should_invite(&self, _peer: &PeerIdentity, _info: Option<&DiscoveryInfo>) -> bool {
        true
    }
}

impl<F> InvitationPolicy for F
where
    F: Fn(&PeerIdentity, Option<&[u8]>) -> bool + Send + Sync,
{
    fn should_accept(&self, from: &PeerIdentity, context: Option<&[u8]>) -> bool {
        self(from, context)
    }
}

impl<F> DiscoveryPolicy for F
where
    F: Fn(&PeerIdentity, Option<&DiscoveryInfo>) -> bool + Send + Sync,
{
    fn should_invite(&self, peer: &PeerIdentity, info: Option<&DiscoveryInfo>) -> bool {
        self(peer, info)
    }
}
