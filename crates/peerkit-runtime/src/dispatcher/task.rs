//! Dispatcher Task Implementation
//!
//! Contains the DispatcherTask struct, its command/event loop and the
//! snapshot types it reports.

use std::sync::Arc;

use peerkit_core::{
    ConnectionEvent, ConnectionState, EventEnvelope, PeerIdentity, PeerKitError, PeerKitResult,
    ResourceTransfer, ServiceId, StateTransition, TransportEvent, TransportEventReceiver,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{Command, CommandReceiver, HandlerRegistry};
use crate::outbound::{Outbound, OutboundSender, OutboundStats};
use crate::resources::ResourceLedger;
use crate::session::Transitions;
use crate::transceiver::{Role, Transceiver};

// ----------------------------------------------------------------------------
// Statistics and Snapshot
// ----------------------------------------------------------------------------

/// Counters collected by the dispatcher and its components
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub commands_processed: u64,
    pub events_processed: u64,
    /// Transport events dropped because the transceiver was stopped
    pub events_ignored: u64,
    pub envelopes_dispatched: u64,
    pub unhandled_envelopes: u64,
    pub decode_failures: u64,
    pub rejected_transitions: u64,
    pub invitations_sent: u64,
    pub invitations_accepted: u64,
    pub invitations_declined: u64,
    pub sends_completed: u64,
    pub sends_failed: u64,
    pub transfers_succeeded: u64,
    pub transfers_failed: u64,
}

/// Point-in-time view of the runtime
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub local: PeerIdentity,
    pub role: Option<Role>,
    pub service: Option<ServiceId>,
    /// Every known peer with its state, sorted by display name
    pub peers: Vec<(PeerIdentity, ConnectionState)>,
    /// Connected peers in the order they joined
    pub connected: Vec<PeerIdentity>,
    pub discovered: Vec<PeerIdentity>,
    pub audit_trail: Vec<StateTransition>,
    pub handler_count: usize,
    pub pending_transfers: usize,
    /// Finished transfers, oldest first
    pub completed_transfers: Vec<ResourceTransfer>,
    pub stats: RuntimeStats,
}

impl SessionSnapshot {
    pub fn state_of(&self, peer: &PeerIdentity) -> Option<ConnectionState> {
        self.peers
            .iter()
            .find(|(p, _)| p == peer)
            .map(|(_, state)| *state)
    }
}

// ----------------------------------------------------------------------------
// Dispatcher Task
// ----------------------------------------------------------------------------

/// The single consumer that owns all mutable runtime state
pub struct DispatcherTask {
    local: PeerIdentity,
    transceiver: Transceiver,
    registry: HandlerRegistry,
    resources: ResourceLedger,
    commands: CommandReceiver,
    events: TransportEventReceiver,
    outbound: OutboundSender,
    outbound_stats: Arc<OutboundStats>,
    max_envelope_size: usize,
    stats: RuntimeStats,
    events_open: bool,
    running: bool,
}

impl DispatcherTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: PeerIdentity,
        transceiver: Transceiver,
        resources: ResourceLedger,
        commands: CommandReceiver,
        events: TransportEventReceiver,
        outbound: OutboundSender,
        outbound_stats: Arc<OutboundStats>,
        max_envelope_size: usize,
    ) -> Self {
        Self {
            local,
            transceiver,
            registry: HandlerRegistry::new(),
            resources,
            commands,
            events,
            outbound,
            outbound_stats,
            max_envelope_size,
            stats: RuntimeStats::default(),
            events_open: true,
            running: true,
        }
    }

    /// Run the command/event loop until shutdown or until every handle is gone
    pub async fn run(mut self) -> PeerKitResult<()> {
        info!("Dispatcher task starting for {}", self.local);

        while self.running {
            // Commands first: a handler registered before an event arrives sees it
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            let kind = command.kind();
                            if let Err(e) = self.process_command(command).await {
                                match e {
                                    PeerKitError::Channel { .. } => {
                                        error!("Unrecoverable error processing {}, shutting down dispatcher: {}", kind, e);
                                        break;
                                    }
                                    _ => warn!("Error processing {}: {}", kind, e),
                                }
                            }
                        }
                        None => {
                            info!("Command channel closed, shutting down");
                            break;
                        }
                    }
                }

                event = self.events.recv(), if self.events_open => {
                    match event {
                        Some(event) => {
                            let kind = event.kind();
                            if let Err(e) = self.process_event(event).await {
                                warn!("Error processing transport {}: {}", kind, e);
                            }
                        }
                        None => {
                            info!("Transport event channel closed");
                            self.events_open = false;
                        }
                    }
                }
            }
        }

        self.finish().await;
        info!("Dispatcher task stopped");
        Ok(())
    }

    /// Tear down everything the dispatcher owns
    async fn finish(&mut self) {
        if let Err(e) = self.transceiver.stop().await {
            warn!("Error stopping transceiver during shutdown: {}", e);
        }
        self.resources.abort_all();
        let _ = self.outbound.send(Outbound::Shutdown);
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn process_command(&mut self, command: Command) -> PeerKitResult<()> {
        self.stats.commands_processed += 1;

        match command {
            Command::Start {
                role,
                service,
                info,
                reply,
            } => {
                let result = self.transceiver.start(role, service, info).await;
                if let Err(e) = &result {
                    warn!("Failed to start transceiving as {:?}: {}", role, e);
                }
                let _ = reply.send(result);
            }
            Command::Stop => {
                self.resources.cancel_all();
                let result = self.transceiver.stop().await;
                // Everything still queued belongs to the old session and is dropped,
                // including data and finished resources that arrived before the stop.
                while let Ok(event) = self.events.try_recv() {
                    self.stats.events_ignored += 1;
                    debug!("Discarding transport {} queued before stop", event.kind());
                }
                self.outbound
                    .send(Outbound::Reset)
                    .map_err(|_| PeerKitError::channel_error("outbound queue closed"))?;
                result?;
            }
            Command::Shutdown => {
                info!("Shutdown requested");
                self.running = false;
            }
            Command::SetLifecycle(callback) => {
                debug!("Setting {:?} callback", callback.slot());
                self.registry.set_lifecycle(callback);
            }
            Command::ClearLifecycle(slot) => {
                self.registry.clear_lifecycle(slot);
            }
            Command::Register { id, event, handler } => {
                debug!("Registering handler {:?} for '{}'", id, event);
                self.registry.register(id, event, handler);
            }
            Command::Unregister(id) => {
                if !self.registry.unregister(id) {
                    debug!("Handler {:?} was not registered", id);
                }
            }
            Command::UnregisterEvent(event) => {
                let removed = self.registry.unregister_event(&event);
                debug!("Removed {} handlers for '{}'", removed, event);
            }
            Command::TrackResources {
                transfers,
                on_complete,
            } => {
                self.resources.track(transfers, on_complete);
            }
            Command::ResourceCompleted { id, state } => {
                if let Some(record) = self.resources.complete(id, state) {
                    debug!(
                        "Resource '{}' to {} finished: {:?}",
                        record.name(),
                        record.peer(),
                        record.state()
                    );
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transport Events
    // ------------------------------------------------------------------------

    async fn process_event(&mut self, event: TransportEvent) -> PeerKitResult<()> {
        if self.transceiver.role().is_none() {
            self.stats.events_ignored += 1;
            debug!("Transceiver stopped, ignoring transport {}", event.kind());
            return Ok(());
        }
        self.stats.events_processed += 1;

        match event {
            TransportEvent::FoundPeer { peer, info } => {
                self.transceiver.handle_found(peer, info).await?;
            }
            TransportEvent::LostPeer { peer } => {
                self.transceiver.handle_lost(&peer);
            }
            TransportEvent::Invitation { from, context } => {
                self.transceiver
                    .handle_invitation(&from, context.as_deref())
                    .await?;
            }
            TransportEvent::Connecting { peer } => {
                self.apply_lifecycle(&peer, ConnectionEvent::Connecting);
            }
            TransportEvent::Connected { peer } => {
                self.apply_lifecycle(&peer, ConnectionEvent::Connected);
            }
            TransportEvent::Disconnected { peer } => {
                self.apply_lifecycle(&peer, ConnectionEvent::Disconnected);
            }
            TransportEvent::ReceivedData { from, data } => {
                self.dispatch_data(&from, &data);
            }
            TransportEvent::ReceivedResourceFinished {
                from,
                name,
                location,
            } => {
                debug!("Received resource '{}' from {}", name, from);
                self.registry
                    .notify_resource_finished(&self.local, &name, &from, &location);
            }
            TransportEvent::DiscoveryFailed { role, reason } => {
                warn!("{:?} failed to start: {}", role, reason);
            }
        }
        Ok(())
    }

    /// Update the session, then surface each state change to the app
    fn apply_lifecycle(&mut self, peer: &PeerIdentity, event: ConnectionEvent) {
        let transitions: Transitions = self.transceiver.session_mut().apply(peer, event);
        for transition in transitions {
            match transition.to {
                ConnectionState::Connecting => self.registry.notify_connecting(&self.local, peer),
                ConnectionState::Connected => self.registry.notify_connected(&self.local, peer),
                ConnectionState::Disconnected => {
                    self.registry.notify_disconnected(&self.local, peer)
                }
                ConnectionState::Discovering => {}
            }
        }
    }

    fn dispatch_data(&mut self, from: &PeerIdentity, data: &[u8]) {
        let envelope = match EventEnvelope::decode_with_limit(data, self.max_envelope_size) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.decode_failures += 1;
                warn!("Dropping undecodable data from {}: {}", from, e);
                return;
            }
        };

        let outcome = self.registry.dispatch(from, &envelope);
        self.stats.envelopes_dispatched += 1;
        if outcome.named == 0 {
            self.stats.unhandled_envelopes += 1;
        }
    }

    // ------------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------------

    fn snapshot(&self) -> SessionSnapshot {
        let session = self.transceiver.session();

        let mut peers: Vec<_> = session
            .peers()
            .map(|(identity, state)| (identity.clone(), state))
            .collect();
        peers.sort_by(|(a, _), (b, _)| {
            a.display_name()
                .cmp(b.display_name())
                .then_with(|| a.id().cmp(&b.id()))
        });

        let mut discovered: Vec<_> = self
            .transceiver
            .browser()
            .discovered()
            .map(|peer| peer.identity.clone())
            .collect();
        discovered.sort_by(|a, b| a.display_name().cmp(b.display_name()));

        let mut stats = self.stats.clone();
        stats.rejected_transitions = session.rejected_transitions();
        stats.invitations_sent = self.transceiver.browser().invitations_sent();
        stats.invitations_accepted = self.transceiver.advertiser().invitations_accepted();
        stats.invitations_declined = self.transceiver.advertiser().invitations_declined();
        stats.sends_completed = self.outbound_stats.sends_completed();
        stats.sends_failed = self.outbound_stats.sends_failed();
        stats.transfers_succeeded = self.resources.succeeded();
        stats.transfers_failed = self.resources.failed();

        SessionSnapshot {
            local: self.local.clone(),
            role: self.transceiver.role(),
            service: self.transceiver.service().cloned(),
            peers,
            connected: session.connected_peers().to_vec(),
            discovered,
            audit_trail: session.audit_trail().iter().copied().collect(),
            handler_count: self.registry.handler_count(),
            pending_transfers: self.resources.pending_count(),
            completed_transfers: self.resources.history().iter().cloned().collect(),
            stats,
        }
    }
}
