//! Runtime Builder API
//!
//! [`PeerKitBuilder`] wires a transport, configuration and policies into a
//! running dispatcher, and hands back a cloneable [`PeerKit`] handle through
//! which applications drive the session.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use peerkit_core::{
    create_transport_event_channel, AcceptAll, DiscoveryInfo, DiscoveryPolicy, EnvelopeError,
    EventEnvelope, EventPayload, InvitationPolicy, InviteAll, Payload, PeerIdentity,
    PeerKitError, PeerKitResult, ResourceTransfer, ServiceId, SessionConfig, TransportProvider,
};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::{
    create_command_channel, Command, CommandSender, DispatcherTask, HandlerId, LifecycleCallback,
    LifecycleSlot, SessionSnapshot,
};
use crate::outbound::{Outbound, OutboundSender, OutboundTask};
use crate::resources::{prepare_transfer, run_transfer, ResourceHandle, ResourceLedger};
use crate::session::ConnectedPeersReceiver;
use crate::transceiver::{Role, Transceiver};

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builder for a PeerKit runtime
pub struct PeerKitBuilder {
    transport: Arc<dyn TransportProvider>,
    config: SessionConfig,
    invitation_policy: Arc<dyn InvitationPolicy>,
    discovery_policy: Arc<dyn DiscoveryPolicy>,
}

impl PeerKitBuilder {
    pub fn new(transport: Arc<dyn TransportProvider>) -> Self {
        Self {
            transport,
            config: SessionConfig::default(),
            invitation_policy: Arc::new(AcceptAll),
            discovery_policy: Arc::new(InviteAll),
        }
    }

    /// Set the session configuration
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Decide which incoming invitations are accepted
    pub fn with_invitation_policy<P: InvitationPolicy + 'static>(mut self, policy: P) -> Self {
        self.invitation_policy = Arc::new(policy);
        self
    }

    /// Decide which discovered peers are invited
    pub fn with_discovery_policy<P: DiscoveryPolicy + 'static>(mut self, policy: P) -> Self {
        self.discovery_policy = Arc::new(policy);
        self
    }

    /// Attach to the transport and spawn the runtime tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> PeerKitResult<PeerKit> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            PeerKitError::config_error("PeerKit must be built from within a Tokio runtime")
        })?;

        let local = self.transport.local_peer();
        info!("Building PeerKit runtime for {}", local);

        let (event_sender, event_receiver) = create_transport_event_channel();
        self.transport.attach(event_sender)?;

        let (command_sender, command_receiver) = create_command_channel();
        let (connected_tx, connected_rx) = watch::channel(Vec::new());
        let (outbound_sender, outbound_task) = OutboundTask::new(self.transport.clone());

        let transceiver = Transceiver::new(
            self.transport.clone(),
            &self.config,
            self.invitation_policy,
            self.discovery_policy,
            connected_tx,
        );
        let dispatcher = DispatcherTask::new(
            local.clone(),
            transceiver,
            ResourceLedger::new(self.config.transfer_history_limit),
            command_receiver,
            event_receiver,
            outbound_sender.clone(),
            outbound_task.stats(),
            self.config.max_envelope_size,
        );

        let dispatcher_handle = runtime.spawn(dispatcher.run());
        let outbound_handle = runtime.spawn(outbound_task.run());

        info!("PeerKit runtime started");

        Ok(PeerKit {
            shared: Arc::new(Shared {
                local,
                config: self.config,
                transport: self.transport,
                commands: command_sender,
                outbound: outbound_sender,
                connected: connected_rx,
                runtime,
                next_handler: AtomicU64::new(1),
                tasks: Mutex::new(TaskHandles {
                    dispatcher: Some(dispatcher_handle),
                    outbound: Some(outbound_handle),
                }),
            }),
        })
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

struct TaskHandles {
    dispatcher: Option<JoinHandle<PeerKitResult<()>>>,
    outbound: Option<JoinHandle<()>>,
}

struct Shared {
    local: PeerIdentity,
    config: SessionConfig,
    transport: Arc<dyn TransportProvider>,
    commands: CommandSender,
    outbound: OutboundSender,
    connected: ConnectedPeersReceiver,
    runtime: Handle,
    next_handler: AtomicU64,
    tasks: Mutex<TaskHandles>,
}

/// Handle to a running PeerKit session.
///
/// Cheap to clone. Every operation is forwarded to the dispatcher task, so
/// the handle may be used from any thread and from inside callbacks.
#[derive(Clone)]
pub struct PeerKit {
    shared: Arc<Shared>,
}

impl PeerKit {
    pub fn builder(transport: Arc<dyn TransportProvider>) -> PeerKitBuilder {
        PeerKitBuilder::new(transport)
    }

    pub fn local_peer(&self) -> &PeerIdentity {
        &self.shared.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    fn command(&self, command: Command) -> PeerKitResult<()> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| PeerKitError::channel_error("dispatcher has shut down"))
    }

    // ------------------------------------------------------------------------
    // Transceiver Roles
    // ------------------------------------------------------------------------

    /// Advertise and browse for `service` at the same time
    pub async fn transceive(&self, service: &str, info: Option<DiscoveryInfo>) -> PeerKitResult<()> {
        self.start(Role::Both, service, info).await
    }

    /// Only advertise `service`; accepted invitations join the session
    pub async fn advertise(&self, service: &str, info: Option<DiscoveryInfo>) -> PeerKitResult<()> {
        self.start(Role::Advertise, service, info).await
    }

    /// Only browse for `service`; found peers are invited
    pub async fn browse(&self, service: &str) -> PeerKitResult<()> {
        self.start(Role::Browse, service, None).await
    }

    async fn start(&self, role: Role, service: &str, info: Option<DiscoveryInfo>) -> PeerKitResult<()> {
        let service = ServiceId::new(service)?;
        let (reply, response) = oneshot::channel();
        self.command(Command::Start {
            role,
            service,
            info,
            reply,
        })?;
        response
            .await
            .map_err(|_| PeerKitError::channel_error("dispatcher dropped start request"))?
    }

    /// Stop advertising and browsing and leave the session.
    ///
    /// Idempotent. In-flight resource transfers are cancelled; handlers stay
    /// registered.
    pub fn stop_transceiving(&self) -> PeerKitResult<()> {
        self.command(Command::Stop)
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    fn resolve_targets(&self, peers: Option<&[PeerIdentity]>) -> Vec<PeerIdentity> {
        match peers {
            Some(peers) => peers.to_vec(),
            None => self.shared.connected.borrow().clone(),
        }
    }

    /// Send a named event to `peers`, or to every connected peer.
    ///
    /// Returns the number of peers the event was queued for; zero targets is
    /// a successful no-op.
    pub fn send_event(
        &self,
        event: &str,
        payload: Option<Payload>,
        peers: Option<&[PeerIdentity]>,
    ) -> PeerKitResult<usize> {
        let envelope = EventEnvelope::new(event, payload)?;
        let data: Arc<[u8]> = envelope
            .encode_with_limit(self.shared.config.max_envelope_size)?
            .into();

        let targets = self.resolve_targets(peers);
        if targets.is_empty() {
            debug!("No peers to send '{}' to", event);
            return Ok(0);
        }

        for peer in &targets {
            self.shared
                .outbound
                .send(Outbound::Send {
                    peer: peer.clone(),
                    data: data.clone(),
                })
                .map_err(|_| PeerKitError::channel_error("outbound queue closed"))?;
        }
        debug!("Queued '{}' ({} bytes) for {} peers", event, data.len(), targets.len());
        Ok(targets.len())
    }

    /// Send an application struct as a typed payload
    pub fn send_typed<T: EventPayload>(
        &self,
        event: &str,
        value: &T,
        peers: Option<&[PeerIdentity]>,
    ) -> PeerKitResult<usize> {
        self.send_event(event, Some(Payload::typed(value)?), peers)
    }

    /// Send the file at `path` to `peers`, or to every connected peer.
    ///
    /// Each peer gets an independent transfer; `on_complete` runs once per
    /// peer on the dispatcher task. Returns one handle per peer in target
    /// order.
    pub fn send_resource<P, F>(
        &self,
        path: P,
        name: &str,
        peers: Option<&[PeerIdentity]>,
        on_complete: F,
    ) -> PeerKitResult<Vec<ResourceHandle>>
    where
        P: AsRef<Path>,
        F: FnMut(&ResourceTransfer) + Send + 'static,
    {
        let targets = self.resolve_targets(peers);
        if targets.is_empty() {
            debug!("No peers to send resource '{}' to", name);
            return Ok(Vec::new());
        }

        let path = path.as_ref().to_path_buf();
        let mut transfers = Vec::with_capacity(targets.len());
        let mut handles = Vec::with_capacity(targets.len());
        let mut jobs = Vec::with_capacity(targets.len());
        for peer in targets {
            let (tracked, handle, job) = prepare_transfer(path.clone(), name, peer);
            transfers.push(tracked);
            handles.push(handle);
            jobs.push(job);
        }

        // the ledger must know every transfer before any of them can finish
        self.command(Command::TrackResources {
            transfers,
            on_complete: Box::new(on_complete),
        })?;
        for job in jobs {
            self.shared.runtime.spawn(run_transfer(
                self.shared.transport.clone(),
                job,
                self.shared.commands.clone(),
            ));
        }

        info!("Sending resource '{}' to {} peers", name, handles.len());
        Ok(handles)
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Called when a peer starts joining: `(local, peer)`
    pub fn on_connecting<F>(&self, callback: F) -> PeerKitResult<()>
    where
        F: FnMut(&PeerIdentity, &PeerIdentity) + Send + 'static,
    {
        self.command(Command::SetLifecycle(LifecycleCallback::Connecting(
            Box::new(callback),
        )))
    }

    /// Called when a peer joined: `(local, peer)`
    pub fn on_connect<F>(&self, callback: F) -> PeerKitResult<()>
    where
        F: FnMut(&PeerIdentity, &PeerIdentity) + Send + 'static,
    {
        self.command(Command::SetLifecycle(LifecycleCallback::Connected(Box::new(
            callback,
        ))))
    }

    /// Called when a peer left or failed to join: `(local, peer)`
    pub fn on_disconnect<F>(&self, callback: F) -> PeerKitResult<()>
    where
        F: FnMut(&PeerIdentity, &PeerIdentity) + Send + 'static,
    {
        self.command(Command::SetLifecycle(LifecycleCallback::Disconnected(
            Box::new(callback),
        )))
    }

    /// Called for every received event before named handlers
    pub fn on_general_event<F>(&self, callback: F) -> PeerKitResult<()>
    where
        F: FnMut(&PeerIdentity, &str, Option<&Payload>) + Send + 'static,
    {
        self.command(Command::SetLifecycle(LifecycleCallback::General(Box::new(
            callback,
        ))))
    }

    /// Called when an incoming resource finished: `(local, name, sender, location)`
    pub fn on_resource_finished<F>(&self, callback: F) -> PeerKitResult<()>
    where
        F: FnMut(&PeerIdentity, &str, &PeerIdentity, &Path) + Send + 'static,
    {
        self.command(Command::SetLifecycle(LifecycleCallback::ResourceFinished(
            Box::new(callback),
        )))
    }

    /// Called for received events that no named handler is registered for
    pub fn on_unhandled<F>(&self, callback: F) -> PeerKitResult<()>
    where
        F: FnMut(&PeerIdentity, &EventEnvelope) + Send + 'static,
    {
        self.command(Command::SetLifecycle(LifecycleCallback::Unhandled(
            Box::new(callback),
        )))
    }

    pub fn clear_lifecycle(&self, slot: LifecycleSlot) -> PeerKitResult<()> {
        self.command(Command::ClearLifecycle(slot))
    }

    /// Register a handler for `event`. Handlers for the same name run in
    /// registration order.
    pub fn on<F>(&self, event: &str, handler: F) -> PeerKitResult<HandlerId>
    where
        F: FnMut(&PeerIdentity, Option<&Payload>) + Send + 'static,
    {
        if event.is_empty() {
            return Err(EnvelopeError::EmptyEventName.into());
        }
        let id = HandlerId(self.shared.next_handler.fetch_add(1, Ordering::Relaxed));
        self.command(Command::Register {
            id,
            event: event.to_string(),
            handler: Box::new(handler),
        })?;
        Ok(id)
    }

    /// Register a handler receiving `T` decoded from a typed payload.
    ///
    /// Envelopes without a payload, or with a payload of another schema, are
    /// logged and skipped.
    pub fn on_typed<T, F>(&self, event: &str, mut handler: F) -> PeerKitResult<HandlerId>
    where
        T: EventPayload + 'static,
        F: FnMut(&PeerIdentity, T) + Send + 'static,
    {
        let event_name = event.to_string();
        self.on(event, move |from: &PeerIdentity, payload: Option<&Payload>| {
            match payload.map(Payload::decode::<T>) {
                Some(Ok(value)) => handler(from, value),
                Some(Err(e)) => warn!("Skipping '{}' from {}: {}", event_name, from, e),
                None => warn!("Skipping '{}' from {}: no payload", event_name, from),
            }
        })
    }

    /// Remove every handler for `event`
    pub fn off(&self, event: &str) -> PeerKitResult<()> {
        self.command(Command::UnregisterEvent(event.to_string()))
    }

    /// Remove one handler
    pub fn unregister(&self, id: HandlerId) -> PeerKitResult<()> {
        self.command(Command::Unregister(id))
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Peers currently connected, in the order they joined
    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.shared.connected.borrow().clone()
    }

    /// Subscribe to changes of the connected-peer view
    pub fn watch_connected_peers(&self) -> ConnectedPeersReceiver {
        self.shared.connected.clone()
    }

    pub async fn snapshot(&self) -> PeerKitResult<SessionSnapshot> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Snapshot(reply))?;
        response
            .await
            .map_err(|_| PeerKitError::channel_error("dispatcher dropped snapshot request"))
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop the session and the runtime tasks.
    ///
    /// Waits up to `shutdown_timeout` for each task. Later calls, from any
    /// clone, return immediately.
    pub async fn shutdown(&self) -> PeerKitResult<()> {
        let (dispatcher, outbound) = {
            let mut tasks = self
                .shared
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            (tasks.dispatcher.take(), tasks.outbound.take())
        };
        let Some(dispatcher) = dispatcher else {
            debug!("PeerKit runtime already shut down");
            return Ok(());
        };

        info!("Shutting down PeerKit runtime");
        let _ = self.shared.commands.send(Command::Shutdown);
        let timeout = self.shared.config.shutdown_timeout;

        let abort = dispatcher.abort_handle();
        let result = match tokio::time::timeout(timeout, dispatcher).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(PeerKitError::channel_error(format!(
                "dispatcher task failed: {}",
                e
            ))),
            Err(_) => {
                warn!("Dispatcher did not stop within {:?}, aborting", timeout);
                abort.abort();
                Ok(())
            }
        };

        if let Some(outbound) = outbound {
            let abort = outbound.abort_handle();
            if tokio::time::timeout(timeout, outbound).await.is_err() {
                warn!("Outbound task did not stop within {:?}, aborting", timeout);
                abort.abort();
            }
        }

        info!("PeerKit runtime shut down");
        result
    }
}
