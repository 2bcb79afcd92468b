//! Outbound queue
//!
//! Encoded envelopes are handed to the [`OutboundTask`], which keeps one
//! worker per destination peer. Sends to the same peer go out in the order
//! they were queued; peers never wait on each other, and a failed send is
//! logged without affecting other peers.

use std::collections::HashMap;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use peerkit_core::{PeerId, PeerIdentity, SendMode, TransportProvider};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Requests handled by the outbound task
#[derive(Debug)]
pub enum Outbound {
    /// Deliver `data` to `peer`
    Send { peer: PeerIdentity, data: Arc<[u8]> },
    /// Drop idle per-peer workers (session stopped)
    Reset,
    /// Stop the task
    Shutdown,
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Send counters shared with the dispatcher snapshot
#[derive(Debug, Default)]
pub struct OutboundStats {
    pub sends_completed: AtomicU64,
    pub sends_failed: AtomicU64,
}

impl OutboundStats {
    pub fn sends_completed(&self) -> u64 {
        self.sends_completed.load(Ordering::Relaxed)
    }

    pub fn sends_failed(&self) -> u64 {
        self.sends_failed.load(Ordering::Relaxed)
    }
}

// ----------------------------------------------------------------------------
// Outbound Task
// ----------------------------------------------------------------------------

pub struct OutboundTask {
    receiver: OutboundReceiver,
    transport: Arc<dyn TransportProvider>,
    workers: HashMap<PeerId, mpsc::UnboundedSender<Arc<[u8]>>>,
    stats: Arc<OutboundStats>,
}

impl OutboundTask {
    pub fn new(transport: Arc<dyn TransportProvider>) -> (OutboundSender, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = Self {
            receiver,
            transport,
            workers: HashMap::new(),
            stats: Arc::new(OutboundStats::default()),
        };
        (sender, task)
    }

    pub fn stats(&self) -> Arc<OutboundStats> {
        self.stats.clone()
    }

    pub async fn run(mut self) {
        debug!("Outbound task starting");
        while let Some(message) = self.receiver.recv().await {
            match message {
                Outbound::Send { peer, data } => self.enqueue(peer, data),
                Outbound::Reset => {
                    debug!("Releasing {} outbound workers", self.workers.len());
                    self.workers.clear();
                }
                Outbound::Shutdown => break,
            }
        }
        info!("Outbound task stopped");
    }

    fn enqueue(&mut self, peer: PeerIdentity, data: Arc<[u8]>) {
        let worker = self
            .workers
            .entry(peer.id())
            .or_insert_with(|| Self::spawn_worker(self.transport.clone(), self.stats.clone(), peer.clone()));

        if let Err(mpsc::error::SendError(data)) = worker.send(data) {
            // worker exited; start a fresh one
            let worker = Self::spawn_worker(self.transport.clone(), self.stats.clone(), peer.clone());
            let _ = worker.send(data);
            self.workers.insert(peer.id(), worker);
        }
    }

    fn spawn_worker(
        transport: Arc<dyn TransportProvider>,
        stats: Arc<OutboundStats>,
        peer: PeerIdentity,
    ) -> mpsc::UnboundedSender<Arc<[u8]>> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<[u8]>>();
        tokio::spawn(async move {
            while let Some(data) = receiver.recv().await {
                match transport
                    .send_data(&data, slice::from_ref(&peer), SendMode::Reliable)
                    .await
                {
                    Ok(()) => {
                        stats.sends_completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        stats.sends_failed.fetch_add(1, Ordering::Relaxed);
                        warn!("Send to {} failed: {}", peer, e);
                    }
                }
            }
        });
        sender
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerkit_core::create_transport_event_channel;
    use peerkit_harness::LoopbackNetwork;
    use std::time::Duration;

    #[tokio::test]
    async fn test_failed_peer_does_not_block_others() {
        let network = LoopbackNetwork::new();
        let a = network.add_node("a");
        let b = network.add_node("b");
        let stranger = PeerIdentity::new("stranger");
        let (tx, _rx) = create_transport_event_channel();
        b.attach(tx).unwrap();

        // link a and b through an accepted invitation
        let service = peerkit_core::ServiceId::new("chat").unwrap();
        b.start_advertising(&service, None).await.unwrap();
        a.invite(b.identity(), None, Duration::from_secs(5)).await.unwrap();
        b.respond_to_invitation(a.identity(), true).await.unwrap();

        let (sender, task) = OutboundTask::new(a.clone());
        let stats = task.stats();
        let handle = tokio::spawn(task.run());

        for i in 0..3u8 {
            sender
                .send(Outbound::Send {
                    peer: stranger.clone(),
                    data: Arc::from(vec![i]),
                })
                .unwrap();
            sender
                .send(Outbound::Send {
                    peer: b.identity().clone(),
                    data: Arc::from(vec![i]),
                })
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while stats.sends_completed() + stats.sends_failed() < 6 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let delivered: Vec<u8> = network
            .sent_between(a.identity(), b.identity())
            .into_iter()
            .map(|record| record.data[0])
            .collect();
        assert_eq!(delivered, vec![0, 1, 2]);
        assert_eq!(stats.sends_failed(), 3);

        sender.send(Outbound::Shutdown).unwrap();
        handle.await.unwrap();
    }
}
