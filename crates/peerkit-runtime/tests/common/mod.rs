//! Shared setup for runtime integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use peerkit_harness::{LoopbackNetwork, LoopbackTransport};
use peerkit_runtime::{PeerKit, PeerKitBuilder, SessionConfig};
use tokio::time::{sleep, timeout, Duration};

pub const SERVICE: &str = "chat";

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// One node: the runtime handle plus its loopback transport
pub struct Node {
    pub kit: PeerKit,
    pub transport: Arc<LoopbackTransport>,
}

pub fn node(network: &LoopbackNetwork, name: &str) -> Node {
    let transport = network.add_node(name);
    let kit = PeerKitBuilder::new(transport.clone())
        .with_config(SessionConfig::testing())
        .build()
        .expect("Failed to build PeerKit");
    Node { kit, transport }
}

/// Wait until `kit` sees exactly `count` connected peers
pub async fn wait_for_peers(kit: &PeerKit, count: usize) {
    let mut peers = kit.watch_connected_peers();
    timeout(Duration::from_secs(2), peers.wait_for(|p| p.len() == count))
        .await
        .expect("Timed out waiting for connected peers")
        .expect("Runtime dropped the connected-peer view");
}

/// Poll `condition` until it holds
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition not met in time");
}

/// Round-trip through the dispatcher so every earlier command has been applied
pub async fn settle(kit: &PeerKit) {
    kit.snapshot().await.expect("Dispatcher unavailable");
}

/// A host advertising and `guests` browsing, all connected
pub async fn star(network: &LoopbackNetwork, guests: &[&str]) -> (Node, Vec<Node>) {
    let host = node(network, "host");
    host.kit.advertise(SERVICE, None).await.unwrap();

    let mut joined = Vec::new();
    for name in guests {
        let guest = node(network, name);
        guest.kit.browse(SERVICE).await.unwrap();
        wait_for_peers(&guest.kit, 1).await;
        joined.push(guest);
    }
    wait_for_peers(&host.kit, guests.len()).await;
    (host, joined)
}
