//! Basic PeerKit usage
//!
//! Two nodes on an in-memory loopback network join a "demo-chat" session,
//! trade a typed greeting and a plain text event, then shut down.
//!
//! Run with: cargo run -p peerkit-runtime --example basic_usage

use std::time::Duration;

use anyhow::{Context, Result};
use peerkit_harness::LoopbackNetwork;
use peerkit_runtime::{
    DiscoveryInfo, EventPayload, Payload, PeerIdentity, PeerKitBuilder, SessionConfig,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    nickname: String,
    mood: String,
}

impl EventPayload for Greeting {
    const SCHEMA: &'static str = "demo.greeting.v1";
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let network = LoopbackNetwork::new();
    let config = SessionConfig::new().with_invite_timeout(Duration::from_secs(5));

    let host = PeerKitBuilder::new(network.add_node("host"))
        .with_config(config.clone())
        .build()?;
    let guest = PeerKitBuilder::new(network.add_node("guest"))
        .with_config(config)
        .build()?;

    host.on_connect(|local: &PeerIdentity, peer: &PeerIdentity| {
        info!("{} sees {} join", local, peer);
    })?;
    host.on_typed("greeting", |from: &PeerIdentity, greeting: Greeting| {
        info!("{} says hi as '{}' ({})", from, greeting.nickname, greeting.mood);
    })?;
    host.on("chat", |from: &PeerIdentity, payload: Option<&Payload>| {
        let text = payload.and_then(Payload::as_text).unwrap_or("<empty>");
        info!("{}: {}", from, text);
    })?;

    let info = DiscoveryInfo::new().with("room", "lobby")?;
    host.advertise("demo-chat", Some(info)).await?;
    guest.browse("demo-chat").await?;

    let mut peers = guest.watch_connected_peers();
    tokio::time::timeout(Duration::from_secs(2), peers.wait_for(|p| !p.is_empty()))
        .await
        .context("guest never joined the session")??;

    guest.send_typed(
        "greeting",
        &Greeting {
            nickname: "guest".into(),
            mood: "curious".into(),
        },
        None,
    )?;
    guest.send_event("chat", Some("hello from the loopback network".into()), None)?;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = host.snapshot().await?;
    info!(
        "host handled {} events from {} peers",
        snapshot.stats.envelopes_dispatched,
        snapshot.connected.len()
    );

    guest.shutdown().await?;
    host.shutdown().await?;
    Ok(())
}
