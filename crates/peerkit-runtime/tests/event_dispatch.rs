//! Integration tests for named events: sending, decoding and handler routing

mod common;

use common::*;
use peerkit_core::TransportEvent;
use peerkit_harness::LoopbackNetwork;
use peerkit_runtime::{EventEnvelope, EventPayload, LifecycleSlot, Payload, PeerIdentity};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChatMessage {
    author: String,
    text: String,
}

impl EventPayload for ChatMessage {
    const SCHEMA: &'static str = "chat.message.v1";
}

fn text_of(payload: Option<&Payload>) -> String {
    payload.and_then(Payload::as_text).unwrap_or("-").to_string()
}

#[tokio::test]
async fn test_hello_world_reaches_general_then_named_handler() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (host, guests) = star(&network, &["guest"]).await;
    let guest = &guests[0];

    let log = new_log();
    let general = log.clone();
    host.kit
        .on_general_event(move |from: &PeerIdentity, name: &str, payload: Option<&Payload>| {
            general.lock().unwrap().push(format!(
                "general:{}:{}:{}",
                from.display_name(),
                name,
                text_of(payload)
            ));
        })
        .unwrap();
    let named = log.clone();
    host.kit
        .on("hello", move |from: &PeerIdentity, payload: Option<&Payload>| {
            named
                .lock()
                .unwrap()
                .push(format!("hello:{}:{}", from.display_name(), text_of(payload)));
        })
        .unwrap();
    settle(&host.kit).await;

    let sent = guest
        .kit
        .send_event("hello", Some(Payload::from("world")), None)
        .unwrap();
    assert_eq!(sent, 1);

    eventually(|| entries(&log).len() >= 2).await;
    sleep(Duration::from_millis(20)).await;
    assert_eq!(
        entries(&log),
        vec!["general:guest:hello:world", "hello:guest:world"]
    );

    let snapshot = host.kit.snapshot().await.unwrap();
    assert_eq!(snapshot.stats.envelopes_dispatched, 1);
    assert_eq!(snapshot.stats.unhandled_envelopes, 0);

    host.kit.shutdown().await.unwrap();
    guest.kit.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_send_without_peers_is_a_noop() {
    let network = LoopbackNetwork::new();
    let lonely = node(&network, "lonely");
    lonely.kit.transceive(SERVICE, None).await.unwrap();

    assert_eq!(lonely.kit.send_event("ping", None, None).unwrap(), 0);
    assert_eq!(lonely.kit.send_event("ping", None, Some(&[])).unwrap(), 0);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(network.stats().data_sends(), 0);

    lonely.kit.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_send_to_explicit_subset() {
    let network = LoopbackNetwork::new();
    let (host, guests) = star(&network, &["left", "right"]).await;

    let log = new_log();
    for guest in &guests {
        let log = log.clone();
        guest
            .kit
            .on("whisper", move |_: &PeerIdentity, payload: Option<&Payload>| {
                log.lock().unwrap().push(text_of(payload));
            })
            .unwrap();
        settle(&guest.kit).await;
    }

    let only_right = [guests[1].transport.identity().clone()];
    let sent = host
        .kit
        .send_event("whisper", Some("psst".into()), Some(&only_right))
        .unwrap();
    assert_eq!(sent, 1);

    eventually(|| entries(&log).len() == 1).await;
    sleep(Duration::from_millis(20)).await;
    assert_eq!(entries(&log), vec!["psst"]);
    assert!(network
        .sent_between(host.transport.identity(), guests[0].transport.identity())
        .is_empty());

    host.kit.shutdown().await.unwrap();
    for guest in guests {
        guest.kit.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_handlers_are_isolated_by_event_name() {
    let network = LoopbackNetwork::new();
    let (host, guests) = star(&network, &["guest"]).await;
    let guest = &guests[0];

    let log = new_log();
    let foo = log.clone();
    host.kit
        .on("foo", move |_: &PeerIdentity, _: Option<&Payload>| {
            foo.lock().unwrap().push("foo".to_string());
        })
        .unwrap();
    let unhandled = log.clone();
    host.kit
        .on_unhandled(move |_: &PeerIdentity, envelope: &EventEnvelope| {
            unhandled
                .lock()
                .unwrap()
                .push(format!("unhandled:{}", envelope.event_name()));
        })
        .unwrap();
    settle(&host.kit).await;

    guest.kit.send_event("bar", None, None).unwrap();
    guest.kit.send_event("foo", None, None).unwrap();
    eventually(|| entries(&log).len() == 2).await;
    assert_eq!(entries(&log), vec!["unhandled:bar", "foo"]);

    // removing the handler routes the name to the unhandled slot
    host.kit.off("foo").unwrap();
    settle(&host.kit).await;
    guest.kit.send_event("foo", None, None).unwrap();
    eventually(|| entries(&log).len() == 3).await;
    assert_eq!(entries(&log)[2], "unhandled:foo");

    // clearing the slot silences it
    host.kit.clear_lifecycle(LifecycleSlot::Unhandled).unwrap();
    settle(&host.kit).await;
    guest.kit.send_event("foo", None, None).unwrap();
    sleep(Duration::from_millis(30)).await;
    assert_eq!(entries(&log).len(), 3);
    assert_eq!(host.kit.snapshot().await.unwrap().stats.unhandled_envelopes, 3);

    host.kit.shutdown().await.unwrap();
    guest.kit.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handlers_for_one_name_run_in_registration_order() {
    let network = LoopbackNetwork::new();
    let (host, guests) = star(&network, &["guest"]).await;
    let guest = &guests[0];

    let log = new_log();
    let mut ids = Vec::new();
    for tag in ["first", "second", "third"] {
        let log = log.clone();
        let id = host
            .kit
            .on("tick", move |_: &PeerIdentity, _: Option<&Payload>| {
                log.lock().unwrap().push(tag.to_string());
            })
            .unwrap();
        ids.push(id);
    }
    host.kit.unregister(ids[1]).unwrap();
    settle(&host.kit).await;
    assert_eq!(host.kit.snapshot().await.unwrap().handler_count, 2);

    guest.kit.send_event("tick", None, None).unwrap();
    eventually(|| entries(&log).len() == 2).await;
    assert_eq!(entries(&log), vec!["first", "third"]);

    host.kit.shutdown().await.unwrap();
    guest.kit.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_typed_payloads() {
    let network = LoopbackNetwork::new();
    let (host, guests) = star(&network, &["guest"]).await;
    let guest = &guests[0];

    let log = new_log();
    let typed = log.clone();
    host.kit
        .on_typed("chat", move |_: &PeerIdentity, message: ChatMessage| {
            typed
                .lock()
                .unwrap()
                .push(format!("{}: {}", message.author, message.text));
        })
        .unwrap();
    settle(&host.kit).await;

    // untyped and missing payloads are skipped by the typed handler
    guest.kit.send_event("chat", Some("raw".into()), None).unwrap();
    guest.kit.send_event("chat", None, None).unwrap();
    let message = ChatMessage {
        author: "guest".into(),
        text: "hi there".into(),
    };
    guest.kit.send_typed("chat", &message, None).unwrap();

    eventually(|| entries(&log).len() == 1).await;
    sleep(Duration::from_millis(20)).await;
    assert_eq!(entries(&log), vec!["guest: hi there"]);

    host.kit.shutdown().await.unwrap();
    guest.kit.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_data_is_counted_and_dropped() {
    let network = LoopbackNetwork::new();
    let host = node(&network, "host");
    host.kit.advertise(SERVICE, None).await.unwrap();

    let log = new_log();
    let general = log.clone();
    host.kit
        .on_general_event(move |_: &PeerIdentity, name: &str, _: Option<&Payload>| {
            general.lock().unwrap().push(name.to_string());
        })
        .unwrap();
    settle(&host.kit).await;

    let stranger = PeerIdentity::new("stranger");
    host.transport.inject(TransportEvent::ReceivedData {
        from: stranger.clone(),
        data: vec![0xff, 0x00, 0x13],
    });
    let valid = EventEnvelope::new("ok", None).unwrap().encode().unwrap();
    host.transport.inject(TransportEvent::ReceivedData {
        from: stranger,
        data: valid,
    });

    eventually(|| entries(&log).len() == 1).await;
    let snapshot = host.kit.snapshot().await.unwrap();
    assert_eq!(snapshot.stats.decode_failures, 1);
    assert_eq!(snapshot.stats.envelopes_dispatched, 1);
    assert_eq!(entries(&log), vec!["ok"]);

    host.kit.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_registration_applies_before_already_queued_data() {
    let network = LoopbackNetwork::new();
    let host = node(&network, "host");
    host.kit.advertise(SERVICE, None).await.unwrap();
    let stranger = PeerIdentity::new("stranger");

    for round in 0..20 {
        let log = new_log();
        let sink = log.clone();
        let event = format!("ping-{}", round);
        let id = host
            .kit
            .on(event.as_str(), move |_: &PeerIdentity, payload: Option<&Payload>| {
                sink.lock().unwrap().push(text_of(payload));
            })
            .unwrap();
        // no settle: the event is queued right behind the registration
        let data = EventEnvelope::new(event, Some("pong".into()))
            .unwrap()
            .encode()
            .unwrap();
        host.transport.inject(TransportEvent::ReceivedData {
            from: stranger.clone(),
            data,
        });

        eventually(|| entries(&log).len() == 1).await;
        host.kit.unregister(id).unwrap();
    }

    let snapshot = host.kit.snapshot().await.unwrap();
    assert_eq!(snapshot.stats.envelopes_dispatched, 20);
    assert_eq!(snapshot.stats.unhandled_envelopes, 0);
    assert_eq!(snapshot.handler_count, 0);

    host.kit.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_leaves_dispatcher_running() {
    let network = LoopbackNetwork::new();
    let (host, guests) = star(&network, &["guest"]).await;
    let guest = &guests[0];

    host.kit
        .on("boom", |_: &PeerIdentity, _: Option<&Payload>| {
            panic!("handler bug");
        })
        .unwrap();
    let log = new_log();
    let sink = log.clone();
    host.kit
        .on("after", move |_: &PeerIdentity, payload: Option<&Payload>| {
            sink.lock().unwrap().push(text_of(payload));
        })
        .unwrap();

    guest.kit.send_event("boom", None, None).unwrap();
    guest.kit.send_event("after", Some("still here".into()), None).unwrap();

    eventually(|| entries(&log).len() == 1).await;
    assert_eq!(entries(&log), vec!["still here"]);
    assert_eq!(host.kit.snapshot().await.unwrap().stats.envelopes_dispatched, 2);

    host.kit.shutdown().await.unwrap();
    guest.kit.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_oversized_event_rejected_before_sending() {
    let network = LoopbackNetwork::new();
    let (host, guests) = star(&network, &["guest"]).await;

    let limit = host.kit.config().max_envelope_size;
    let result = host
        .kit
        .send_event("blob", Some(Payload::Bytes(vec![7; limit])), None);
    assert!(result.is_err());
    sleep(Duration::from_millis(20)).await;
    assert_eq!(network.stats().data_sends(), 0);

    host.kit.shutdown().await.unwrap();
    for guest in guests {
        guest.kit.shutdown().await.unwrap();
    }
}
