//! Property-based tests for the envelope wire format
//!
//! These tests verify that arbitrary payload trees survive the codec and
//! that arbitrary byte strings are rejected without panicking.

use peerkit_core::{EnvelopeError, EventEnvelope, Payload, MAX_PAYLOAD_DEPTH, PROTOCOL_VERSION};
use proptest::prelude::*;

/// Generate arbitrary non-empty event names
fn arb_event_name() -> impl Strategy<Value = String> {
    prop::string::string_regex(r"[a-zA-Z][a-zA-Z0-9_.:-]{0,31}").unwrap()
}

/// Generate arbitrary payload trees
fn arb_payload() -> impl Strategy<Value = Payload> {
    let leaf = prop_oneof![
        any::<bool>().prop_map(Payload::Bool),
        any::<i64>().prop_map(Payload::Int),
        // NaN never equals itself, so keep floats finite
        (-1.0e12f64..1.0e12f64).prop_map(Payload::Float),
        ".{0,64}".prop_map(Payload::Text),
        prop::collection::vec(any::<u8>(), 0..128).prop_map(Payload::Bytes),
        ("[a-z.]{1,16}", prop::collection::vec(any::<u8>(), 0..64))
            .prop_map(|(schema, data)| Payload::Typed { schema, data }),
    ];

    leaf.prop_recursive(3, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Payload::List),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..6).prop_map(Payload::Map),
        ]
    })
}

/// Generate raw envelope bytes for "n" wrapping a chain of single-item
/// lists and maps, with arbitrary trailing junk in place of the leaf
fn arb_nested_bytes() -> impl Strategy<Value = (usize, Vec<u8>)> {
    (
        1usize..20_000,
        any::<bool>(),
        prop::collection::vec(any::<u8>(), 0..8),
    )
        .prop_map(|(levels, maps, tail)| {
            let mut bytes = vec![PROTOCOL_VERSION, 1, b'n', 1];
            for _ in 0..levels {
                if maps {
                    // Map variant, one entry keyed "k"
                    bytes.extend_from_slice(&[6, 1, 1, b'k']);
                } else {
                    bytes.extend_from_slice(&[5, 1]);
                }
            }
            bytes.extend(tail);
            (levels, bytes)
        })
}

proptest! {
    /// Property: decode(encode(e)) == e for every envelope
    #[test]
    fn envelope_round_trips(
        name in arb_event_name(),
        payload in prop::option::of(arb_payload()),
    ) {
        let envelope = EventEnvelope::new(name, payload).unwrap();
        let bytes = envelope.encode().unwrap();

        prop_assert_eq!(bytes[0], PROTOCOL_VERSION);
        prop_assert_eq!(EventEnvelope::decode(&bytes).unwrap(), envelope);
    }

    /// Property: arbitrary bytes never panic the decoder
    #[test]
    fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = EventEnvelope::decode_with_limit(&bytes, 4096);
    }

    /// Property: deep nesting is refused instead of exhausting the stack
    #[test]
    fn deep_nesting_never_panics((levels, bytes) in arb_nested_bytes()) {
        let result = EventEnvelope::decode_with_limit(&bytes, 128 * 1024);
        if levels > MAX_PAYLOAD_DEPTH {
            prop_assert!(result.is_err());
        }
    }

    /// Property: a wrong version byte is always reported as such
    #[test]
    fn foreign_version_rejected(
        version in any::<u8>().prop_filter("foreign version", |v| *v != PROTOCOL_VERSION),
        body in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut bytes = vec![version];
        bytes.extend(body);
        let is_unsupported = matches!(
            EventEnvelope::decode(&bytes),
            Err(EnvelopeError::UnsupportedVersion { .. })
        );
        prop_assert!(is_unsupported);
    }

    /// Property: truncating a valid envelope never yields a different valid one
    #[test]
    fn truncation_is_detected(
        name in arb_event_name(),
        text in ".{1,64}",
        cut in 1usize..16,
    ) {
        let envelope = EventEnvelope::new(name, Some(Payload::Text(text))).unwrap();
        let bytes = envelope.encode().unwrap();
        let keep = bytes.len().saturating_sub(cut).max(1);
        prop_assume!(keep < bytes.len());

        prop_assert!(EventEnvelope::decode(&bytes[..keep]).is_err());
    }
}
