//! Event envelope wire format
//!
//! Every application-level message is wrapped into an [`EventEnvelope`]
//! before it leaves the process. On the wire an envelope is a single
//! protocol version byte followed by the bincode encoding of the envelope.

use serde::de::{self, DeserializeOwned, DeserializeSeed, Deserializer, EnumAccess, VariantAccess};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use bincode::Options;

use crate::errors::EnvelopeError;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Current envelope wire format version
pub const PROTOCOL_VERSION: u8 = 1;

/// Default upper bound for an encoded envelope (1 MiB)
pub const DEFAULT_MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Deepest list/map nesting a payload may carry
pub const MAX_PAYLOAD_DEPTH: usize = 64;

// ----------------------------------------------------------------------------
// Payload
// ----------------------------------------------------------------------------

/// Application structs that travel as [`Payload::Typed`].
///
/// `SCHEMA` tags the encoded bytes so receivers can tell payload kinds apart
/// without trusting the event name alone.
pub trait EventPayload: Serialize + DeserializeOwned {
    const SCHEMA: &'static str;
}

/// Discriminated event payload
///
/// Lists and maps nest at most [`MAX_PAYLOAD_DEPTH`] levels deep; deeper
/// trees are refused by both the encoder and the decoder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Payload {
    Bool(bool),
    Int(i64),
    /// Compared with `f64` equality, so a NaN payload never equals itself
    /// (nor its own decoded copy).
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
    /// Serde-encoded application struct tagged with its schema id
    Typed { schema: String, data: Vec<u8> },
}

impl Payload {
    /// Encode an application struct as a typed payload
    pub fn typed<T: EventPayload>(value: &T) -> Result<Self, EnvelopeError> {
        Ok(Payload::Typed {
            schema: T::SCHEMA.to_string(),
            data: bincode::serialize(value)?,
        })
    }

    /// Decode a typed payload back into `T`
    pub fn decode<T: EventPayload>(&self) -> Result<T, EnvelopeError> {
        match self {
            Payload::Typed { schema, data } if schema == T::SCHEMA => {
                Ok(bincode::deserialize(data)?)
            }
            Payload::Typed { schema, .. } => Err(EnvelopeError::SchemaMismatch {
                expected: T::SCHEMA.to_string(),
                actual: schema.clone(),
            }),
            other => Err(EnvelopeError::SchemaMismatch {
                expected: T::SCHEMA.to_string(),
                actual: other.kind().to_string(),
            }),
        }
    }

    /// Name of the payload variant, or the schema id for typed payloads
    pub fn kind(&self) -> &str {
        match self {
            Payload::Bool(_) => "bool",
            Payload::Int(_) => "int",
            Payload::Float(_) => "float",
            Payload::Text(_) => "text",
            Payload::Bytes(_) => "bytes",
            Payload::List(_) => "list",
            Payload::Map(_) => "map",
            Payload::Typed { schema, .. } => schema,
        }
    }

    /// Number of nested list/map levels, zero for scalars
    pub fn depth(&self) -> usize {
        match self {
            Payload::List(items) => 1 + items.iter().map(Payload::depth).max().unwrap_or(0),
            Payload::Map(entries) => 1 + entries.values().map(Payload::depth).max().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Payload::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Payload::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Bool(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Int(value)
    }
}

impl From<i32> for Payload {
    fn from(value: i32) -> Self {
        Payload::Int(value.into())
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::Float(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

impl From<Vec<Payload>> for Payload {
    fn from(value: Vec<Payload>) -> Self {
        Payload::List(value)
    }
}

impl From<BTreeMap<String, Payload>> for Payload {
    fn from(value: BTreeMap<String, Payload>) -> Self {
        Payload::Map(value)
    }
}

// ----------------------------------------------------------------------------
// Payload Decoding
// ----------------------------------------------------------------------------

// Hand-written so untrusted input cannot recurse past MAX_PAYLOAD_DEPTH.

const PAYLOAD_VARIANTS: &[&str] = &["Bool", "Int", "Float", "Text", "Bytes", "List", "Map", "Typed"];

#[derive(Deserialize)]
#[serde(variant_identifier)]
enum PayloadTag {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    List,
    Map,
    Typed,
}

#[derive(Deserialize)]
struct TypedFields {
    schema: String,
    data: Vec<u8>,
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        PayloadSeed {
            depth_left: MAX_PAYLOAD_DEPTH,
        }
        .deserialize(deserializer)
    }
}

#[derive(Clone, Copy)]
struct PayloadSeed {
    depth_left: usize,
}

impl PayloadSeed {
    fn nested<E: de::Error>(self) -> Result<Self, E> {
        match self.depth_left.checked_sub(1) {
            Some(depth_left) => Ok(Self { depth_left }),
            None => Err(E::custom(format_args!(
                "payload nested deeper than {} levels",
                MAX_PAYLOAD_DEPTH
            ))),
        }
    }
}

impl<'de> DeserializeSeed<'de> for PayloadSeed {
    type Value = Payload;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Payload, D::Error> {
        deserializer.deserialize_enum("Payload", PAYLOAD_VARIANTS, self)
    }
}

impl<'de> de::Visitor<'de> for PayloadSeed {
    type Value = Payload;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an event payload")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<Payload, A::Error> {
        let (tag, variant) = data.variant::<PayloadTag>()?;
        match tag {
            PayloadTag::Bool => variant.newtype_variant().map(Payload::Bool),
            PayloadTag::Int => variant.newtype_variant().map(Payload::Int),
            PayloadTag::Float => variant.newtype_variant().map(Payload::Float),
            PayloadTag::Text => variant.newtype_variant().map(Payload::Text),
            PayloadTag::Bytes => variant.newtype_variant().map(Payload::Bytes),
            PayloadTag::List => variant
                .newtype_variant_seed(ListSeed(self.nested::<A::Error>()?))
                .map(Payload::List),
            PayloadTag::Map => variant
                .newtype_variant_seed(MapSeed(self.nested::<A::Error>()?))
                .map(Payload::Map),
            PayloadTag::Typed => variant
                .newtype_variant::<TypedFields>()
                .map(|TypedFields { schema, data }| Payload::Typed { schema, data }),
        }
    }
}

struct ListSeed(PayloadSeed);

impl<'de> DeserializeSeed<'de> for ListSeed {
    type Value = Vec<Payload>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> de::Visitor<'de> for ListSeed {
    type Value = Vec<Payload>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a list of payloads")
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        // cap the preallocation, the length prefix is untrusted
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(256));
        while let Some(item) = seq.next_element_seed(self.0)? {
            items.push(item);
        }
        Ok(items)
    }
}

struct MapSeed(PayloadSeed);

impl<'de> DeserializeSeed<'de> for MapSeed {
    type Value = BTreeMap<String, Payload>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> de::Visitor<'de> for MapSeed {
    type Value = BTreeMap<String, Payload>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of payloads")
    }

    fn visit_map<A: de::MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((key, value)) = map.next_entry_seed(PhantomData::<String>, self.0)? {
            entries.insert(key, value);
        }
        Ok(entries)
    }
}

// ----------------------------------------------------------------------------
// Event Envelope
// ----------------------------------------------------------------------------

/// Wire unit pairing an event name with an optional payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_name: String,
    payload: Option<Payload>,
}

impl EventEnvelope {
    pub fn new<N: Into<String>>(
        event_name: N,
        payload: Option<Payload>,
    ) -> Result<Self, EnvelopeError> {
        let event_name = event_name.into();
        if event_name.is_empty() {
            return Err(EnvelopeError::EmptyEventName);
        }
        Ok(Self {
            event_name,
            payload,
        })
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn into_parts(self) -> (String, Option<Payload>) {
        (self.event_name, self.payload)
    }

    /// Encode with the default size limit
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        self.encode_with_limit(DEFAULT_MAX_ENVELOPE_SIZE)
    }

    /// Encode, rejecting envelopes larger than `max_size` bytes
    pub fn encode_with_limit(&self, max_size: usize) -> Result<Vec<u8>, EnvelopeError> {
        if let Some(depth) = self.payload.as_ref().map(Payload::depth) {
            if depth > MAX_PAYLOAD_DEPTH {
                return Err(EnvelopeError::TooDeep {
                    max: MAX_PAYLOAD_DEPTH,
                    actual: depth,
                });
            }
        }
        let body = bincode::DefaultOptions::new().serialize(self)?;
        let actual = body.len() + 1;
        if actual > max_size {
            return Err(EnvelopeError::TooLarge {
                max: max_size,
                actual,
            });
        }

        let mut bytes = Vec::with_capacity(actual);
        bytes.push(PROTOCOL_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode with the default size limit
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Self::decode_with_limit(bytes, DEFAULT_MAX_ENVELOPE_SIZE)
    }

    /// Decode untrusted bytes, bounding allocations by `max_size` and payload
    /// nesting by [`MAX_PAYLOAD_DEPTH`]
    pub fn decode_with_limit(bytes: &[u8], max_size: usize) -> Result<Self, EnvelopeError> {
        let (&version, body) = bytes.split_first().ok_or(EnvelopeError::Empty)?;
        if version != PROTOCOL_VERSION {
            return Err(EnvelopeError::UnsupportedVersion {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }
        if bytes.len() > max_size {
            return Err(EnvelopeError::TooLarge {
                max: max_size,
                actual: bytes.len(),
            });
        }

        let envelope: EventEnvelope = bincode::DefaultOptions::new()
            .with_limit(max_size as u64)
            .reject_trailing_bytes()
            .deserialize(body)?;
        if envelope.event_name.is_empty() {
            return Err(EnvelopeError::EmptyEventName);
        }
        Ok(envelope)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
