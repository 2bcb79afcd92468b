//! Core types for the PeerKit session layer
//!
//! This module defines the fundamental types used throughout the crate,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::ops::Deref;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::errors::{PeerKitError, ServiceError};

// ----------------------------------------------------------------------------
// Peer Identifier
// ----------------------------------------------------------------------------

/// Opaque unique identifier for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a PeerId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Short hex form used in log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0.as_bytes()[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerKitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| PeerKitError::config_error(format!("Invalid peer id '{}': {}", s, e)))
    }
}

impl Deref for PeerId {
    type Target = Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Peer Identity
// ----------------------------------------------------------------------------

/// A peer's stable identifier plus its human-readable display name.
///
/// Equality and hashing consider the identifier only, so two identities with
/// the same id but different display names refer to the same peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    id: PeerId,
    display_name: String,
}

impl PeerIdentity {
    /// Create an identity with a freshly generated id
    pub fn new<N: Into<String>>(display_name: N) -> Self {
        Self::with_id(PeerId::generate(), display_name)
    }

    /// Create an identity for a known id
    pub fn with_id<N: Into<String>>(id: PeerId, display_name: N) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id.short())
    }
}

// ----------------------------------------------------------------------------
// Service Identifier
// ----------------------------------------------------------------------------

/// Maximum length of a service identifier
pub const MAX_SERVICE_ID_LEN: usize = 15;

/// Maximum size of one `key=value` discovery info entry
pub const MAX_DISCOVERY_ENTRY_SIZE: usize = 255;

/// Identifier of the service a session advertises or browses for.
///
/// Follows the Bonjour service-type rules: 1-15 characters made of ASCII
/// lowercase letters, digits and hyphens, with no leading, trailing or
/// adjacent hyphens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new<S: Into<String>>(service: S) -> Result<Self, ServiceError> {
        let service = service.into();
        let invalid = |reason| ServiceError::InvalidServiceId {
            service: service.clone(),
            reason,
        };

        if service.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if service.len() > MAX_SERVICE_ID_LEN {
            return Err(invalid("must be at most 15 characters"));
        }
        if !service
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(invalid(
                "may only contain lowercase ASCII letters, digits and hyphens",
            ));
        }
        if service.starts_with('-') || service.ends_with('-') {
            return Err(invalid("must not start or end with a hyphen"));
        }
        if service.contains("--") {
            return Err(invalid("must not contain adjacent hyphens"));
        }

        Ok(Self(service))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServiceId {
    type Error = ServiceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ServiceId {
    type Error = ServiceError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceId> for String {
    fn from(value: ServiceId) -> Self {
        value.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Discovery Info
// ----------------------------------------------------------------------------

/// Metadata published alongside an advertisement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryInfo(BTreeMap<String, String>);

impl DiscoveryInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, rejecting pairs that exceed the advertisement budget
    pub fn insert<K: Into<String>, V: Into<String>>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<(), ServiceError> {
        let key = key.into();
        let value = value.into();
        let size = key.len() + 1 + value.len();
        if size > MAX_DISCOVERY_ENTRY_SIZE {
            return Err(ServiceError::DiscoveryInfoTooLarge {
                key,
                size,
                max: MAX_DISCOVERY_ENTRY_SIZE,
            });
        }
        self.0.insert(key, value);
        Ok(())
    }

    /// Builder-style insert
    pub fn with<K: Into<String>, V: Into<String>>(
        mut self,
        key: K,
        value: V,
    ) -> Result<Self, ServiceError> {
        self.insert(key, value)?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
