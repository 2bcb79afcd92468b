//! Session configuration
//!
//! Configuration knobs shared by the runtime and transport implementations.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::envelope::DEFAULT_MAX_ENVELOPE_SIZE;

// ----------------------------------------------------------------------------
// Encryption Preference
// ----------------------------------------------------------------------------

/// Link encryption requested from the transport when the session connects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncryptionPreference {
    /// Only encrypted links are accepted
    #[default]
    Required,
    /// Encrypt when the remote peer supports it
    Optional,
    /// Plaintext links
    None,
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Configuration for a PeerKit session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long an outgoing invitation stays valid
    pub invite_timeout: Duration,
    /// Link encryption requested from the transport
    pub encryption: EncryptionPreference,
    /// Largest encoded envelope accepted in either direction
    pub max_envelope_size: usize,
    /// Number of completed resource transfers kept for inspection
    pub transfer_history_limit: usize,
    /// How long `shutdown` waits for the dispatcher to drain
    pub shutdown_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            invite_timeout: Duration::from_secs(30),
            encryption: EncryptionPreference::Required,
            max_envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
            transfer_history_limit: 256,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            invite_timeout: Duration::from_secs(2),
            encryption: EncryptionPreference::None,
            max_envelope_size: 64 * 1024,
            transfer_history_limit: 32,
            shutdown_timeout: Duration::from_millis(500),
        }
    }

    /// Set invitation timeout
    pub fn with_invite_timeout(mut self, timeout: Duration) -> Self {
        self.invite_timeout = timeout;
        self
    }

    /// Set encryption preference
    pub fn with_encryption(mut self, encryption: EncryptionPreference) -> Self {
        self.encryption = encryption;
        self
    }

    /// Set maximum envelope size
    pub fn with_max_envelope_size(mut self, size: usize) -> Self {
        self.max_envelope_size = size;
        self
    }

    /// Set completed-transfer history size
    pub fn with_transfer_history_limit(mut self, limit: usize) -> Self {
        self.transfer_history_limit = limit;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_envelope_size < 16 {
            return Err(crate::PeerKitError::config_error(
                "max_envelope_size must be at least 16 bytes",
            ));
        }
        if self.invite_timeout.is_zero() {
            return Err(crate::PeerKitError::config_error(
                "invite_timeout must be non-zero",
            ));
        }
        Ok(())
    }
}
