//! Device identity issued by the orchestration server.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Server-assigned identifier for this device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Bearer token proving the device was bound to an account.
///
/// `Debug` output is redacted so tokens never end up in logs.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceToken(String);

impl DeviceToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token for the wire.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "DeviceToken(<empty>)")
        } else {
            write!(f, "DeviceToken(<redacted>)")
        }
    }
}

impl From<&str> for DeviceToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Device Identity
// ============================================================================

/// Identity of this device as known to the server.
///
/// Starts empty, is populated by a successful registration or loaded from
/// the credential store, and is cleared when the server rejects the token.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(default)]
    pub device_id: DeviceId,

    #[serde(default)]
    pub device_token: DeviceToken,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<DeviceId>, device_token: impl Into<DeviceToken>) -> Self {
        Self {
            device_id: device_id.into(),
            device_token: device_token.into(),
        }
    }

    /// Returns true if a token is available for the `auth` handshake.
    pub fn has_token(&self) -> bool {
        !self.device_token.is_empty()
    }

    /// Forgets the token (and the id bound to it).
    pub fn clear(&mut self) {
        self.device_id = DeviceId::default();
        self.device_token = DeviceToken::default();
    }
}
