//! Lock, biometrics, protocol-variant, and connection state types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock state of one account on one side of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultStatus {
    Locked,
    Unlocked,
}

/// Availability of biometric or hardware-backed unlock on the host side.
///
/// Ambiguity resolves to `Unavailable`: this status gates sensitive flows,
/// so no branch may report the capability present without having verified it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiometricsStatus {
    Available,
    NotEnabled,
    Unavailable,
}

impl Default for BiometricsStatus {
    fn default() -> Self {
        Self::Unavailable
    }
}

/// Protocol generation of the remote peer, classified once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVariant {
    Unknown,
    Legacy,
    Current,
}

impl ProtocolVariant {
    /// Collapse `Unknown` to `Legacy`, the narrower-feature assumption a
    /// caller must route by until a later probe succeeds.
    pub fn effective(self) -> Self {
        match self {
            Self::Unknown => Self::Legacy,
            other => other,
        }
    }

    pub fn is_current(self) -> bool {
        self.effective() == Self::Current
    }
}

/// Connection state of the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connected,
    Disconnected,
}

impl LinkState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// Opaque unlock key material in transit between the two processes.
///
/// The core never interprets the contents and never logs them; `Debug` is
/// redacted. Log a fingerprint instead.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnlockKey(String);

impl UnlockKey {
    pub fn new(material: impl Into<String>) -> Self {
        Self(material.into())
    }

    /// The raw material, for handing to the local vault only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UnlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnlockKey(..)")
    }
}
