//! Typed identifier types for the link core.
//!
//! The two integer IDs live in deliberately separate numbering spaces: a
//! [`CorrelationId`] pairs one command with its response inside the
//! dispatcher, while an [`ApprovalId`] tags an out-of-band approval exchange
//! whose answer may arrive minutes after the triggering call resolved.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation tag pairing one command request to its eventual response.
///
/// Allocated only by the command dispatcher, monotonically increasing within
/// a single connection's lifetime. The numbering space restarts on reconnect;
/// ids from the old connection are already failed by the disconnect sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag for one out-of-band human-approval exchange.
///
/// Allocated only by the approval broker, monotonically increasing per
/// process. Never mixed with [`CorrelationId`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovalId(pub u64);

impl fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque account identifier shared by both processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Create from any string value.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Create a new ID using UUID v4 (random).
    pub fn new_uuid() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// View as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for AccountId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
