//! Error taxonomy for link operations.

use thiserror::Error;

/// Errors that can occur in link operations.
///
/// `RemoteDenied` is the one variant callers must distinguish from silence:
/// a peer that explicitly refused is treated differently (trust-denial
/// cooldown) from a peer that never answered (`Timeout`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("not connected")]
    NotConnected,
    #[error("timed out waiting for the peer")]
    Timeout,
    #[error("connection lost while waiting for the peer")]
    ConnectionLost,
    #[error("remote denied: {0}")]
    RemoteDenied(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LinkError {
    /// True when the peer explicitly refused, as opposed to staying silent.
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::RemoteDenied(_))
    }
}

/// Convenience result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;
