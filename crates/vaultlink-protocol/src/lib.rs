//! # vaultlink-protocol: the canonical VaultLink protocol
//!
//! This crate defines the shared types, wire frame shapes, and trait
//! interfaces that every VaultLink component crate depends on.
//!
//! It is intentionally dependency-light (no runtime deps like tokio) so it
//! can be used as a pure contract crate by both sides of the link.
//!
//! ## Module Overview
//!
//! - [`ids`]: typed ID wrappers (CorrelationId, ApprovalId, AccountId)
//! - [`frame`]: the wire `Frame` union: requests, responses, pushes
//! - [`status`]: lock, biometrics, protocol-variant, and connection state
//! - [`approval`]: approval prompt and answer payloads
//! - [`ports`]: boundary ports (transport, local vault, sync policy)
//! - [`error`]: LinkError taxonomy, LinkResult

pub mod approval;
pub mod error;
pub mod frame;
pub mod ids;
pub mod ports;
pub mod status;

// Re-export the most commonly used types at the crate root.
pub use approval::{ApprovalAnswer, ApprovalMetadata, ApprovalPrompt};
pub use error::{LinkError, LinkResult};
pub use frame::{
    CommandRequest, CommandResponse, DENIED_ERROR, Frame, LEGACY_ACK, PROBE_COMMAND, PushFrame,
    topics,
};
pub use ids::{AccountId, ApprovalId, CorrelationId};
pub use ports::{ByteStream, StateStream, SyncPolicyPort, TransportPort, VaultPort};
pub use status::{BiometricsStatus, LinkState, ProtocolVariant, UnlockKey, VaultStatus};
