//! Boundary ports between the link core and the surrounding application.
//!
//! These traits are the only runtime boundary the core depends on: the raw
//! transport supplied by the platform, the local vault, and the per-account
//! sync policy check.
//!
//! Object-safety note:
//! - Traits use `async-trait` for async dyn-dispatch.
//! - Streaming uses boxed trait objects ([`ByteStream`], [`StateStream`]).

use crate::error::LinkResult;
use crate::ids::AccountId;
use crate::status::{BiometricsStatus, LinkState, UnlockKey, VaultStatus};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Inbound frame payloads in transport arrival order.
pub type ByteStream = BoxStream<'static, Vec<u8>>;

/// Connection-state transitions.
pub type StateStream = BoxStream<'static, LinkState>;

/// The raw message-oriented transport between the two processes.
///
/// The surrounding application supplies this already connected; discovery
/// and handshake are outside the core. Delivery is best effort with no
/// acknowledgement, deduplication, or cross-message ordering guarantees
/// beyond per-stream arrival order.
#[async_trait]
pub trait TransportPort: Send + Sync {
    /// Deliver one opaque frame payload to the peer, best effort.
    async fn send(&self, bytes: Vec<u8>) -> LinkResult<()>;

    /// The inbound payload stream. Intended to be taken once per connection
    /// by the channel pump; later calls may yield an empty stream.
    fn frames(&self) -> ByteStream;

    /// Connection-state transitions, starting from the current state.
    fn states(&self) -> StateStream;

    fn is_connected(&self) -> bool;
}

/// The local side's vault: lock state and key application for one account.
#[async_trait]
pub trait VaultPort: Send + Sync {
    async fn status(&self, account: &AccountId) -> LinkResult<VaultStatus>;

    async fn lock(&self, account: &AccountId) -> LinkResult<()>;

    /// Apply key material received from the peer, unlocking the account.
    async fn apply_unlock_key(&self, account: &AccountId, key: UnlockKey) -> LinkResult<()>;

    async fn biometrics_status(&self) -> LinkResult<BiometricsStatus>;
}

/// External policy gate consulted once per reconciliation tick.
#[async_trait]
pub trait SyncPolicyPort: Send + Sync {
    async fn reconcile_enabled(&self, account: &AccountId) -> bool;
}
