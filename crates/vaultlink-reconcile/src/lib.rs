//! Lock-state reconciliation between the two processes.
//!
//! Each process authenticates, locks, and times out on its own, so the two
//! sides drift. The [`ReconcileLoop`] re-evaluates one tracked account on a
//! fixed tick: when the peer is locked and the local side is not, it locks
//! locally; when the peer is unlocked and the local side is locked, it asks
//! the peer for the unlock key material and applies it. A peer that
//! explicitly refuses the key enters a trust-denial cooldown during which no
//! further transfer attempts are made for that account.
//!
//! Every tick is independent: errors are caught and logged, and the next
//! tick proceeds with fresh state. No decision is ever made without a live
//! channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::{Duration, Instant, MissedTickBehavior, interval};
use tracing::{debug, info, instrument, warn};
use vaultlink_channel::Channel;
use vaultlink_dispatch::PeerCommands;
use vaultlink_protocol::{
    AccountId, BiometricsStatus, LinkResult, SyncPolicyPort, UnlockKey, VaultPort, VaultStatus,
};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// How often the loop re-evaluates the tracked account.
    pub tick: Duration,
    /// Budget for the remote status query; on expiry the remote is assumed
    /// locked.
    pub status_timeout: Duration,
    /// Suppression window after the peer explicitly refuses a key transfer.
    pub denial_cooldown: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            status_timeout: Duration::from_secs(5),
            denial_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ReconciliationState {
    trust_denied_until: Option<Instant>,
}

/// Periodic lock-state reconciliation for the tracked account.
///
/// Cheap to clone; all clones share the per-account state table, which is
/// mutated only by the loop itself. External readers go through
/// [`ReconcileLoop::can_attempt_key_transfer`].
#[derive(Clone)]
pub struct ReconcileLoop {
    channel: Channel,
    commands: PeerCommands,
    vault: Arc<dyn VaultPort>,
    policy: Arc<dyn SyncPolicyPort>,
    config: ReconcileConfig,
    active: Arc<Mutex<Option<AccountId>>>,
    accounts: Arc<Mutex<HashMap<AccountId, ReconciliationState>>>,
}

impl ReconcileLoop {
    pub fn new(
        channel: Channel,
        commands: PeerCommands,
        vault: Arc<dyn VaultPort>,
        policy: Arc<dyn SyncPolicyPort>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            channel,
            commands,
            vault,
            policy,
            config,
            active: Arc::new(Mutex::new(None)),
            accounts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Select which account the loop reconciles; `None` idles the loop.
    pub fn set_active_account(&self, account: Option<AccountId>) {
        *self.active.lock() = account;
    }

    /// Whether a key transfer with the peer may currently be attempted for
    /// `account`, i.e. the account is not inside a trust-denial cooldown.
    pub fn can_attempt_key_transfer(&self, account: &AccountId) -> bool {
        match self
            .accounts
            .lock()
            .get(account)
            .and_then(|state| state.trust_denied_until)
        {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    /// Run ticks forever. A failed tick is logged and the loop carries on.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(reconciler.config.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(error) = reconciler.tick_once().await {
                    warn!(%error, "reconciliation tick failed");
                }
            }
        })
    }

    /// One reconciliation pass. Public so embeddings and tests can drive
    /// ticks directly.
    #[instrument(skip(self))]
    pub async fn tick_once(&self) -> LinkResult<()> {
        // Every decision below applies to the account captured here, even
        // if the active account changes mid-tick.
        let Some(account) = self.active.lock().clone() else {
            return Ok(());
        };
        if !self.channel.is_connected() {
            return Ok(());
        }
        if !self.policy.reconcile_enabled(&account).await {
            debug!(%account, "reconciliation disabled by policy");
            return Ok(());
        }

        let local = self.vault.status(&account).await?;
        let remote = match self
            .commands
            .remote_status(&account, self.config.status_timeout)
            .await
        {
            Ok(status) => status,
            Err(error) => {
                debug!(%error, "remote status unavailable, assuming locked");
                VaultStatus::Locked
            }
        };

        match (remote, local) {
            (VaultStatus::Locked, VaultStatus::Unlocked) => {
                info!(%account, "peer is locked, locking the local side");
                self.vault.lock(&account).await?;
            }
            (VaultStatus::Unlocked, VaultStatus::Locked) => {
                self.transfer_key(&account).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn transfer_key(&self, account: &AccountId) -> LinkResult<()> {
        if !self.can_attempt_key_transfer(account) {
            debug!(%account, "key transfer suppressed by trust-denial cooldown");
            return Ok(());
        }
        match self.commands.request_unlock_key(account).await {
            Ok(key) => {
                info!(
                    %account,
                    fingerprint = %key_fingerprint(&key),
                    "applying unlock key from peer"
                );
                self.vault.apply_unlock_key(account, key).await
            }
            Err(error) if error.is_denied() => {
                warn!(
                    %account,
                    cooldown_secs = self.config.denial_cooldown.as_secs(),
                    "peer denied the key transfer, entering cooldown"
                );
                self.accounts
                    .lock()
                    .entry(account.clone())
                    .or_default()
                    .trust_denied_until = Some(Instant::now() + self.config.denial_cooldown);
                Ok(())
            }
            Err(error) => {
                // Silence is not denial; try again on a later tick.
                debug!(%error, "key transfer attempt failed without explicit denial");
                Ok(())
            }
        }
    }
}

/// Irreversible fingerprint of key material, safe for logs.
pub fn key_fingerprint(key: &UnlockKey) -> String {
    let digest = Sha256::digest(key.expose().as_bytes());
    hex::encode(&digest[..8])
}

/// In-memory [`VaultPort`] used by tests and the demo daemon.
#[derive(Default)]
pub struct InMemoryVault {
    status: Mutex<HashMap<AccountId, VaultStatus>>,
    lock_calls: Mutex<Vec<AccountId>>,
    applied_keys: Mutex<Vec<(AccountId, UnlockKey)>>,
    biometrics: Mutex<BiometricsStatus>,
}

impl InMemoryVault {
    pub fn with_status(account: AccountId, status: VaultStatus) -> Self {
        let vault = Self::default();
        vault.set_status(account, status);
        vault
    }

    pub fn set_status(&self, account: AccountId, status: VaultStatus) {
        self.status.lock().insert(account, status);
    }

    pub fn set_biometrics(&self, status: BiometricsStatus) {
        *self.biometrics.lock() = status;
    }

    /// Accounts the core has instructed to lock, in call order.
    pub fn lock_calls(&self) -> Vec<AccountId> {
        self.lock_calls.lock().clone()
    }

    /// Keys the core has applied, in call order.
    pub fn applied_keys(&self) -> Vec<(AccountId, UnlockKey)> {
        self.applied_keys.lock().clone()
    }
}

#[async_trait]
impl VaultPort for InMemoryVault {
    async fn status(&self, account: &AccountId) -> LinkResult<VaultStatus> {
        Ok(self
            .status
            .lock()
            .get(account)
            .copied()
            .unwrap_or(VaultStatus::Locked))
    }

    async fn lock(&self, account: &AccountId) -> LinkResult<()> {
        self.status
            .lock()
            .insert(account.clone(), VaultStatus::Locked);
        self.lock_calls.lock().push(account.clone());
        Ok(())
    }

    async fn apply_unlock_key(&self, account: &AccountId, key: UnlockKey) -> LinkResult<()> {
        self.status
            .lock()
            .insert(account.clone(), VaultStatus::Unlocked);
        self.applied_keys.lock().push((account.clone(), key));
        Ok(())
    }

    async fn biometrics_status(&self) -> LinkResult<BiometricsStatus> {
        Ok(*self.biometrics.lock())
    }
}

/// Fixed-answer [`SyncPolicyPort`] used by tests and the demo daemon.
#[derive(Debug, Clone, Copy)]
pub struct StaticSyncPolicy {
    enabled: bool,
}

impl StaticSyncPolicy {
    pub fn enabled() -> Self {
        Self { enabled: true }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

#[async_trait]
impl SyncPolicyPort for StaticSyncPolicy {
    async fn reconcile_enabled(&self, _account: &AccountId) -> bool {
        self.enabled
    }
}
