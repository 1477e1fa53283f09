//! VaultLink facade: wire the components together and hand out one handle.
//!
//! [`LinkBuilder`] takes the three boundary ports (transport, vault, sync
//! policy), builds the channel, dispatcher, compatibility detector, approval
//! broker, and reconciliation loop on top of each other, spawns their
//! background tasks, and returns a [`VaultLink`].

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::instrument;
use vaultlink_approval::{ApprovalBroker, ApprovalConfig};
use vaultlink_channel::Channel;
use vaultlink_dispatch::{
    CommandDispatcher, CompatibilityDetector, DispatchConfig, PeerCommands,
};
use vaultlink_protocol::{
    AccountId, ApprovalId, ApprovalMetadata, BiometricsStatus, CommandRequest, CorrelationId,
    LinkResult, ProtocolVariant, SyncPolicyPort, TransportPort, VaultPort, VaultStatus,
};
use vaultlink_reconcile::{ReconcileConfig, ReconcileLoop};

/// Assembles a [`VaultLink`] from the boundary ports.
pub struct LinkBuilder {
    transport: Arc<dyn TransportPort>,
    vault: Arc<dyn VaultPort>,
    policy: Arc<dyn SyncPolicyPort>,
    dispatch_config: DispatchConfig,
    approval_config: ApprovalConfig,
    reconcile_config: ReconcileConfig,
}

impl LinkBuilder {
    pub fn new(
        transport: Arc<dyn TransportPort>,
        vault: Arc<dyn VaultPort>,
        policy: Arc<dyn SyncPolicyPort>,
    ) -> Self {
        Self {
            transport,
            vault,
            policy,
            dispatch_config: DispatchConfig::default(),
            approval_config: ApprovalConfig::default(),
            reconcile_config: ReconcileConfig::default(),
        }
    }

    pub fn dispatch_config(mut self, config: DispatchConfig) -> Self {
        self.dispatch_config = config;
        self
    }

    pub fn approval_config(mut self, config: ApprovalConfig) -> Self {
        self.approval_config = config;
        self
    }

    pub fn reconcile_config(mut self, config: ReconcileConfig) -> Self {
        self.reconcile_config = config;
        self
    }

    /// Build the component stack and spawn every background task.
    pub fn build(self) -> VaultLink {
        let channel = Channel::new(self.transport);
        let dispatcher = CommandDispatcher::new(channel.clone(), self.dispatch_config);
        let detector = CompatibilityDetector::new(dispatcher.clone());
        let commands = PeerCommands::new(dispatcher.clone(), detector.clone());
        let approvals = ApprovalBroker::new(commands.clone(), self.approval_config);
        let reconciler = ReconcileLoop::new(
            channel.clone(),
            commands.clone(),
            self.vault,
            self.policy,
            self.reconcile_config,
        );

        let tasks = vec![
            channel.spawn_pump(),
            dispatcher.spawn_router(),
            detector.spawn_invalidator(&channel),
            approvals.spawn_answer_listener(&dispatcher),
            reconciler.spawn(),
        ];

        VaultLink {
            channel,
            dispatcher,
            commands,
            approvals,
            reconciler,
            tasks,
        }
    }
}

/// One live link to the peer process.
///
/// Dropping the handle leaves the background tasks running on the runtime;
/// call [`VaultLink::shutdown`] to stop them.
pub struct VaultLink {
    channel: Channel,
    dispatcher: CommandDispatcher,
    commands: PeerCommands,
    approvals: ApprovalBroker,
    reconciler: ReconcileLoop,
    tasks: Vec<JoinHandle<()>>,
}

impl VaultLink {
    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Select which account the reconciliation loop tracks.
    pub fn set_active_account(&self, account: Option<AccountId>) {
        self.reconciler.set_active_account(account);
    }

    /// The peer's protocol generation, probing on first use.
    pub async fn peer_variant(&self) -> ProtocolVariant {
        self.commands.detector().variant().await
    }

    pub async fn remote_status(&self, account: &AccountId) -> LinkResult<VaultStatus> {
        self.commands
            .remote_status(account, self.dispatcher.config().default_timeout)
            .await
    }

    pub async fn unlock_peer(&self, account: &AccountId) -> LinkResult<bool> {
        self.commands.unlock(account).await
    }

    pub async fn biometrics_status(&self) -> BiometricsStatus {
        self.commands.biometrics_status().await
    }

    /// Ask the human, via the peer process, to approve a sensitive
    /// operation. Deny-by-default on expiry or any failure.
    #[instrument(skip(self, metadata))]
    pub async fn request_approval(&self, subject_id: &str, metadata: ApprovalMetadata) -> bool {
        self.approvals.request_approval(subject_id, metadata).await
    }

    /// UI-boundary callback for the embedding application.
    pub fn record_approval_answer(&self, approval_id: ApprovalId, accepted: bool) {
        self.approvals.record_answer(approval_id, accepted);
    }

    /// Whether a key transfer may currently be attempted for `account`.
    pub fn can_attempt_key_transfer(&self, account: &AccountId) -> bool {
        self.reconciler.can_attempt_key_transfer(account)
    }

    /// Commands the peer sends us, for the embedding application to serve.
    pub fn subscribe_requests(&self) -> tokio::sync::broadcast::Receiver<CommandRequest> {
        self.dispatcher.subscribe_requests()
    }

    /// Answer a command the peer sent us.
    pub async fn respond(
        &self,
        correlation_id: CorrelationId,
        outcome: Result<serde_json::Value, String>,
    ) -> LinkResult<()> {
        self.dispatcher.respond(correlation_id, outcome).await
    }

    /// Abort every background task. The handle is inert afterwards.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::{Value, json};
    use tokio::task::yield_now;
    use tokio::time::Duration;
    use vaultlink_channel::PairTransport;
    use vaultlink_dispatch::wire;
    use vaultlink_protocol::{ApprovalPrompt, topics};
    use vaultlink_reconcile::{InMemoryVault, StaticSyncPolicy};

    fn account() -> AccountId {
        AccountId::from("acct-1")
    }

    fn quick_link(vault: Arc<InMemoryVault>) -> (VaultLink, CommandDispatcher, Arc<PairTransport>) {
        let (left, right) = PairTransport::pair();
        let transport = Arc::new(left);
        let link = LinkBuilder::new(
            transport.clone(),
            vault,
            Arc::new(StaticSyncPolicy::enabled()),
        )
        .approval_config(ApprovalConfig {
            ttl: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
        })
        .reconcile_config(ReconcileConfig {
            tick: Duration::from_millis(100),
            status_timeout: Duration::from_millis(200),
            denial_cooldown: Duration::from_secs(30),
        })
        .build();
        link.set_active_account(Some(account()));

        // The emulated peer process: its own channel and dispatcher on the
        // other end of the pair.
        let peer_channel = Channel::new(Arc::new(right));
        let peer = CommandDispatcher::new(peer_channel.clone(), DispatchConfig::default());
        let _ = peer_channel.spawn_pump();
        let _ = peer.spawn_router();
        (link, peer, transport)
    }

    fn spawn_unlocked_peer(peer: &CommandDispatcher) -> tokio::task::JoinHandle<()> {
        let peer = peer.clone();
        let mut requests = peer.subscribe_requests();
        tokio::spawn(async move {
            while let Ok(request) = requests.recv().await {
                let outcome = match request.command.as_str() {
                    wire::PROBE => Ok(json!({ "version": 2 })),
                    wire::STATUS => Ok(json!({ "status": "unlocked" })),
                    wire::GET_KEY => Ok(json!({ "key": "peer-key-material" })),
                    _ => Err("unknown command".to_owned()),
                };
                let _ = peer.respond(request.correlation_id, outcome).await;
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_transfers_the_key_end_to_end() -> Result<()> {
        let vault = Arc::new(InMemoryVault::with_status(account(), VaultStatus::Locked));
        let (link, peer, _transport) = quick_link(vault.clone());
        let _peer = spawn_unlocked_peer(&peer);

        assert_eq!(link.peer_variant().await, ProtocolVariant::Current);

        while vault.applied_keys().is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(vault.applied_keys()[0].1.expose(), "peer-key-material");
        assert_eq!(vault.status(&account()).await?, VaultStatus::Unlocked);

        link.shutdown();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn approval_round_trip_crosses_the_link() -> Result<()> {
        let vault = Arc::new(InMemoryVault::with_status(account(), VaultStatus::Unlocked));
        let (link, peer, _transport) = quick_link(vault);

        // The peer process answers every prompt with an acceptance push.
        let answering_peer = peer.clone();
        let mut pushes = peer.subscribe_pushes();
        let _answerer = tokio::spawn(async move {
            while let Ok(push) = pushes.recv().await {
                if push.topic != topics::APPROVAL_PROMPT {
                    continue;
                }
                let prompt: ApprovalPrompt =
                    serde_json::from_value(Value::Object(push.payload)).expect("prompt payload");
                let payload = match json!({
                    "approval_id": prompt.approval_id,
                    "accepted": true,
                }) {
                    Value::Object(map) => map,
                    _ => unreachable!(),
                };
                let _ = answering_peer.push(topics::APPROVAL_ANSWER, payload).await;
            }
        });

        let accepted = link
            .request_approval(
                "login-item-42",
                ApprovalMetadata {
                    display_name: "example.com".to_owned(),
                    process_name: "browser".to_owned(),
                },
            )
            .await;
        assert!(accepted);

        link.shutdown();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn serving_the_peer_through_the_facade() -> Result<()> {
        let vault = Arc::new(InMemoryVault::with_status(account(), VaultStatus::Unlocked));
        let (link, peer, _transport) = quick_link(vault);

        let mut requests = link.subscribe_requests();
        let server = tokio::spawn(async move { requests.recv().await });

        let value = tokio::spawn(async move { peer.call("echo", serde_json::Map::new()).await });
        let request = server.await??;
        assert_eq!(request.command, "echo");
        link.respond(request.correlation_id, Ok(json!("served"))).await?;
        assert_eq!(value.await??, json!("served"));

        link.shutdown();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_invalidates_classification_and_fails_calls() -> Result<()> {
        let vault = Arc::new(InMemoryVault::with_status(account(), VaultStatus::Unlocked));
        let (link, peer, transport) = quick_link(vault);
        let _peer = spawn_unlocked_peer(&peer);

        assert_eq!(link.peer_variant().await, ProtocolVariant::Current);

        transport.disconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let error = link.remote_status(&account()).await.unwrap_err();
        assert_eq!(error, vaultlink_protocol::LinkError::NotConnected);
        assert_eq!(
            link.commands.detector().cached(),
            ProtocolVariant::Unknown
        );

        link.shutdown();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_approval_denies_by_default() -> Result<()> {
        let vault = Arc::new(InMemoryVault::with_status(account(), VaultStatus::Unlocked));
        let (link, _peer, _transport) = quick_link(vault);

        let accepted = link
            .request_approval("login-item-42", ApprovalMetadata::default())
            .await;
        assert!(!accepted);

        // A latecomer answer cannot flip the resolved denial.
        link.record_approval_answer(ApprovalId(1), true);
        yield_now().await;

        link.shutdown();
        Ok(())
    }
}
