//! Correlated command dispatch over the frame channel.
//!
//! Three pieces live here:
//!
//! - [`CommandDispatcher`] turns the bare, unordered frame channel into
//!   "send a command, await its answer" with per-call timeouts. It owns the
//!   pending-call table and is the only component that writes business
//!   frames to the channel.
//! - [`CompatibilityDetector`] classifies the peer's protocol generation
//!   once per connection and caches the result until disconnect.
//! - [`PeerCommands`] is the typed command surface: each operation branches
//!   on the detected variant between the legacy and current wire shape while
//!   exposing identical semantics to its callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::{broadcast, oneshot};
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};
use vaultlink_channel::Channel;
use vaultlink_protocol::{
    AccountId, ApprovalPrompt, BiometricsStatus, CommandRequest, CommandResponse, CorrelationId,
    DENIED_ERROR, Frame, LEGACY_ACK, LinkError, LinkResult, PROBE_COMMAND, ProtocolVariant,
    PushFrame, UnlockKey, VaultStatus, topics,
};

/// Wire command names for both protocol generations.
pub mod wire {
    /// Probe answered by every generation.
    pub const PROBE: &str = super::PROBE_COMMAND;
    pub const LEGACY_STATUS: &str = "status";
    pub const STATUS: &str = "account-status";
    pub const LEGACY_UNLOCK: &str = "unlock";
    pub const UNLOCK: &str = "unlock-for-account";
    pub const LEGACY_GET_KEY: &str = "get-key";
    pub const GET_KEY: &str = "export-unlock-key";
    pub const BIOMETRICS_STATUS: &str = "biometrics-status";
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Budget for an ordinary command round trip.
    pub default_timeout: Duration,
    /// Budget for the one-off capability probe.
    pub probe_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

type PendingTable = HashMap<u64, oneshot::Sender<LinkResult<CommandResponse>>>;

/// Turns the frame channel into correlated request/response calls.
///
/// Cheap to clone; all clones share the pending table, the counters, and
/// the hubs. Exactly one resolution ever occurs per pending call: the
/// matching response, the per-call timer, or the disconnect sweep,
/// whichever fires first. The losers are no-ops.
#[derive(Clone)]
pub struct CommandDispatcher {
    channel: Channel,
    config: DispatchConfig,
    pending: Arc<Mutex<PendingTable>>,
    next_correlation: Arc<AtomicU64>,
    push_tx: broadcast::Sender<PushFrame>,
    request_tx: broadcast::Sender<CommandRequest>,
}

impl CommandDispatcher {
    pub fn new(channel: Channel, config: DispatchConfig) -> Self {
        let (push_tx, _) = broadcast::channel(256);
        let (request_tx, _) = broadcast::channel(256);
        Self {
            channel,
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_correlation: Arc::new(AtomicU64::new(1)),
            push_tx,
            request_tx,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Outstanding calls awaiting a response. Observability accessor only;
    /// the table itself is never shared.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `command` and await its correlated response with the default
    /// timeout.
    pub async fn call(&self, command: &str, args: Map<String, Value>) -> LinkResult<Value> {
        self.call_with_timeout(command, args, self.config.default_timeout)
            .await
    }

    /// Send `command` and await its correlated response.
    ///
    /// Resolves with exactly one of: the matching response payload, a
    /// [`LinkError::RemoteDenied`]/[`LinkError::Remote`] carried in the
    /// response, [`LinkError::Timeout`] when the timer fires first, or
    /// [`LinkError::ConnectionLost`] when the channel drops while pending.
    #[instrument(skip(self, args), fields(command = command))]
    pub async fn call_with_timeout(
        &self,
        command: &str,
        args: Map<String, Value>,
        timeout: Duration,
    ) -> LinkResult<Value> {
        let correlation_id = CorrelationId(self.next_correlation.fetch_add(1, Ordering::Relaxed));
        let (resolve_tx, resolve_rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id.0, resolve_tx);

        let frame = Frame::Request(CommandRequest {
            correlation_id,
            command: command.to_owned(),
            args,
        });
        if let Err(error) = self.channel.send(&frame).await {
            self.pending.lock().remove(&correlation_id.0);
            return Err(error);
        }

        match tokio::time::timeout(timeout, resolve_rx).await {
            Ok(Ok(outcome)) => outcome.and_then(resolve_response),
            // The dispatcher side of the slot vanished without resolving.
            Ok(Err(_)) => Err(LinkError::ConnectionLost),
            Err(_) => {
                self.pending.lock().remove(&correlation_id.0);
                debug!(%correlation_id, "call timed out");
                Err(LinkError::Timeout)
            }
        }
    }

    /// Fire-and-forget unsolicited push; not a tracked call.
    #[instrument(skip(self, payload))]
    pub async fn push(&self, topic: &str, payload: Map<String, Value>) -> LinkResult<()> {
        self.channel
            .send(&Frame::Push(PushFrame {
                topic: topic.to_owned(),
                payload,
            }))
            .await
    }

    /// Answer a command the peer sent us.
    pub async fn respond(
        &self,
        correlation_id: CorrelationId,
        outcome: Result<Value, String>,
    ) -> LinkResult<()> {
        let response = match outcome {
            Ok(result) => CommandResponse::ok(correlation_id, result),
            Err(error) => CommandResponse::err(correlation_id, error),
        };
        self.channel.send(&Frame::Response(response)).await
    }

    /// Unsolicited pushes fanned out by the router.
    pub fn subscribe_pushes(&self) -> broadcast::Receiver<PushFrame> {
        self.push_tx.subscribe()
    }

    /// Commands the peer sends us, for the embedding application to serve.
    pub fn subscribe_requests(&self) -> broadcast::Receiver<CommandRequest> {
        self.request_tx.subscribe()
    }

    /// Route inbound frames until the channel closes: responses to the
    /// pending table, pushes and peer requests to their hubs. On disconnect
    /// every pending call fails with `ConnectionLost`; on reconnect the
    /// correlation numbering space restarts.
    pub fn spawn_router(&self) -> tokio::task::JoinHandle<()> {
        let mut frames = self.channel.subscribe_frames();
        let mut states = self.channel.state_receiver();
        let pending = self.pending.clone();
        let next_correlation = self.next_correlation.clone();
        let push_tx = self.push_tx.clone();
        let request_tx = self.request_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = frames.recv() => match frame {
                        Ok(Frame::Response(response)) => {
                            let slot = pending.lock().remove(&response.correlation_id.0);
                            match slot {
                                Some(resolve) => {
                                    let _ = resolve.send(Ok(response));
                                }
                                None => debug!(
                                    correlation_id = response.correlation_id.0,
                                    "response matches no pending call, dropped"
                                ),
                            }
                        }
                        Ok(Frame::Push(push)) => {
                            let _ = push_tx.send(push);
                        }
                        Ok(Frame::Request(request)) => {
                            let _ = request_tx.send(request);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "frame subscriber lagged, frames lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *states.borrow_and_update();
                        if state.is_connected() {
                            next_correlation.store(1, Ordering::Relaxed);
                        } else {
                            let drained: Vec<_> = {
                                let mut table = pending.lock();
                                table.drain().collect()
                            };
                            if !drained.is_empty() {
                                warn!(count = drained.len(), "failing pending calls after disconnect");
                            }
                            for (_, resolve) in drained {
                                let _ = resolve.send(Err(LinkError::ConnectionLost));
                            }
                        }
                    }
                }
            }
            debug!("dispatcher router stopped");
        })
    }
}

fn resolve_response(response: CommandResponse) -> LinkResult<Value> {
    match response.error {
        Some(error) if error == DENIED_ERROR => Err(LinkError::RemoteDenied(error)),
        Some(error) => Err(LinkError::Remote(error)),
        None => Ok(response.result.unwrap_or(Value::Null)),
    }
}

/// Classifies the peer's protocol generation once per connection.
#[derive(Clone)]
pub struct CompatibilityDetector {
    dispatcher: CommandDispatcher,
    cached: Arc<Mutex<ProtocolVariant>>,
}

impl CompatibilityDetector {
    pub fn new(dispatcher: CommandDispatcher) -> Self {
        Self {
            dispatcher,
            cached: Arc::new(Mutex::new(ProtocolVariant::Unknown)),
        }
    }

    /// The cached classification without probing.
    pub fn cached(&self) -> ProtocolVariant {
        *self.cached.lock()
    }

    /// Classification for the current connection, probing on first use.
    ///
    /// A failed probe leaves `Unknown`, re-probed on the next call; callers
    /// meanwhile route `Unknown` as `Legacy` via
    /// [`ProtocolVariant::effective`].
    #[instrument(skip(self))]
    pub async fn variant(&self) -> ProtocolVariant {
        let cached = self.cached();
        if cached != ProtocolVariant::Unknown {
            return cached;
        }
        let probed = self.probe().await;
        if probed != ProtocolVariant::Unknown {
            *self.cached.lock() = probed;
            info!(?probed, "peer protocol classified");
        }
        probed
    }

    async fn probe(&self) -> ProtocolVariant {
        let outcome = self
            .dispatcher
            .call_with_timeout(
                PROBE_COMMAND,
                Map::new(),
                self.dispatcher.config().probe_timeout,
            )
            .await;
        match outcome {
            Ok(value) if value == json!(LEGACY_ACK) => ProtocolVariant::Legacy,
            Ok(_) => ProtocolVariant::Current,
            // A peer that answered at all, but not with a capability
            // payload, predates the probe.
            Err(LinkError::Remote(_)) | Err(LinkError::RemoteDenied(_)) => ProtocolVariant::Legacy,
            Err(error) => {
                debug!(%error, "capability probe failed, classification stays unknown");
                ProtocolVariant::Unknown
            }
        }
    }

    /// Reset the cache to `Unknown` whenever the channel disconnects.
    pub fn spawn_invalidator(&self, channel: &Channel) -> tokio::task::JoinHandle<()> {
        let mut states = channel.state_receiver();
        let cached = self.cached.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                if !states.borrow_and_update().is_connected() {
                    let mut slot = cached.lock();
                    if *slot != ProtocolVariant::Unknown {
                        debug!("protocol classification invalidated by disconnect");
                        *slot = ProtocolVariant::Unknown;
                    }
                }
            }
        })
    }
}

/// Typed command surface toward the peer process.
///
/// Every operation consults the compatibility detector and picks the wire
/// name and argument shape for the peer's generation; callers always see
/// the same semantics.
#[derive(Clone)]
pub struct PeerCommands {
    dispatcher: CommandDispatcher,
    detector: CompatibilityDetector,
}

impl PeerCommands {
    pub fn new(dispatcher: CommandDispatcher, detector: CompatibilityDetector) -> Self {
        Self {
            dispatcher,
            detector,
        }
    }

    pub fn detector(&self) -> &CompatibilityDetector {
        &self.detector
    }

    /// The peer's lock state for `account`.
    #[instrument(skip(self), fields(account = %account))]
    pub async fn remote_status(
        &self,
        account: &AccountId,
        timeout: Duration,
    ) -> LinkResult<VaultStatus> {
        let value = match self.detector.variant().await.effective() {
            ProtocolVariant::Current => {
                self.dispatcher
                    .call_with_timeout(wire::STATUS, account_args(account), timeout)
                    .await?
            }
            _ => {
                self.dispatcher
                    .call_with_timeout(wire::LEGACY_STATUS, Map::new(), timeout)
                    .await?
            }
        };
        parse_field(&value, "status")
    }

    /// Ask the peer to unlock `account`; both generations resolve to the
    /// same boolean outcome.
    #[instrument(skip(self), fields(account = %account))]
    pub async fn unlock(&self, account: &AccountId) -> LinkResult<bool> {
        let value = match self.detector.variant().await.effective() {
            ProtocolVariant::Current => {
                self.dispatcher
                    .call(wire::UNLOCK, account_args(account))
                    .await?
            }
            _ => self.dispatcher.call(wire::LEGACY_UNLOCK, Map::new()).await?,
        };
        parse_field(&value, "unlocked")
    }

    /// Request the unlock key material for `account` from the peer.
    ///
    /// An explicit wire denial surfaces as [`LinkError::RemoteDenied`],
    /// which callers treat differently from silence.
    #[instrument(skip(self), fields(account = %account))]
    pub async fn request_unlock_key(&self, account: &AccountId) -> LinkResult<UnlockKey> {
        let value = match self.detector.variant().await.effective() {
            ProtocolVariant::Current => {
                self.dispatcher
                    .call(wire::GET_KEY, account_args(account))
                    .await?
            }
            _ => {
                self.dispatcher
                    .call(wire::LEGACY_GET_KEY, Map::new())
                    .await?
            }
        };
        let material: String = parse_field(&value, "key")?;
        Ok(UnlockKey::new(material))
    }

    /// Biometric unlock availability on the peer.
    ///
    /// Resolves fail-closed: a legacy or unclassified peer, a malformed
    /// payload, or any dispatch failure yields `Unavailable`.
    #[instrument(skip(self))]
    pub async fn biometrics_status(&self) -> BiometricsStatus {
        if !self.detector.variant().await.is_current() {
            return BiometricsStatus::Unavailable;
        }
        match self
            .dispatcher
            .call(wire::BIOMETRICS_STATUS, Map::new())
            .await
        {
            Ok(value) => parse_field(&value, "biometrics").unwrap_or_default(),
            Err(error) => {
                debug!(%error, "biometrics status unavailable");
                BiometricsStatus::Unavailable
            }
        }
    }

    /// Push an approval prompt to the peer, fire and forget. The answer,
    /// if any, arrives on the approval-answer topic minutes later or never.
    #[instrument(skip(self, prompt), fields(approval_id = prompt.approval_id.0))]
    pub async fn push_approval_prompt(&self, prompt: &ApprovalPrompt) -> LinkResult<()> {
        let payload = match serde_json::to_value(prompt) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                return Err(LinkError::Serialization(
                    "approval prompt did not serialize to an object".to_owned(),
                ));
            }
        };
        self.dispatcher.push(topics::APPROVAL_PROMPT, payload).await
    }
}

fn account_args(account: &AccountId) -> Map<String, Value> {
    let mut args = Map::new();
    args.insert("account_id".to_owned(), json!(account.as_str()));
    args
}

/// Accept both response shapes for a scalar: the legacy bare value and the
/// current single-field object.
fn parse_field<T: serde::de::DeserializeOwned>(value: &Value, field: &str) -> LinkResult<T> {
    let scalar = match value {
        Value::Object(map) => map.get(field).cloned().unwrap_or(Value::Null),
        other => other.clone(),
    };
    serde_json::from_value(scalar).map_err(|error| LinkError::Serialization(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::Arc;
    use tokio::task::yield_now;
    use vaultlink_channel::PairTransport;

    struct Harness {
        host: CommandDispatcher,
        peer: CommandDispatcher,
        host_channel: Channel,
        transport: Arc<PairTransport>,
    }

    fn linked(config: DispatchConfig) -> Harness {
        let (left, right) = PairTransport::pair();
        let transport = Arc::new(left);
        let host_channel = Channel::new(transport.clone());
        let peer_channel = Channel::new(Arc::new(right));
        let host = CommandDispatcher::new(host_channel.clone(), config.clone());
        let peer = CommandDispatcher::new(peer_channel.clone(), config);
        let _ = host_channel.spawn_pump();
        let _ = peer_channel.spawn_pump();
        let _ = host.spawn_router();
        let _ = peer.spawn_router();
        Harness {
            host,
            peer,
            host_channel,
            transport,
        }
    }

    fn spawn_responder<F>(peer: &CommandDispatcher, handler: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&CommandRequest) -> Option<Result<Value, String>> + Send + Sync + 'static,
    {
        let peer = peer.clone();
        let mut requests = peer.subscribe_requests();
        tokio::spawn(async move {
            while let Ok(request) = requests.recv().await {
                if let Some(outcome) = handler(&request) {
                    let _ = peer.respond(request.correlation_id, outcome).await;
                }
            }
        })
    }

    #[tokio::test]
    async fn call_resolves_with_peer_result() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let _responder = spawn_responder(&link.peer, |request| match request.command.as_str() {
            "ping" => Some(Ok(json!("pong"))),
            _ => Some(Err("unexpected".to_owned())),
        });

        let value = link.host.call("ping", Map::new()).await?;
        assert_eq!(value, json!("pong"));
        assert_eq!(link.host.pending_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_calls_pair_responses_regardless_of_arrival_order() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let mut requests = link.peer.subscribe_requests();
        let peer = link.peer.clone();

        let swapper = tokio::spawn(async move {
            let first = requests.recv().await.expect("first request");
            let second = requests.recv().await.expect("second request");
            // Answer in reverse arrival order.
            peer.respond(second.correlation_id, Ok(json!(second.command.clone())))
                .await
                .expect("respond second");
            peer.respond(first.correlation_id, Ok(json!(first.command.clone())))
                .await
                .expect("respond first");
        });

        let (alpha, beta) = tokio::join!(
            link.host.call("alpha", Map::new()),
            link.host.call("beta", Map::new())
        );
        assert_eq!(alpha?, json!("alpha"));
        assert_eq!(beta?, json!("beta"));
        swapper.await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_and_clears_pending() {
        let link = linked(DispatchConfig::default());
        let error = link
            .host
            .call_with_timeout("ping", Map::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(error, LinkError::Timeout);
        assert_eq!(link.host.pending_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_dropped() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let mut requests = link.peer.subscribe_requests();

        let error = link
            .host
            .call_with_timeout("slow", Map::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(error, LinkError::Timeout);

        // The answer shows up anyway; it must not resolve anything.
        let stale = requests.recv().await?;
        link.peer
            .respond(stale.correlation_id, Ok(json!("too late")))
            .await?;

        let _responder = spawn_responder(&link.peer, |_| Some(Ok(json!("fresh"))));
        let value = link.host.call("next", Map::new()).await?;
        assert_eq!(value, json!("fresh"));
        assert_eq!(link.host.pending_calls(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_fails_every_pending_call() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let host = link.host.clone();
        let call = tokio::spawn(async move { host.call("hang", Map::new()).await });

        while link.host.pending_calls() == 0 {
            yield_now().await;
        }
        link.transport.disconnect();

        let outcome = call.await?;
        assert_eq!(outcome.unwrap_err(), LinkError::ConnectionLost);
        assert_eq!(link.host.pending_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn response_for_unknown_correlation_id_is_ignored() -> Result<()> {
        let link = linked(DispatchConfig::default());
        link.peer
            .respond(CorrelationId(999), Ok(json!("orphan")))
            .await?;

        let _responder = spawn_responder(&link.peer, |_| Some(Ok(json!("ok"))));
        let value = link.host.call("ping", Map::new()).await?;
        assert_eq!(value, json!("ok"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_restarts_the_correlation_numbering_space() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let mut requests = link.peer.subscribe_requests();
        let _responder = spawn_responder(&link.peer, |_| Some(Ok(json!(null))));

        let _ = link.host.call("first", Map::new()).await?;
        let first = requests.recv().await?;

        link.transport.disconnect();
        link.transport.reconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = link.host.call("again", Map::new()).await?;
        let again = requests.recv().await?;
        assert_eq!(first.correlation_id, again.correlation_id);
        Ok(())
    }

    #[tokio::test]
    async fn legacy_ack_probe_classifies_legacy_and_caches() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let detector = CompatibilityDetector::new(link.host.clone());
        let _responder = spawn_responder(&link.peer, |request| {
            (request.command == wire::PROBE).then(|| Ok(json!(LEGACY_ACK)))
        });

        assert_eq!(detector.variant().await, ProtocolVariant::Legacy);
        assert_eq!(detector.cached(), ProtocolVariant::Legacy);
        Ok(())
    }

    #[tokio::test]
    async fn capability_payload_classifies_current() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let detector = CompatibilityDetector::new(link.host.clone());
        let _responder = spawn_responder(&link.peer, |request| {
            (request.command == wire::PROBE).then(|| Ok(json!({ "version": 2 })))
        });

        assert_eq!(detector.variant().await, ProtocolVariant::Current);
        Ok(())
    }

    #[tokio::test]
    async fn probe_refusal_classifies_legacy() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let detector = CompatibilityDetector::new(link.host.clone());
        let _responder =
            spawn_responder(&link.peer, |_| Some(Err("unknown command".to_owned())));

        assert_eq!(detector.variant().await, ProtocolVariant::Legacy);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_leaves_classification_unknown() {
        let link = linked(DispatchConfig {
            probe_timeout: Duration::from_millis(50),
            ..DispatchConfig::default()
        });
        let detector = CompatibilityDetector::new(link.host.clone());

        assert_eq!(detector.variant().await, ProtocolVariant::Unknown);
        // Dependents must route the unknown peer as legacy.
        assert_eq!(
            detector.variant().await.effective(),
            ProtocolVariant::Legacy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_invalidates_the_cached_variant() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let detector = CompatibilityDetector::new(link.host.clone());
        let _invalidator = detector.spawn_invalidator(&link.host_channel);
        let _responder = spawn_responder(&link.peer, |request| {
            (request.command == wire::PROBE).then(|| Ok(json!({ "version": 2 })))
        });

        assert_eq!(detector.variant().await, ProtocolVariant::Current);
        link.transport.disconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(detector.cached(), ProtocolVariant::Unknown);
        Ok(())
    }

    fn legacy_peer(link: &Harness) -> tokio::task::JoinHandle<()> {
        spawn_responder(&link.peer, |request| match request.command.as_str() {
            wire::PROBE => Some(Ok(json!(LEGACY_ACK))),
            wire::LEGACY_STATUS => Some(Ok(json!("locked"))),
            wire::LEGACY_UNLOCK => Some(Ok(json!(true))),
            wire::LEGACY_GET_KEY => Some(Ok(json!("legacy-key-material"))),
            _ => Some(Err("unknown command".to_owned())),
        })
    }

    fn current_peer(link: &Harness) -> tokio::task::JoinHandle<()> {
        spawn_responder(&link.peer, |request| match request.command.as_str() {
            wire::PROBE => Some(Ok(json!({ "version": 2 }))),
            wire::STATUS => Some(Ok(json!({ "status": "unlocked" }))),
            wire::UNLOCK => Some(Ok(json!({ "unlocked": true }))),
            wire::GET_KEY => Some(Err(DENIED_ERROR.to_owned())),
            wire::BIOMETRICS_STATUS => Some(Ok(json!({ "biometrics": "available" }))),
            _ => Some(Err("unknown command".to_owned())),
        })
    }

    fn commands(link: &Harness) -> PeerCommands {
        let detector = CompatibilityDetector::new(link.host.clone());
        PeerCommands::new(link.host.clone(), detector)
    }

    #[tokio::test]
    async fn remote_status_speaks_the_legacy_shape() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let _peer = legacy_peer(&link);
        let commands = commands(&link);

        let status = commands
            .remote_status(&AccountId::from("acct"), Duration::from_secs(1))
            .await?;
        assert_eq!(status, VaultStatus::Locked);
        assert!(commands.unlock(&AccountId::from("acct")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn remote_status_speaks_the_current_shape() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let _peer = current_peer(&link);
        let commands = commands(&link);

        let status = commands
            .remote_status(&AccountId::from("acct"), Duration::from_secs(1))
            .await?;
        assert_eq!(status, VaultStatus::Unlocked);
        Ok(())
    }

    #[tokio::test]
    async fn key_request_surfaces_explicit_denial() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let _peer = current_peer(&link);
        let commands = commands(&link);

        let error = commands
            .request_unlock_key(&AccountId::from("acct"))
            .await
            .unwrap_err();
        assert!(error.is_denied());
        Ok(())
    }

    #[tokio::test]
    async fn key_request_carries_material_from_a_legacy_peer() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let _peer = legacy_peer(&link);
        let commands = commands(&link);

        let key = commands.request_unlock_key(&AccountId::from("acct")).await?;
        assert_eq!(key.expose(), "legacy-key-material");
        Ok(())
    }

    #[tokio::test]
    async fn biometrics_fails_closed_on_a_legacy_peer() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let _peer = legacy_peer(&link);
        let commands = commands(&link);

        assert_eq!(
            commands.biometrics_status().await,
            BiometricsStatus::Unavailable
        );
        Ok(())
    }

    #[tokio::test]
    async fn biometrics_reports_availability_on_a_current_peer() -> Result<()> {
        let link = linked(DispatchConfig::default());
        let _peer = current_peer(&link);
        let commands = commands(&link);

        assert_eq!(
            commands.biometrics_status().await,
            BiometricsStatus::Available
        );
        Ok(())
    }
}
