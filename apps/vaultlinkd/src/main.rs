//! VaultLink demo daemon.
//!
//! Runs both ends of the link inside one process: a full [`VaultLink`] as
//! the host side, and a scripted peer on the other end of an in-memory
//! transport pair that answers the capability probe, serves status and key
//! commands, and approves prompts after a configurable delay.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde_json::{Value, json};
use tokio::time::Duration;
use tracing::{info, warn};
use vaultlink_channel::{Channel, PairTransport};
use vaultlink_core::{LinkBuilder, VaultLink};
use vaultlink_dispatch::{CommandDispatcher, DispatchConfig, wire};
use vaultlink_protocol::{
    AccountId, ApprovalMetadata, ApprovalPrompt, DENIED_ERROR, LEGACY_ACK, VaultPort, VaultStatus,
    topics,
};
use vaultlink_reconcile::{InMemoryVault, ReconcileConfig, StaticSyncPolicy};

#[derive(Debug, Parser)]
#[command(name = "vaultlinkd")]
#[command(about = "VaultLink demo daemon: a host process linked to an emulated client peer")]
struct Cli {
    /// Emulate an out-of-date peer speaking the legacy command shapes.
    #[arg(long)]
    legacy_peer: bool,
    /// Make the peer refuse the unlock-key transfer.
    #[arg(long)]
    deny_key_transfer: bool,
    /// How long the emulated human takes to answer the approval prompt.
    #[arg(long, default_value_t = 500)]
    approval_delay_ms: u64,
    #[arg(long, default_value = "demo-account")]
    account: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .compact()
        .init();

    let cli = Cli::parse();
    let account = AccountId::from_string(cli.account.clone());

    let (host_end, peer_end) = PairTransport::pair();

    // The emulated client process on the far end of the pair.
    let peer_channel = Channel::new(Arc::new(peer_end));
    let peer = CommandDispatcher::new(peer_channel.clone(), DispatchConfig::default());
    let pump = peer_channel.spawn_pump();
    let router = peer.spawn_router();
    let responder = spawn_peer_responder(&peer, cli.legacy_peer, cli.deny_key_transfer);
    let answerer = spawn_peer_approver(&peer, Duration::from_millis(cli.approval_delay_ms));

    // The host side: a locked local vault behind the full link stack.
    let vault = Arc::new(InMemoryVault::with_status(
        account.clone(),
        VaultStatus::Locked,
    ));
    let link = LinkBuilder::new(
        Arc::new(host_end),
        vault.clone(),
        Arc::new(StaticSyncPolicy::enabled()),
    )
    .reconcile_config(ReconcileConfig {
        tick: Duration::from_millis(500),
        ..ReconcileConfig::default()
    })
    .build();
    link.set_active_account(Some(account.clone()));

    let variant = link.peer_variant().await;
    info!(?variant, "peer protocol classified");

    demo_reconciliation(&link, &vault, &account, cli.deny_key_transfer).await?;
    demo_approval(&link).await;

    info!(
        biometrics = ?link.biometrics_status().await,
        "peer biometrics capability"
    );

    link.shutdown();
    for task in [pump, router, responder, answerer] {
        task.abort();
    }
    Ok(())
}

/// Wait for the reconciliation loop to resolve the locked/unlocked split.
async fn demo_reconciliation(
    link: &VaultLink,
    vault: &Arc<InMemoryVault>,
    account: &AccountId,
    expect_denial: bool,
) -> Result<()> {
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if !vault.applied_keys().is_empty() {
            info!(
                status = ?vault.status(account).await?,
                "reconciliation applied the peer's unlock key"
            );
            return Ok(());
        }
        if expect_denial && !link.can_attempt_key_transfer(account) {
            warn!("peer denied the key transfer, account is in trust-denial cooldown");
            return Ok(());
        }
    }
    warn!("reconciliation made no progress within the demo window");
    Ok(())
}

async fn demo_approval(link: &VaultLink) {
    let accepted = link
        .request_approval(
            "login-item-42",
            ApprovalMetadata {
                display_name: "example.com".to_owned(),
                process_name: "vaultlinkd".to_owned(),
            },
        )
        .await;
    info!(accepted, "approval round trip finished");
}

fn spawn_peer_responder(
    peer: &CommandDispatcher,
    legacy: bool,
    deny_key_transfer: bool,
) -> tokio::task::JoinHandle<()> {
    let peer = peer.clone();
    let mut requests = peer.subscribe_requests();
    tokio::spawn(async move {
        while let Ok(request) = requests.recv().await {
            let outcome = answer_command(&request.command, legacy, deny_key_transfer);
            let _ = peer.respond(request.correlation_id, outcome).await;
        }
    })
}

fn answer_command(command: &str, legacy: bool, deny_key_transfer: bool) -> Result<Value, String> {
    if legacy {
        return match command {
            wire::PROBE => Ok(json!(LEGACY_ACK)),
            wire::LEGACY_STATUS => Ok(json!("unlocked")),
            wire::LEGACY_GET_KEY if deny_key_transfer => Err(DENIED_ERROR.to_owned()),
            wire::LEGACY_GET_KEY => Ok(json!("demo-key-material")),
            wire::LEGACY_UNLOCK => Ok(json!(true)),
            _ => Err("unknown command".to_owned()),
        };
    }
    match command {
        wire::PROBE => Ok(json!({ "version": 2 })),
        wire::STATUS => Ok(json!({ "status": "unlocked" })),
        wire::GET_KEY if deny_key_transfer => Err(DENIED_ERROR.to_owned()),
        wire::GET_KEY => Ok(json!({ "key": "demo-key-material" })),
        wire::UNLOCK => Ok(json!({ "unlocked": true })),
        wire::BIOMETRICS_STATUS => Ok(json!({ "biometrics": "available" })),
        _ => Err("unknown command".to_owned()),
    }
}

/// Emulate the human on the client side: approve every prompt after a delay.
fn spawn_peer_approver(
    peer: &CommandDispatcher,
    delay: Duration,
) -> tokio::task::JoinHandle<()> {
    let peer = peer.clone();
    let mut pushes = peer.subscribe_pushes();
    tokio::spawn(async move {
        while let Ok(push) = pushes.recv().await {
            if push.topic != topics::APPROVAL_PROMPT {
                continue;
            }
            let prompt: ApprovalPrompt = match serde_json::from_value(Value::Object(push.payload)) {
                Ok(prompt) => prompt,
                Err(error) => {
                    warn!(%error, "malformed approval prompt");
                    continue;
                }
            };
            info!(
                approval_id = prompt.approval_id.0,
                subject = %prompt.subject_id,
                "prompt received, answering shortly"
            );
            tokio::time::sleep(delay).await;
            let payload = match json!({
                "approval_id": prompt.approval_id,
                "accepted": true,
            }) {
                Value::Object(map) => map,
                _ => continue,
            };
            let _ = peer.push(topics::APPROVAL_ANSWER, payload).await;
        }
    })
}
