//! Out-of-band approval brokering.
//!
//! The host process asks "should this sensitive operation proceed?", the
//! prompt travels to the client process as a fire-and-forget push, and the
//! human's answer comes back whenever it comes back. The [`ApprovalBroker`]
//! owns the matching table between the two timelines: it allocates request
//! ids from its own numbering space, buffers answers as they arrive, polls
//! the buffer on a short fixed interval, and resolves every request within
//! its time-to-live, denying by default on expiry.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval};
use tracing::{debug, instrument, warn};
use vaultlink_dispatch::{CommandDispatcher, PeerCommands};
use vaultlink_protocol::{ApprovalAnswer, ApprovalId, ApprovalMetadata, ApprovalPrompt, topics};

#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    /// How long an unanswered request stays alive before it denies itself.
    pub ttl: Duration,
    /// How often the answer buffer is scanned.
    pub poll_interval: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BufferedAnswer {
    accepted: bool,
    received_at: Instant,
}

/// Matches eventual human decisions back to their triggering calls.
///
/// Cheap to clone; all clones share the buffer and counters. The buffer is
/// only ever mutated by the broker's own methods, never reached from
/// outside.
#[derive(Clone)]
pub struct ApprovalBroker {
    commands: PeerCommands,
    config: ApprovalConfig,
    next_approval: Arc<AtomicU64>,
    outstanding: Arc<Mutex<HashSet<u64>>>,
    answers: Arc<Mutex<IndexMap<u64, BufferedAnswer>>>,
}

impl ApprovalBroker {
    pub fn new(commands: PeerCommands, config: ApprovalConfig) -> Self {
        Self {
            commands,
            config,
            next_approval: Arc::new(AtomicU64::new(1)),
            outstanding: Arc::new(Mutex::new(HashSet::new())),
            answers: Arc::new(Mutex::new(IndexMap::new())),
        }
    }

    /// Requests currently awaiting an answer. Observability accessor only.
    pub fn outstanding_approvals(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Buffered answers not yet claimed by a waiting request.
    pub fn buffered_answers(&self) -> usize {
        self.answers.lock().len()
    }

    /// Ask the human, via the client process, to approve `subject_id`.
    ///
    /// Resolves `true` only on an explicit accepted answer within the
    /// time-to-live. Expiry, a failed prompt push, and every other outcome
    /// resolve `false`: a sensitive operation never proceeds on ambiguity.
    #[instrument(skip(self, metadata), fields(subject_id = subject_id))]
    pub async fn request_approval(&self, subject_id: &str, metadata: ApprovalMetadata) -> bool {
        let approval_id = ApprovalId(self.next_approval.fetch_add(1, Ordering::Relaxed));
        self.outstanding.lock().insert(approval_id.0);

        let prompt = ApprovalPrompt {
            approval_id,
            subject_id: subject_id.to_owned(),
            metadata,
            created_at: Utc::now(),
        };
        if let Err(error) = self.commands.push_approval_prompt(&prompt).await {
            warn!(%error, %approval_id, "approval prompt could not be pushed, denying");
            self.outstanding.lock().remove(&approval_id.0);
            return false;
        }

        let deadline = Instant::now() + self.config.ttl;
        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let accepted = loop {
            poll.tick().await;
            self.purge_expired();
            if let Some(answer) = self.answers.lock().shift_remove(&approval_id.0) {
                break answer.accepted;
            }
            if Instant::now() >= deadline {
                debug!(%approval_id, "approval expired unanswered, denying");
                break false;
            }
        };
        self.outstanding.lock().remove(&approval_id.0);
        accepted
    }

    /// UI-boundary callback: record the human's answer.
    ///
    /// Answers for unknown, already-resolved, or purged ids are discarded
    /// silently; duplicates and latecomers are expected from an
    /// asynchronous UI. The first answer for an id wins.
    pub fn record_answer(&self, approval_id: ApprovalId, accepted: bool) {
        if !self.outstanding.lock().contains(&approval_id.0) {
            debug!(%approval_id, "discarding answer for unknown or resolved approval");
            return;
        }
        let mut answers = self.answers.lock();
        if answers.contains_key(&approval_id.0) {
            debug!(%approval_id, "duplicate approval answer discarded");
            return;
        }
        answers.insert(
            approval_id.0,
            BufferedAnswer {
                accepted,
                received_at: Instant::now(),
            },
        );
    }

    /// Drop buffered answers older than the time-to-live, bounding memory
    /// under a peer that answers for requests nobody is waiting on anymore.
    fn purge_expired(&self) {
        let ttl = self.config.ttl;
        let now = Instant::now();
        let mut answers = self.answers.lock();
        let before = answers.len();
        answers.retain(|_, answer| now.duration_since(answer.received_at) < ttl);
        let purged = before - answers.len();
        if purged > 0 {
            debug!(purged, "purged expired approval answers");
        }
    }

    /// Route answers arriving on the approval-answer push topic into the
    /// buffer.
    pub fn spawn_answer_listener(
        &self,
        dispatcher: &CommandDispatcher,
    ) -> tokio::task::JoinHandle<()> {
        let mut pushes = dispatcher.subscribe_pushes();
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                match pushes.recv().await {
                    Ok(push) if push.topic == topics::APPROVAL_ANSWER => {
                        match serde_json::from_value::<ApprovalAnswer>(Value::Object(push.payload))
                        {
                            Ok(answer) => broker.record_answer(answer.approval_id, answer.accepted),
                            Err(error) => warn!(%error, "malformed approval answer dropped"),
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "approval listener lagged, pushes lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("approval answer listener stopped");
        })
    }
}
