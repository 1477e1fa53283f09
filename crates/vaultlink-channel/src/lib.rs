//! Channel adapter between the raw transport and the typed frame world.
//!
//! The [`Channel`] is the exclusive serializer and deserializer for the
//! link: everything outbound goes through [`Channel::send`], everything
//! inbound is decoded by the pump task and fanned out through a broadcast
//! hub in arrival order, with connection-state transitions mirrored into a
//! `watch` channel for the dispatcher and the reconciliation loop.
//!
//! [`PairTransport`] is the in-process loopback implementation of
//! [`TransportPort`] used by tests and the demo daemon; a production
//! embedding supplies its own transport over the platform pipe.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};
use tracing::{debug, instrument, warn};
use vaultlink_protocol::{
    ByteStream, Frame, LinkError, LinkResult, LinkState, StateStream, TransportPort,
};

/// Fan-out hub for decoded inbound frames.
#[derive(Clone, Debug)]
pub struct FrameHub {
    sender: broadcast::Sender<Frame>,
}

impl FrameHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, frame: Frame) {
        let _ = self.sender.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }
}

/// Typed frame channel over one logical connection to the peer process.
///
/// Cheap to clone; all clones share the same transport, hub, and state.
#[derive(Clone)]
pub struct Channel {
    transport: Arc<dyn TransportPort>,
    frames: FrameHub,
    state_tx: Arc<watch::Sender<LinkState>>,
    state_rx: watch::Receiver<LinkState>,
}

impl Channel {
    pub fn new(transport: Arc<dyn TransportPort>) -> Self {
        let initial = if transport.is_connected() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        let (state_tx, state_rx) = watch::channel(initial);
        Self {
            transport,
            frames: FrameHub::new(256),
            state_tx: Arc::new(state_tx),
            state_rx,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    /// Serialize and deliver one frame, best effort with no delivery ack.
    #[instrument(skip(self, frame))]
    pub async fn send(&self, frame: &Frame) -> LinkResult<()> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let bytes = frame.to_bytes()?;
        self.transport.send(bytes).await
    }

    /// Every decoded inbound frame, in arrival order, no deduplication.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.frames.subscribe()
    }

    /// Connection-state transitions mirrored from the transport.
    pub fn state_receiver(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Decode inbound payloads and mirror state transitions until the
    /// transport streams end. Undecodable frames are logged and dropped.
    pub fn spawn_pump(&self) -> tokio::task::JoinHandle<()> {
        let transport = self.transport.clone();
        let frames = self.frames.clone();
        let state_tx = self.state_tx.clone();
        tokio::spawn(async move {
            let mut inbound = transport.frames();
            let mut states = transport.states();
            loop {
                tokio::select! {
                    payload = inbound.next() => match payload {
                        Some(bytes) => match Frame::from_bytes(&bytes) {
                            Ok(frame) => frames.publish(frame),
                            Err(error) => warn!(%error, "dropping undecodable frame"),
                        },
                        None => break,
                    },
                    state = states.next() => match state {
                        Some(state) => {
                            debug!(?state, "transport state transition");
                            let _ = state_tx.send(state);
                        }
                        None => break,
                    },
                }
            }
            // A transport whose streams ended is gone for good.
            let _ = state_tx.send(LinkState::Disconnected);
            debug!("channel pump stopped");
        })
    }
}

struct PairShared {
    state: watch::Sender<LinkState>,
}

/// One endpoint of an in-process transport pair.
///
/// Bytes sent on one endpoint arrive on the other in order. Disconnecting
/// either endpoint transitions both sides; payloads already in flight may
/// still be delivered, matching a real pipe draining its buffer.
pub struct PairTransport {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    shared: Arc<PairShared>,
}

impl PairTransport {
    /// Two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let (to_a_tx, to_a_rx) = mpsc::unbounded_channel();
        let (to_b_tx, to_b_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LinkState::Connected);
        let shared = Arc::new(PairShared { state });
        (
            Self {
                outbound: to_b_tx,
                inbound: Mutex::new(Some(to_a_rx)),
                shared: shared.clone(),
            },
            Self {
                outbound: to_a_tx,
                inbound: Mutex::new(Some(to_b_rx)),
                shared,
            },
        )
    }

    /// Drop the link for both endpoints.
    pub fn disconnect(&self) {
        let _ = self.shared.state.send(LinkState::Disconnected);
    }

    /// Restore the link for both endpoints.
    pub fn reconnect(&self) {
        let _ = self.shared.state.send(LinkState::Connected);
    }
}

#[async_trait]
impl TransportPort for PairTransport {
    async fn send(&self, bytes: Vec<u8>) -> LinkResult<()> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.outbound
            .send(bytes)
            .map_err(|_| LinkError::NotConnected)
    }

    fn frames(&self) -> ByteStream {
        match self.inbound.lock().take() {
            Some(receiver) => UnboundedReceiverStream::new(receiver).boxed(),
            None => futures_util::stream::empty().boxed(),
        }
    }

    fn states(&self) -> StateStream {
        WatchStream::new(self.shared.state.subscribe()).boxed()
    }

    fn is_connected(&self) -> bool {
        self.shared.state.borrow().is_connected()
    }
}
