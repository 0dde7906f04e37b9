//! In-memory transport used by the demo binary and the test suites.
//!
//! Every link is a pair of [`LoopbackChannel`]s sharing one state cell;
//! data sent on one end is delivered, in order, as `ChannelEvent::Data`
//! on the other. Faults are injected through the network (unresponsive
//! endpoints) or on a channel (backlog, degraded signal, failed restart).

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::connection::channel::{
    ChannelEvent, ChannelHandle, ChannelState, PeerChannel, Transport,
};
use crate::core::error::TransportError;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Network ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<String, mpsc::UnboundedSender<ChannelHandle>>,
    unresponsive: HashSet<String>,
}

/// A shared in-memory "internet" of named endpoints.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, local_id: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            local_id: local_id.into(),
        }
    }

    /// Dials to an unresponsive endpoint return a channel that never opens.
    pub fn set_unresponsive(&self, endpoint_id: &str, unresponsive: bool) {
        let mut state = lock(&self.state);
        if unresponsive {
            state.unresponsive.insert(endpoint_id.to_string());
        } else {
            state.unresponsive.remove(endpoint_id);
        }
    }

    pub fn is_listening(&self, endpoint_id: &str) -> bool {
        lock(&self.state)
            .listeners
            .get(endpoint_id)
            .is_some_and(|tx| !tx.is_closed())
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    local_id: String,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    async fn dial(&self, endpoint_id: &str) -> Result<ChannelHandle, TransportError> {
        let mut state = lock(&self.network.state);

        if state.unresponsive.contains(endpoint_id) {
            let (mine, _theirs) = link(&self.local_id, endpoint_id, ChannelState::Connecting);
            debug!(event = "loopback_dial_stalled", from = %self.local_id, to = %endpoint_id, "Endpoint unresponsive");
            return Ok(mine.into_handle());
        }

        let listener = state
            .listeners
            .get(endpoint_id)
            .ok_or_else(|| TransportError::UnknownEndpoint(endpoint_id.to_string()))?;

        let (mine, theirs) = link(&self.local_id, endpoint_id, ChannelState::Open);
        if listener.send(theirs.into_handle()).is_err() {
            state.listeners.remove(endpoint_id);
            return Err(TransportError::UnknownEndpoint(endpoint_id.to_string()));
        }
        debug!(event = "loopback_dial", from = %self.local_id, to = %endpoint_id, "Link established");
        Ok(mine.into_handle())
    }

    async fn listen(
        &self,
        endpoint_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChannelHandle>, TransportError> {
        let mut state = lock(&self.network.state);
        if state
            .listeners
            .get(endpoint_id)
            .is_some_and(|tx| !tx.is_closed())
        {
            return Err(TransportError::EndpointInUse(endpoint_id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.insert(endpoint_id.to_string(), tx);
        Ok(rx)
    }

    async fn stop_listening(&self, endpoint_id: &str) {
        lock(&self.network.state).listeners.remove(endpoint_id);
    }
}

// ── Channel ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Link {
    state: Mutex<ChannelState>,
}

/// One end of an in-memory link.
#[derive(Debug)]
pub struct LoopbackChannel {
    remote_id: String,
    link: Arc<Link>,
    own_events: mpsc::UnboundedSender<ChannelEvent>,
    peer_events: mpsc::UnboundedSender<ChannelEvent>,
    buffered: AtomicUsize,
    restart_ok: AtomicBool,
}

/// A loopback channel plus its event stream, before being type-erased.
pub struct LoopbackEnd {
    pub channel: Arc<LoopbackChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl LoopbackEnd {
    pub fn into_handle(self) -> ChannelHandle {
        ChannelHandle {
            channel: self.channel,
            events: self.events,
        }
    }
}

/// An already-open link between `a` and `b`, outside of any network.
pub fn pair(a: &str, b: &str) -> (LoopbackEnd, LoopbackEnd) {
    link(a, b, ChannelState::Open)
}

fn link(a: &str, b: &str, initial: ChannelState) -> (LoopbackEnd, LoopbackEnd) {
    let shared = Arc::new(Link {
        state: Mutex::new(initial),
    });
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    if initial == ChannelState::Open {
        let _ = a_tx.send(ChannelEvent::Open);
        let _ = b_tx.send(ChannelEvent::Open);
    }

    let end_a = LoopbackChannel {
        remote_id: b.to_string(),
        link: shared.clone(),
        own_events: a_tx.clone(),
        peer_events: b_tx.clone(),
        buffered: AtomicUsize::new(0),
        restart_ok: AtomicBool::new(true),
    };
    let end_b = LoopbackChannel {
        remote_id: a.to_string(),
        link: shared,
        own_events: b_tx,
        peer_events: a_tx,
        buffered: AtomicUsize::new(0),
        restart_ok: AtomicBool::new(true),
    };

    (
        LoopbackEnd {
            channel: Arc::new(end_a),
            events: a_rx,
        },
        LoopbackEnd {
            channel: Arc::new(end_b),
            events: b_rx,
        },
    )
}

impl LoopbackChannel {
    /// Pretend this many bytes are waiting in the send buffer.
    pub fn set_buffered_amount(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::Relaxed);
    }

    pub fn set_restart_succeeds(&self, ok: bool) {
        self.restart_ok.store(ok, Ordering::Relaxed);
    }

    /// Emit a transient-failure signal to this end's owner.
    pub fn signal_degraded(&self) {
        let _ = self.own_events.send(ChannelEvent::Degraded);
    }

    /// Fail the link with an error on this end; the remote end sees a close.
    pub fn fail(&self, reason: &str) {
        if self.mark_closed() {
            let _ = self.own_events.send(ChannelEvent::Error(reason.to_string()));
            let _ = self.peer_events.send(ChannelEvent::Closed);
        }
    }

    /// Returns true if this call transitioned the link to closed.
    fn mark_closed(&self) -> bool {
        let mut state = lock(&self.link.state);
        let was_closed = *state == ChannelState::Closed;
        *state = ChannelState::Closed;
        !was_closed
    }
}

#[async_trait]
impl PeerChannel for LoopbackChannel {
    fn endpoint_id(&self) -> &str {
        &self.remote_id
    }

    fn state(&self) -> ChannelState {
        *lock(&self.link.state)
    }

    async fn send(&self, message: String) -> Result<(), TransportError> {
        if self.state() != ChannelState::Open {
            return Err(TransportError::Closed(self.remote_id.clone()));
        }
        self.peer_events
            .send(ChannelEvent::Data(message))
            .map_err(|_| TransportError::Send {
                endpoint: self.remote_id.clone(),
                reason: "remote end dropped".into(),
            })
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    async fn restart(&self) -> Result<(), TransportError> {
        if self.state() == ChannelState::Open && self.restart_ok.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(TransportError::RestartFailed(self.remote_id.clone()))
        }
    }

    async fn close(&self) {
        if self.mark_closed() {
            let _ = self.own_events.send(ChannelEvent::Closed);
            let _ = self.peer_events.send(ChannelEvent::Closed);
        }
    }
}
