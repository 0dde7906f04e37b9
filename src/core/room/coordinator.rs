//! Room lifecycle: hosting, joining, peer-joined/dissolve broadcasts and
//! guest-side reconnect with backoff.
//!
//! A coordinator owns one `ConnectionManager` and one `TransferEngine` and
//! runs a dispatcher task that routes session events between them. Background
//! tasks of the current room (accept loop, ping loop, reconnect) share a
//! lifetime token that is cancelled when the room is torn down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::connection::{
    ChannelHandle, ConnectionManager, ReconnectPolicy, SessionEvent, SessionRegistry, Transport,
};
use crate::core::engine::TransferEngine;
use crate::core::error::RoomError;
use crate::core::events::RoomEvent;
use crate::core::protocol::WireMessage;
use crate::core::quality::{QualityMonitor, QualitySample};
use crate::core::room::code::{generate_room_code, normalize_room_code, rendezvous_id};
use crate::core::room::status::{ConnectionStatus, RoomState};
use crate::core::transfer::{OutgoingFile, SendJob, TransferRecord};
use crate::utils::sos::SignalOfStop;

pub struct RoomCoordinator {
    inner: Arc<RoomInner>,
    alive: SignalOfStop,
}

struct RoomInner {
    transport: Arc<dyn Transport>,
    settings: Settings,
    manager: ConnectionManager,
    registry: SessionRegistry,
    engine: TransferEngine,
    quality: QualityMonitor,
    room: RwLock<Option<RoomState>>,
    status: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<RoomEvent>,
    lifetime: Mutex<SignalOfStop>,
    reconnecting: AtomicBool,
}

impl Drop for RoomCoordinator {
    fn drop(&mut self) {
        self.alive.cancel();
        self.inner.lifetime().cancel();
    }
}

impl RoomCoordinator {
    /// Build a coordinator on `transport`. Must be called inside a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: Settings,
    ) -> (Self, mpsc::UnboundedReceiver<RoomEvent>) {
        let registry = SessionRegistry::new();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let quality = QualityMonitor::default();

        let manager = ConnectionManager::new(registry.clone(), session_tx, settings.open_timeout());
        let engine = TransferEngine::new(
            registry.clone(),
            settings.clone(),
            events_tx.clone(),
            quality.clone(),
        );
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);

        let inner = Arc::new(RoomInner {
            transport,
            settings,
            manager,
            registry,
            engine,
            quality,
            room: RwLock::new(None),
            status,
            events: events_tx,
            lifetime: Mutex::new(SignalOfStop::new()),
            reconnecting: AtomicBool::new(false),
        });

        let alive = SignalOfStop::new();
        tokio::spawn(dispatch(inner.clone(), session_rx, alive.clone()));

        (Self { inner, alive }, events_rx)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Host a new room and return its code.
    pub async fn create_room(&self) -> Result<String, RoomError> {
        let inner = &self.inner;
        let mut room = inner.room.write().await;
        if room.as_ref().is_some_and(RoomState::is_active) {
            return Err(RoomError::AlreadyActive);
        }

        let code = generate_room_code();
        let endpoint = rendezvous_id(&code);
        let incoming = inner.transport.listen(&endpoint).await?;

        *room = Some(RoomState::hosting(code.clone()));
        drop(room);

        let lifetime = inner.begin_lifetime();
        tokio::spawn(accept_loop(inner.manager.clone(), incoming, lifetime.clone()));
        tokio::spawn(ping_loop(inner.clone(), lifetime));
        inner.set_status(ConnectionStatus::Connecting);

        info!(event = "room_created", %code, %endpoint, "Hosting room");
        Ok(code)
    }

    /// Join the room hosted under `code`.
    ///
    /// Returns once the session with the host is ready. On failure the room
    /// is left in `Error` status.
    pub async fn join_room(&self, code: &str) -> Result<(), RoomError> {
        let code = normalize_room_code(code)?;
        let endpoint = rendezvous_id(&code);
        self.enter_as_guest(Some(code), &endpoint).await
    }

    /// Connect straight to a known endpoint, outside of any room code.
    ///
    /// While hosting this adds one more peer; otherwise the endpoint is
    /// treated as the host to reconnect to.
    pub async fn connect_to_peer(&self, endpoint_id: &str) -> Result<(), RoomError> {
        let hosting = self
            .inner
            .room
            .read()
            .await
            .as_ref()
            .is_some_and(|r| r.is_host && r.is_active());
        if !hosting {
            return self.enter_as_guest(None, endpoint_id).await;
        }
        self.inner
            .manager
            .connect(&*self.inner.transport, endpoint_id)
            .await?;
        self.inner.await_handshake(endpoint_id).await
    }

    async fn enter_as_guest(&self, code: Option<String>, endpoint: &str) -> Result<(), RoomError> {
        let inner = &self.inner;
        {
            let mut room = inner.room.write().await;
            if room.as_ref().is_some_and(RoomState::is_active) {
                return Err(RoomError::AlreadyActive);
            }
            *room = Some(RoomState::guest(code.clone(), endpoint.to_string()));
        }
        let lifetime = inner.begin_lifetime();
        tokio::spawn(ping_loop(inner.clone(), lifetime));
        inner.set_status(ConnectionStatus::Connecting);
        info!(event = "room_join", code = ?code, %endpoint, "Joining room");

        let joined = match inner.manager.connect(&*inner.transport, endpoint).await {
            Ok(_) => inner.await_handshake(endpoint).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &joined {
            error!(event = "room_join_failed", %endpoint, error = %e, "Could not join room");
            inner
                .teardown(ConnectionStatus::Error {
                    message: format!("could not join room: {e}"),
                })
                .await;
        }
        joined
    }

    /// Leave the current room. A host dissolves it for everyone.
    pub async fn leave_room(&self) -> Result<(), RoomError> {
        let inner = &self.inner;
        let state = inner
            .room
            .read()
            .await
            .as_ref()
            .map(|r| (r.is_host, r.is_active()));
        let is_host = match state {
            None => return Err(RoomError::NotInRoom),
            Some((_, false)) => {
                // Nothing left to close; just forget the dissolved room.
                inner.room.write().await.take();
                inner.set_status(ConnectionStatus::Disconnected);
                return Ok(());
            }
            Some((is_host, true)) => is_host,
        };

        if is_host {
            let sessions = inner.registry.ready_sessions().await;
            for session in &sessions {
                if let Err(e) = session.send_control(&WireMessage::RoomDissolved).await {
                    debug!(event = "dissolve_not_sent", peer = %session.peer_id, error = %e, "Peer missed dissolve notice");
                }
            }
            info!(event = "room_dissolved", peers = sessions.len(), "Dissolving room");
        } else {
            info!(event = "room_left", "Leaving room");
        }
        inner.teardown(ConnectionStatus::Disconnected).await;
        Ok(())
    }

    // ── Transfers ────────────────────────────────────────────────────────────

    pub async fn send_text(&self, text: impl Into<String>) -> Result<Uuid, RoomError> {
        Ok(self.inner.engine.send_text(text).await?)
    }

    pub async fn send_file(&self, file: OutgoingFile) -> Result<SendJob, RoomError> {
        Ok(self.inner.engine.send_file(file).await?)
    }

    pub async fn cancel_transfer(&self, item_id: Uuid) -> Result<(), RoomError> {
        Ok(self.inner.engine.cancel_transfer(item_id).await?)
    }

    // ── Observables ──────────────────────────────────────────────────────────

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub async fn transfers(&self) -> Vec<TransferRecord> {
        self.inner.engine.records().await
    }

    pub fn quality(&self) -> Vec<QualitySample> {
        self.inner.quality.samples()
    }

    pub async fn room(&self) -> Option<RoomState> {
        self.inner.room.read().await.clone()
    }

    pub fn local_id(&self) -> &str {
        self.inner.transport.local_id()
    }
}

impl RoomInner {
    fn lifetime(&self) -> SignalOfStop {
        self.lifetime
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Swap in a fresh lifetime token for a new room, cancelling the old one.
    fn begin_lifetime(&self) -> SignalOfStop {
        let fresh = SignalOfStop::new();
        let old = std::mem::replace(
            &mut *self.lifetime.lock().unwrap_or_else(|p| p.into_inner()),
            fresh.clone(),
        );
        old.cancel();
        fresh
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status.clone();
            true
        });
        if changed {
            debug!(event = "room_status", status = %status, "Status changed");
            self.emit(RoomEvent::Status(status));
        }
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    async fn await_handshake(&self, endpoint: &str) -> Result<(), RoomError> {
        let limit = self.settings.handshake_timeout();
        if self.registry.wait_ready(endpoint, limit).await.is_some() {
            return Ok(());
        }
        self.manager.close_peer(endpoint).await;
        Err(RoomError::HandshakeTimeout(endpoint.to_string()))
    }

    /// Tear the current room down and settle on `status`.
    ///
    /// A dissolved room stays visible, flagged, until the next create or join.
    async fn teardown(&self, status: ConnectionStatus) {
        let room = {
            let mut slot = self.room.write().await;
            match (&status, slot.as_mut()) {
                (ConnectionStatus::Dissolved, Some(room)) => {
                    room.dissolve();
                    Some(room.clone())
                }
                _ => slot.take(),
            }
        };
        self.lifetime().cancel();
        if let Some(RoomState {
            is_host: true,
            code: Some(code),
            ..
        }) = &room
        {
            self.transport.stop_listening(&rendezvous_id(code)).await;
        }
        self.manager.close_all().await;
        self.engine.shutdown().await;
        self.set_status(status);
    }

    // ── Session events ───────────────────────────────────────────────────────

    async fn on_session_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Ready { peer_id, .. } => self.on_peer_ready(peer_id).await,
            SessionEvent::Message { peer_id, message } => {
                if let Some(rest) = self.engine.on_message(&peer_id, message).await {
                    self.on_room_message(&peer_id, rest).await;
                }
            }
            SessionEvent::Chunk {
                peer_id,
                item_id,
                offset,
                data,
            } => self.engine.on_chunk(&peer_id, item_id, offset, data).await,
            SessionEvent::Pong { peer_id, id } => {
                if let Some(sample) = self.quality.complete_ping(&peer_id, id) {
                    self.emit(RoomEvent::Quality(sample));
                }
            }
            SessionEvent::Closed { peer_id, .. } => self.on_peer_lost(peer_id, None).await,
            SessionEvent::Errored { peer_id, error, .. } => {
                self.on_peer_lost(peer_id, Some(error)).await
            }
        }
    }

    async fn on_peer_ready(self: &Arc<Self>, peer_id: String) {
        let is_host = match self.room.write().await.as_mut() {
            Some(room) if room.is_active() => {
                room.peers.insert(peer_id.clone());
                Some(room.is_host)
            }
            _ => None,
        };
        let Some(is_host) = is_host else {
            debug!(event = "ready_without_room", peer = %peer_id, "Dropping stray session");
            self.manager.close_peer(&peer_id).await;
            return;
        };

        info!(event = "peer_joined", peer = %peer_id, host = is_host, "Peer ready");
        self.set_status(ConnectionStatus::Connected);
        self.emit(RoomEvent::PeerJoined {
            peer_id: peer_id.clone(),
        });

        if is_host {
            let inner = self.clone();
            let lifetime = self.lifetime();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(inner.settings.peer_joined_delay()) => {}
                    _ = lifetime.wait() => return,
                }
                inner.announce_join(&peer_id).await;
            });
        }
    }

    /// Tell every other ready peer that `newcomer` joined.
    async fn announce_join(&self, newcomer: &str) {
        for session in self.registry.ready_sessions().await {
            if session.peer_id == newcomer {
                continue;
            }
            if let Err(e) = session.send_control(&WireMessage::PeerJoined).await {
                debug!(event = "join_notice_failed", peer = %session.peer_id, error = %e, "Could not announce join");
            }
        }
    }

    async fn on_room_message(&self, peer_id: &str, message: WireMessage) {
        match message {
            WireMessage::PeerJoined => self.emit(RoomEvent::JoinAnnounced {
                via: peer_id.to_string(),
            }),
            WireMessage::RoomDissolved => {
                let is_guest = self
                    .room
                    .read()
                    .await
                    .as_ref()
                    .is_some_and(|r| !r.is_host && r.is_active());
                if is_guest {
                    info!(event = "room_dissolved_by_host", peer = %peer_id, "Host closed the room");
                    self.teardown(ConnectionStatus::Dissolved).await;
                }
            }
            other => {
                debug!(event = "room_message_ignored", peer = %peer_id, kind = other.kind(), "Unhandled message")
            }
        }
    }

    async fn on_peer_lost(self: &Arc<Self>, peer_id: String, error: Option<String>) {
        let room = {
            let mut room = self.room.write().await;
            if let Some(room) = room.as_mut() {
                room.peers.remove(&peer_id);
            }
            room.clone()
        };
        self.quality.forget_peer(&peer_id);
        self.engine.on_peer_lost(&peer_id).await;
        match &error {
            Some(e) => warn!(event = "peer_lost", peer = %peer_id, error = %e, "Peer session errored"),
            None => info!(event = "peer_left", peer = %peer_id, "Peer session closed"),
        }
        self.emit(RoomEvent::PeerLeft {
            peer_id: peer_id.clone(),
            error,
        });

        let Some(room) = room.filter(RoomState::is_active) else {
            return;
        };
        if !self.registry.ready_peer_ids().await.is_empty() {
            return;
        }
        if room.is_host {
            info!(event = "room_waiting", "No guests left, waiting for peers");
            self.set_status(ConnectionStatus::Connecting);
            return;
        }
        let Some(endpoint) = room.host_endpoint else {
            return;
        };
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(reconnect(self.clone(), endpoint, self.lifetime()));
    }
}

async fn dispatch(
    inner: Arc<RoomInner>,
    mut sessions: mpsc::UnboundedReceiver<SessionEvent>,
    alive: SignalOfStop,
) {
    loop {
        let event = tokio::select! {
            event = sessions.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = alive.wait() => break,
        };
        inner.on_session_event(event).await;
    }
    debug!(event = "room_dispatcher_stopped", "Dispatcher stopped");
}

async fn accept_loop(
    manager: ConnectionManager,
    mut incoming: mpsc::UnboundedReceiver<ChannelHandle>,
    lifetime: SignalOfStop,
) {
    loop {
        let handle = tokio::select! {
            handle = incoming.recv() => match handle {
                Some(handle) => handle,
                None => break,
            },
            _ = lifetime.wait() => break,
        };
        let peer = handle.channel.endpoint_id().to_string();
        let session = manager.accept(handle).await;
        debug!(event = "peer_accepted", %peer, %session, "Incoming channel");
    }
}

async fn ping_loop(inner: Arc<RoomInner>, lifetime: SignalOfStop) {
    let period = inner.settings.ping_interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = lifetime.wait() => return,
        }
        for session in inner.registry.ready_sessions().await {
            let id = inner.quality.begin_ping(&session.peer_id);
            if let Err(e) = session.send_control(&WireMessage::Ping { id }).await {
                debug!(event = "ping_failed", peer = %session.peer_id, error = %e, "Ping not sent");
            }
        }
    }
}

/// Redial the host with exponential backoff until a session is ready again.
async fn reconnect(inner: Arc<RoomInner>, endpoint: String, lifetime: SignalOfStop) {
    let policy = ReconnectPolicy::from(&inner.settings.reconnect);

    for (attempt, delay) in policy.schedule() {
        inner.set_status(ConnectionStatus::Reconnecting {
            attempt,
            max_attempts: policy.max_attempts,
        });
        warn!(
            event = "reconnect_scheduled",
            %endpoint,
            attempt,
            max = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Connection lost, retrying"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = lifetime.wait() => {
                inner.reconnecting.store(false, Ordering::Release);
                return;
            }
        }

        match inner.manager.connect(&*inner.transport, &endpoint).await {
            Ok(_) => {
                let ready = tokio::select! {
                    ready = inner.await_handshake(&endpoint) => ready,
                    _ = lifetime.wait() => {
                        inner.reconnecting.store(false, Ordering::Release);
                        return;
                    }
                };
                match ready {
                    Ok(()) => {
                        info!(event = "reconnected", %endpoint, attempt, "Session restored");
                        inner.reconnecting.store(false, Ordering::Release);
                        return;
                    }
                    Err(e) => warn!(event = "reconnect_failed", %endpoint, attempt, error = %e, "Handshake failed"),
                }
            }
            Err(e) => warn!(event = "reconnect_failed", %endpoint, attempt, error = %e, "Dial failed"),
        }
    }

    inner.reconnecting.store(false, Ordering::Release);
    if lifetime.cancelled() {
        return;
    }
    let message = format!(
        "lost connection to the room: {} reconnect attempts failed",
        policy.max_attempts
    );
    error!(event = "reconnect_exhausted", %endpoint, attempts = policy.max_attempts, "Giving up");
    inner.teardown(ConnectionStatus::Error { message }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::{LoopbackNetwork, LoopbackTransport};
    use crate::core::error::TransportError;
    use crate::core::transfer::TransferStatus;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::Instant;

    async fn wait_status(
        room: &RoomCoordinator,
        want: impl Fn(&ConnectionStatus) -> bool,
    ) -> ConnectionStatus {
        let mut rx = room.status();
        let status = tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| want(s)))
            .await
            .expect("status never reached")
            .expect("status channel closed")
            .clone();
        status
    }

    async fn next_event(
        events: &mut mpsc::UnboundedReceiver<RoomEvent>,
        want: impl Fn(&RoomEvent) -> bool,
    ) -> RoomEvent {
        tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                let event = events.recv().await.expect("event stream closed");
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event never arrived")
    }

    fn room(
        net: &LoopbackNetwork,
        id: &str,
    ) -> (RoomCoordinator, mpsc::UnboundedReceiver<RoomEvent>) {
        RoomCoordinator::new(Arc::new(net.transport(id)), Settings::default())
    }

    #[tokio::test]
    async fn test_join_exchange_and_dissolve() {
        let net = LoopbackNetwork::new();
        let (host, mut host_events) = room(&net, "laptop");
        let (guest, mut guest_events) = room(&net, "phone");

        let code = host.create_room().await.unwrap();
        assert_eq!(*host.status().borrow(), ConnectionStatus::Connecting);
        guest.join_room(&format!(" {} ", code.to_lowercase())).await.unwrap();

        wait_status(&host, |s| *s == ConnectionStatus::Connected).await;
        wait_status(&guest, |s| *s == ConnectionStatus::Connected).await;
        assert!(host.room().await.unwrap().peers.contains("phone"));

        guest.send_text("from the phone").await.unwrap();
        let event = next_event(&mut host_events, |e| matches!(e, RoomEvent::TextReceived { .. })).await;
        let RoomEvent::TextReceived { peer_id, text, .. } = event else {
            unreachable!()
        };
        assert_eq!(peer_id, "phone");
        assert_eq!(text, "from the phone");

        host.leave_room().await.unwrap();
        assert_eq!(*host.status().borrow(), ConnectionStatus::Disconnected);
        wait_status(&guest, |s| *s == ConnectionStatus::Dissolved).await;
        let closed = guest.room().await.unwrap();
        assert!(closed.dissolved);
        assert!(closed.peers.is_empty());
        assert_eq!(closed.code.as_deref(), Some(code.as_str()));
        assert!(host.room().await.is_none());
        assert!(!net.is_listening(&rendezvous_id(&code)));

        // Dissolved is terminal: nothing tries to reconnect.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*guest.status().borrow(), ConnectionStatus::Dissolved);
        while let Ok(event) = guest_events.try_recv() {
            assert!(
                !matches!(event, RoomEvent::Status(ConnectionStatus::Reconnecting { .. })),
                "dissolved guest tried to reconnect"
            );
        }
    }

    #[tokio::test]
    async fn test_dissolved_room_can_be_replaced_or_left() {
        let net = LoopbackNetwork::new();
        let (host, _host_events) = room(&net, "laptop");
        let (guest, _guest_events) = room(&net, "phone");

        let code = host.create_room().await.unwrap();
        guest.join_room(&code).await.unwrap();
        host.leave_room().await.unwrap();
        wait_status(&guest, |s| *s == ConnectionStatus::Dissolved).await;

        // A dissolved room does not block a new one.
        let second = host.create_room().await.unwrap();
        guest.join_room(&second).await.unwrap();
        let joined = guest.room().await.unwrap();
        assert!(joined.is_active());
        assert_eq!(joined.code.as_deref(), Some(second.as_str()));

        host.leave_room().await.unwrap();
        wait_status(&guest, |s| *s == ConnectionStatus::Dissolved).await;
        guest.leave_room().await.unwrap();
        assert_eq!(*guest.status().borrow(), ConnectionStatus::Disconnected);
        assert!(guest.room().await.is_none());
        assert!(matches!(guest.leave_room().await, Err(RoomError::NotInRoom)));
    }

    #[tokio::test]
    async fn test_join_rejects_bad_codes_and_missing_rooms() {
        let net = LoopbackNetwork::new();
        let (guest, _events) = room(&net, "phone");

        assert!(matches!(
            guest.join_room("ABC").await,
            Err(RoomError::InvalidCode(_))
        ));
        assert_eq!(*guest.status().borrow(), ConnectionStatus::Disconnected);

        let err = guest.join_room("ABCDEF").await.unwrap_err();
        assert!(matches!(
            err,
            RoomError::Transport(TransportError::UnknownEndpoint(_))
        ));
        assert!(matches!(
            *guest.status().borrow(),
            ConnectionStatus::Error { .. }
        ));
        assert!(guest.room().await.is_none());
    }

    #[tokio::test]
    async fn test_one_room_at_a_time() {
        let net = LoopbackNetwork::new();
        let (host, _events) = room(&net, "laptop");
        host.create_room().await.unwrap();
        assert!(matches!(
            host.create_room().await,
            Err(RoomError::AlreadyActive)
        ));
        host.leave_room().await.unwrap();
        assert!(matches!(host.leave_room().await, Err(RoomError::NotInRoom)));
        host.create_room().await.unwrap();
    }

    #[tokio::test]
    async fn test_host_announces_new_peers() {
        let net = LoopbackNetwork::new();
        let (host, _host_events) = room(&net, "laptop");
        let (first, mut first_events) = room(&net, "phone");
        let (second, _second_events) = room(&net, "tablet");

        let code = host.create_room().await.unwrap();
        first.join_room(&code).await.unwrap();
        second.join_room(&code).await.unwrap();

        let event = next_event(&mut first_events, |e| matches!(e, RoomEvent::JoinAnnounced { .. })).await;
        assert!(matches!(event, RoomEvent::JoinAnnounced { via } if via == rendezvous_id(&code)));
        assert_eq!(host.room().await.unwrap().peers.len(), 2);
    }

    #[tokio::test]
    async fn test_host_waits_when_last_guest_leaves() {
        let net = LoopbackNetwork::new();
        let (host, _host_events) = room(&net, "laptop");
        let (guest, _guest_events) = room(&net, "phone");

        let code = host.create_room().await.unwrap();
        guest.join_room(&code).await.unwrap();
        wait_status(&host, |s| *s == ConnectionStatus::Connected).await;

        guest.leave_room().await.unwrap();
        wait_status(&host, |s| *s == ConnectionStatus::Connecting).await;
        assert!(host.room().await.unwrap().peers.is_empty());
        assert_eq!(*guest.status().borrow(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_file_between_rooms() {
        let net = LoopbackNetwork::new();
        let (host, _host_events) = room(&net, "laptop");
        let (guest, mut guest_events) = room(&net, "phone");

        let code = host.create_room().await.unwrap();
        guest.join_room(&code).await.unwrap();
        wait_status(&host, |s| *s == ConnectionStatus::Connected).await;

        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
        let job = host
            .send_file(OutgoingFile::from_bytes("photo.jpg", data.clone()))
            .await
            .unwrap();
        assert_eq!(job.wait().await.unwrap().status, TransferStatus::Completed);

        let event = next_event(&mut guest_events, |e| {
            matches!(e, RoomEvent::Transfer(r) if r.status == TransferStatus::Completed)
        })
        .await;
        let RoomEvent::Transfer(record) = event else {
            unreachable!()
        };
        assert_eq!(record.file_data().unwrap().as_ref(), &data[..]);
    }

    /// Wraps a transport and timestamps every dial.
    struct RecordingTransport {
        inner: LoopbackTransport,
        dials: Arc<Mutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn local_id(&self) -> &str {
            self.inner.local_id()
        }

        async fn dial(&self, endpoint_id: &str) -> Result<ChannelHandle, TransportError> {
            self.dials.lock().unwrap().push(Instant::now());
            self.inner.dial(endpoint_id).await
        }

        async fn listen(
            &self,
            endpoint_id: &str,
        ) -> Result<mpsc::UnboundedReceiver<ChannelHandle>, TransportError> {
            self.inner.listen(endpoint_id).await
        }

        async fn stop_listening(&self, endpoint_id: &str) {
            self.inner.stop_listening(endpoint_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_reconnect_backoff_then_error() {
        let net = LoopbackNetwork::new();
        let code = "HQ4X7M";
        let endpoint = rendezvous_id(code);

        // A bare connection manager stands in for a host that will crash.
        let host_transport = net.transport("host");
        let (host_tx, _host_rx) = mpsc::unbounded_channel();
        let host = ConnectionManager::new(SessionRegistry::new(), host_tx, Duration::from_secs(20));
        let incoming = host_transport.listen(&endpoint).await.unwrap();
        tokio::spawn(accept_loop(host.clone(), incoming, SignalOfStop::new()));

        let dials = Arc::new(Mutex::new(Vec::new()));
        let transport = RecordingTransport {
            inner: net.transport("phone"),
            dials: dials.clone(),
        };
        let (guest, _events) = RoomCoordinator::new(Arc::new(transport), Settings::default());
        guest.join_room(code).await.unwrap();
        wait_status(&guest, |s| *s == ConnectionStatus::Connected).await;

        host_transport.stop_listening(&endpoint).await;
        let crashed = Instant::now();
        host.close_all().await;

        let status = wait_status(&guest, |s| matches!(s, ConnectionStatus::Error { .. })).await;
        assert!(status.to_string().contains("5 reconnect attempts"));

        let offsets: Vec<u64> = dials.lock().unwrap()[1..]
            .iter()
            .map(|t| ((t.duration_since(crashed).as_millis() + 500) / 1000) as u64)
            .collect();
        assert_eq!(offsets, vec![1, 3, 7, 15, 25]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(dials.lock().unwrap().len(), 6);
        assert!(guest.room().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_reconnects_when_host_returns() {
        let net = LoopbackNetwork::new();
        let code = "HQ4X7M";
        let endpoint = rendezvous_id(code);

        let host_transport = net.transport("host");
        let (host_tx, _host_rx) = mpsc::unbounded_channel();
        let host = ConnectionManager::new(SessionRegistry::new(), host_tx, Duration::from_secs(20));
        let incoming = host_transport.listen(&endpoint).await.unwrap();
        let first_life = SignalOfStop::new();
        tokio::spawn(accept_loop(host.clone(), incoming, first_life.clone()));

        let (guest, _events) = room(&net, "phone");
        guest.join_room(code).await.unwrap();

        host_transport.stop_listening(&endpoint).await;
        first_life.cancel();
        host.close_all().await;
        wait_status(&guest, |s| matches!(s, ConnectionStatus::Reconnecting { attempt: 2, .. })).await;

        let incoming = host_transport.listen(&endpoint).await.unwrap();
        tokio::spawn(accept_loop(host.clone(), incoming, SignalOfStop::new()));

        wait_status(&guest, |s| *s == ConnectionStatus::Connected).await;
        assert!(guest.room().await.unwrap().peers.contains(&endpoint));
    }
}
