//! Connection lifecycle: dial/accept, the per-channel session driver and
//! the handshake that turns an open channel into a ready session.
//!
//! Each channel is owned by exactly one driver task. The driver walks the
//! session through `Connecting → KeyExchangePending → Ready → {Closed,
//! Errored}`, decrypts inbound traffic and forwards it upward as
//! [`SessionEvent`]s. Once keys exist only `key-exchange`, `encrypted` and
//! encrypted `file-chunk` messages are accepted; anything else aborts the
//! session.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::connection::channel::{
    ChannelEvent, ChannelHandle, ChannelState, PeerChannel, Transport,
};
use crate::core::connection::session::{Direction, PeerSession, SessionRegistry, SessionState};
use crate::core::error::{CryptoError, TransferError, TransportError};
use crate::core::protocol::wire::{open_chunk, open_control, seal_control};
use crate::core::protocol::WireMessage;
use crate::core::security::{KeyExchange, Role, SessionEncryptor};

/// What the session drivers report to the room.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Ready {
        peer_id: String,
        session_id: Uuid,
        direction: Direction,
    },
    /// A decrypted control message (text, file-start/end/cancel, room messages).
    Message {
        peer_id: String,
        message: WireMessage,
    },
    Chunk {
        peer_id: String,
        item_id: Uuid,
        offset: u64,
        data: Vec<u8>,
    },
    Pong {
        peer_id: String,
        id: u64,
    },
    Closed {
        peer_id: String,
        session_id: Uuid,
    },
    Errored {
        peer_id: String,
        session_id: Uuid,
        error: String,
    },
}

#[derive(Clone)]
pub struct ConnectionManager {
    registry: SessionRegistry,
    events: mpsc::UnboundedSender<SessionEvent>,
    open_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(
        registry: SessionRegistry,
        events: mpsc::UnboundedSender<SessionEvent>,
        open_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            open_timeout,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Dial `endpoint_id` and start the handshake as initiator.
    ///
    /// Fails with `OpenTimeout` if the channel does not open in time. A
    /// live session to the same endpoint is reused.
    pub async fn connect(
        &self,
        transport: &dyn Transport,
        endpoint_id: &str,
    ) -> Result<Uuid, TransportError> {
        if let Some(existing) = self.registry.get(endpoint_id).await {
            let live = matches!(
                existing.state,
                SessionState::Connecting | SessionState::KeyExchangePending | SessionState::Ready
            ) && existing.channel.state() != ChannelState::Closed;
            if live {
                debug!(event = "connect_reuse", peer = %endpoint_id, "Session already in progress");
                return Ok(existing.session_id);
            }
        }

        info!(event = "connect_dial", peer = %endpoint_id, local = %transport.local_id(), "Dialing");
        let ChannelHandle {
            channel,
            mut events,
        } = transport.dial(endpoint_id).await?;

        let session = PeerSession::new(
            endpoint_id,
            Role::Initiator,
            Direction::Outgoing,
            channel.clone(),
        );
        let session_id = session.session_id;
        self.registry.insert(session).await;

        let opened =
            tokio::time::timeout(self.open_timeout, wait_for_open(endpoint_id, &mut events)).await;
        let failure = match opened {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => {
                warn!(
                    event = "connect_open_timeout",
                    peer = %endpoint_id,
                    timeout_secs = self.open_timeout.as_secs(),
                    "Channel did not open in time"
                );
                Some(TransportError::OpenTimeout(endpoint_id.to_string()))
            }
        };
        if let Some(e) = failure {
            self.registry.remove(endpoint_id, session_id).await;
            channel.close().await;
            return Err(e);
        }

        self.spawn_driver(
            endpoint_id.to_string(),
            session_id,
            Role::Initiator,
            Direction::Outgoing,
            channel,
            events,
            true,
        );
        Ok(session_id)
    }

    /// Adopt a channel dialed by a remote peer; we answer the handshake.
    ///
    /// A previous session for the same peer is replaced and closed.
    pub async fn accept(&self, handle: ChannelHandle) -> Uuid {
        let ChannelHandle { channel, events } = handle;
        let peer_id = channel.endpoint_id().to_string();
        let session = PeerSession::new(
            peer_id.clone(),
            Role::Responder,
            Direction::Incoming,
            channel.clone(),
        );
        let session_id = session.session_id;

        if let Some(old) = self.registry.insert(session).await {
            info!(event = "session_replaced", peer = %peer_id, old = %old.session_id, new = %session_id, "Peer reconnected");
            old.channel.close().await;
        }

        self.spawn_driver(
            peer_id,
            session_id,
            Role::Responder,
            Direction::Incoming,
            channel,
            events,
            false,
        );
        session_id
    }

    /// Close one peer's channel; its driver reports the close.
    pub async fn close_peer(&self, peer_id: &str) {
        if let Some(session) = self.registry.get(peer_id).await {
            session.channel.close().await;
        }
    }

    /// Tear down every session without reporting closes upward.
    pub async fn close_all(&self) {
        for session in self.registry.drain().await {
            session.channel.close().await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_driver(
        &self,
        peer_id: String,
        session_id: Uuid,
        role: Role,
        direction: Direction,
        channel: Arc<dyn PeerChannel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        already_open: bool,
    ) {
        let driver = SessionDriver {
            registry: self.registry.clone(),
            events_out: self.events.clone(),
            peer_id,
            session_id,
            role,
            direction,
            channel,
            exchange: None,
            encryptor: None,
        };
        tokio::spawn(driver.run(events, already_open));
    }
}

async fn wait_for_open(
    endpoint_id: &str,
    events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
) -> Result<(), TransportError> {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Open => return Ok(()),
            ChannelEvent::Closed | ChannelEvent::Error(_) => break,
            other => debug!(event = "pre_open_event", peer = %endpoint_id, ?other, "Ignored before open"),
        }
    }
    Err(TransportError::Closed(endpoint_id.to_string()))
}

// ── Session driver ───────────────────────────────────────────────────────────

struct SessionDriver {
    registry: SessionRegistry,
    events_out: mpsc::UnboundedSender<SessionEvent>,
    peer_id: String,
    session_id: Uuid,
    role: Role,
    direction: Direction,
    channel: Arc<dyn PeerChannel>,
    exchange: Option<KeyExchange>,
    encryptor: Option<Arc<SessionEncryptor>>,
}

impl SessionDriver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ChannelEvent>, already_open: bool) {
        if already_open && self.on_open().await.is_break() {
            return;
        }

        while let Some(event) = events.recv().await {
            let flow = match event {
                ChannelEvent::Open => self.on_open().await,
                ChannelEvent::Data(raw) => self.on_data(&raw).await,
                ChannelEvent::Degraded => self.on_degraded().await,
                ChannelEvent::Error(reason) => {
                    self.fail(reason).await;
                    ControlFlow::Break(())
                }
                ChannelEvent::Closed => {
                    self.finish_closed().await;
                    ControlFlow::Break(())
                }
            };
            if flow.is_break() {
                return;
            }
        }
        self.finish_closed().await;
    }

    async fn on_open(&mut self) -> ControlFlow<()> {
        if self.exchange.is_some() || self.encryptor.is_some() {
            debug!(event = "duplicate_open", peer = %self.peer_id, "Channel already open");
            return ControlFlow::Continue(());
        }

        self.registry
            .set_state(&self.peer_id, self.session_id, SessionState::KeyExchangePending)
            .await;
        let exchange = KeyExchange::new(self.role);

        if let Some(hello) = exchange.opening_message() {
            let sent = match hello.encode() {
                Ok(raw) => self.channel.send(raw).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = sent {
                self.fail(format!("could not start key exchange: {e}")).await;
                return ControlFlow::Break(());
            }
        }
        debug!(event = "key_exchange_started", peer = %self.peer_id, role = ?self.role, "Handshake pending");
        self.exchange = Some(exchange);
        ControlFlow::Continue(())
    }

    async fn on_data(&mut self, raw: &str) -> ControlFlow<()> {
        let message = match WireMessage::decode(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(event = "malformed_message", peer = %self.peer_id, error = %e, "Dropping undecodable message");
                return ControlFlow::Continue(());
            }
        };
        self.registry.touch(&self.peer_id, self.session_id).await;

        match self.handle(message).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(TransferError::Crypto(e)) => {
                self.fail(format!("security violation: {e}")).await;
                ControlFlow::Break(())
            }
            Err(TransferError::Transport(e)) => {
                self.fail(e.to_string()).await;
                ControlFlow::Break(())
            }
            Err(e) => {
                warn!(event = "message_rejected", peer = %self.peer_id, error = %e, "Dropping message");
                ControlFlow::Continue(())
            }
        }
    }

    async fn handle(&mut self, message: WireMessage) -> Result<(), TransferError> {
        match message {
            WireMessage::KeyExchange { public_key } => {
                let exchange = self
                    .exchange
                    .as_mut()
                    .ok_or(CryptoError::UnexpectedKeyExchange)?;
                let outcome = exchange.accept(&public_key)?;
                self.exchange = None;

                if let Some(reply) = outcome.reply {
                    self.channel.send(reply.encode()?).await?;
                }

                let encryptor = Arc::new(outcome.encryptor);
                self.encryptor = Some(encryptor.clone());
                self.registry
                    .mark_ready(&self.peer_id, self.session_id, encryptor)
                    .await;
                info!(
                    event = "session_ready",
                    peer = %self.peer_id,
                    session = %self.session_id,
                    role = ?self.role,
                    "Session keys established"
                );
                self.emit(SessionEvent::Ready {
                    peer_id: self.peer_id.clone(),
                    session_id: self.session_id,
                    direction: self.direction,
                });
            }
            WireMessage::Encrypted { encrypted } => {
                let encryptor = self.encryptor.as_ref().ok_or(CryptoError::NotReady)?;
                match open_control(encryptor, &encrypted)? {
                    WireMessage::Ping { id } => {
                        let pong = seal_control(encryptor, &WireMessage::Pong { id })?;
                        self.channel.send(pong).await?;
                    }
                    WireMessage::Pong { id } => self.emit(SessionEvent::Pong {
                        peer_id: self.peer_id.clone(),
                        id,
                    }),
                    message => self.emit(SessionEvent::Message {
                        peer_id: self.peer_id.clone(),
                        message,
                    }),
                }
            }
            WireMessage::FileChunk {
                item_id,
                offset,
                encrypted: Some(payload),
                data: None,
            } => {
                let encryptor = self.encryptor.as_ref().ok_or(CryptoError::NotReady)?;
                let data = open_chunk(encryptor, &item_id, offset, &payload)?;
                self.emit(SessionEvent::Chunk {
                    peer_id: self.peer_id.clone(),
                    item_id,
                    offset,
                    data,
                });
            }
            other => return Err(CryptoError::PlaintextRejected(other.kind()).into()),
        }
        Ok(())
    }

    async fn on_degraded(&mut self) -> ControlFlow<()> {
        warn!(event = "channel_degraded", peer = %self.peer_id, "Transport reported trouble, restarting in place");
        match self.channel.restart().await {
            Ok(()) => {
                info!(event = "channel_restarted", peer = %self.peer_id, "In-place restart succeeded");
                ControlFlow::Continue(())
            }
            Err(e) if self.direction == Direction::Outgoing => {
                self.fail(e.to_string()).await;
                ControlFlow::Break(())
            }
            Err(e) => {
                warn!(event = "channel_restart_failed", peer = %self.peer_id, error = %e, "Waiting for the channel to close");
                ControlFlow::Continue(())
            }
        }
    }

    async fn fail(&mut self, reason: String) {
        warn!(event = "session_errored", peer = %self.peer_id, session = %self.session_id, %reason, "Aborting session");
        self.registry
            .set_state(&self.peer_id, self.session_id, SessionState::Errored)
            .await;
        let current = self.registry.remove(&self.peer_id, self.session_id).await.is_some();
        self.channel.close().await;
        if current {
            self.emit(SessionEvent::Errored {
                peer_id: self.peer_id.clone(),
                session_id: self.session_id,
                error: reason,
            });
        }
    }

    async fn finish_closed(&mut self) {
        self.registry
            .set_state(&self.peer_id, self.session_id, SessionState::Closed)
            .await;
        if self.registry.remove(&self.peer_id, self.session_id).await.is_some() {
            info!(event = "session_closed", peer = %self.peer_id, session = %self.session_id, "Channel closed");
            self.emit(SessionEvent::Closed {
                peer_id: self.peer_id.clone(),
                session_id: self.session_id,
            });
        } else {
            debug!(event = "session_superseded", peer = %self.peer_id, session = %self.session_id, "Closed session was already replaced");
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events_out.send(event).is_err() {
            debug!(event = "session_event_dropped", peer = %self.peer_id, "No listener for session events");
        }
    }
}
