//! Per-peer session records and the registry that owns them.
//!
//! A peer id maps to at most one session. Each session carries a unique
//! `session_id` so that teardown of a replaced session never removes its
//! successor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::connection::channel::PeerChannel;
use crate::core::error::TransferError;
use crate::core::protocol::wire::{seal_chunk, seal_control};
use crate::core::protocol::WireMessage;
use crate::core::security::{Role, SessionEncryptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    KeyExchangePending,
    Ready,
    Closed,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer.
    Outgoing,
    /// The peer dialed us.
    Incoming,
}

#[derive(Debug, Clone)]
pub struct PeerSession {
    pub session_id: Uuid,
    pub peer_id: String,
    pub role: Role,
    pub direction: Direction,
    pub channel: Arc<dyn PeerChannel>,
    pub encryptor: Option<Arc<SessionEncryptor>>,
    pub state: SessionState,
    pub last_activity: Instant,
}

impl PeerSession {
    pub fn new(
        peer_id: impl Into<String>,
        role: Role,
        direction: Direction,
        channel: Arc<dyn PeerChannel>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            peer_id: peer_id.into(),
            role,
            direction,
            channel,
            encryptor: None,
            state: SessionState::Connecting,
            last_activity: Instant::now(),
        }
    }

    /// The sendable view of this session, if the handshake has completed
    /// and the channel is still open.
    pub fn as_ready(&self) -> Option<ReadySession> {
        if self.state != SessionState::Ready || !self.channel.is_open() {
            return None;
        }
        let encryptor = self.encryptor.clone()?;
        Some(ReadySession {
            session_id: self.session_id,
            peer_id: self.peer_id.clone(),
            channel: self.channel.clone(),
            encryptor,
        })
    }
}

/// A session that can carry encrypted traffic right now.
#[derive(Debug, Clone)]
pub struct ReadySession {
    pub session_id: Uuid,
    pub peer_id: String,
    pub channel: Arc<dyn PeerChannel>,
    pub encryptor: Arc<SessionEncryptor>,
}

impl ReadySession {
    /// Seal a control message in an `encrypted` envelope and send it.
    pub async fn send_control(&self, message: &WireMessage) -> Result<(), TransferError> {
        let raw = seal_control(&self.encryptor, message)?;
        self.channel.send(raw).await?;
        Ok(())
    }

    /// Seal and send one file chunk. Returns the encoded message length.
    pub async fn send_chunk(
        &self,
        item_id: Uuid,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, TransferError> {
        let raw = seal_chunk(&self.encryptor, item_id, offset, data)?;
        let len = raw.len();
        self.channel.send(raw).await?;
        Ok(len)
    }
}

// ── SessionRegistry ──────────────────────────────────────────────────────────

/// Owns every live session. Cheap to clone; clones share state.
///
/// A generation counter is bumped on every mutation so waiters can block
/// until a peer becomes ready.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, PeerSession>>>,
    changes: Arc<watch::Sender<u64>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            changes: Arc::new(tx),
        }
    }

    fn bump(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Insert a session, returning the one it replaced.
    pub async fn insert(&self, session: PeerSession) -> Option<PeerSession> {
        let replaced = self
            .sessions
            .write()
            .await
            .insert(session.peer_id.clone(), session);
        self.bump();
        replaced
    }

    /// Remove the peer's session only if it is still `session_id`.
    pub async fn remove(&self, peer_id: &str, session_id: Uuid) -> Option<PeerSession> {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(peer_id) {
                Some(s) if s.session_id == session_id => sessions.remove(peer_id),
                _ => None,
            }
        };
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    pub async fn get(&self, peer_id: &str) -> Option<PeerSession> {
        self.sessions.read().await.get(peer_id).cloned()
    }

    pub async fn set_state(&self, peer_id: &str, session_id: Uuid, state: SessionState) -> bool {
        let updated = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(peer_id) {
                Some(s) if s.session_id == session_id => {
                    s.state = state;
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.bump();
        }
        updated
    }

    /// Attach the encryptor and flip the session to `Ready`.
    pub async fn mark_ready(
        &self,
        peer_id: &str,
        session_id: Uuid,
        encryptor: Arc<SessionEncryptor>,
    ) -> bool {
        let updated = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(peer_id) {
                Some(s) if s.session_id == session_id => {
                    s.encryptor = Some(encryptor);
                    s.state = SessionState::Ready;
                    s.last_activity = Instant::now();
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.bump();
        }
        updated
    }

    pub async fn touch(&self, peer_id: &str, session_id: Uuid) {
        if let Some(s) = self.sessions.write().await.get_mut(peer_id) {
            if s.session_id == session_id {
                s.last_activity = Instant::now();
            }
        }
    }

    pub async fn ready(&self, peer_id: &str) -> Option<ReadySession> {
        self.sessions
            .read()
            .await
            .get(peer_id)
            .and_then(PeerSession::as_ready)
    }

    pub async fn ready_sessions(&self) -> Vec<ReadySession> {
        let mut ready: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .filter_map(PeerSession::as_ready)
            .collect();
        ready.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        ready
    }

    pub async fn ready_peer_ids(&self) -> Vec<String> {
        self.ready_sessions()
            .await
            .into_iter()
            .map(|s| s.peer_id)
            .collect()
    }

    /// Wait up to `limit` for `peer_id` to have a ready session.
    pub async fn wait_ready(&self, peer_id: &str, limit: Duration) -> Option<ReadySession> {
        let mut changes = self.changes.subscribe();
        let deadline = Instant::now() + limit;
        loop {
            if let Some(ready) = self.ready(peer_id).await {
                return Some(ready);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }

    /// Remove and return every session.
    pub async fn drain(&self) -> Vec<PeerSession> {
        let drained: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        if !drained.is_empty() {
            self.bump();
        }
        drained
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
