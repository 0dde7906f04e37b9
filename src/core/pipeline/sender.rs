//! One peer's delivery of an outbound file.
//!
//! Each delivery owns its offset and chunk size and reports every step to
//! the job's aggregator. A dropped channel pauses the delivery until the
//! peer's session is ready again (bounded), then `file-start` is re-sent
//! with `resume: true` and the current offset on the new session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::config::{SEND_MAX_RETRIES, SEND_RETRY_BACKOFF, YIELD_EVERY_CHUNKS};
use crate::core::connection::session::{ReadySession, SessionRegistry};
use crate::core::error::TransferError;
use crate::core::pipeline::chunk_size::ChunkSizer;
use crate::core::pipeline::progress::{DeliveryStatus, PeerDelivery};
use crate::core::protocol::WireMessage;
use crate::core::transfer::OutgoingFile;
use crate::utils::sos::SignalOfStop;

/// Stop handle shared between a delivery task and its job.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeliveryHandle {
    stop: SignalOfStop,
    rejected: Arc<AtomicBool>,
}

impl DeliveryHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stop the delivery; the peer is told with `file-cancel`.
    pub(crate) fn cancel(&self) {
        self.stop.cancel();
    }

    /// The receiver refused the item. The delivery stops as failed and
    /// does not answer with its own `file-cancel`.
    pub(crate) fn reject(&self) {
        self.rejected.store(true, Ordering::Release);
        self.stop.cancel();
    }

    fn rejected(&self) -> bool {
        self.rejected.load(Ordering::Acquire)
    }

    fn cancelled(&self) -> bool {
        self.stop.cancelled()
    }

    async fn wait(&self) {
        self.stop.wait().await
    }
}

enum Waited {
    Ready(ReadySession),
    TimedOut,
    Cancelled,
}

pub(crate) struct Delivery {
    peer_id: String,
    item_id: Uuid,
    file: OutgoingFile,
    registry: SessionRegistry,
    cancel: DeliveryHandle,
    resume_wait: Duration,
    sizer: ChunkSizer,
    updates: mpsc::UnboundedSender<PeerDelivery>,
    offset: u64,
}

impl Delivery {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        peer_id: String,
        item_id: Uuid,
        file: OutgoingFile,
        registry: SessionRegistry,
        cancel: DeliveryHandle,
        resume_wait: Duration,
        sizer: ChunkSizer,
        updates: mpsc::UnboundedSender<PeerDelivery>,
    ) -> Self {
        Self {
            peer_id,
            item_id,
            file,
            registry,
            cancel,
            resume_wait,
            sizer,
            updates,
            offset: 0,
        }
    }

    pub(crate) async fn run(mut self) -> DeliveryStatus {
        let size = self.file.size();
        let item_id = self.item_id;
        let mut announced: Option<Uuid> = None;
        let mut failures = 0u32;
        let mut since_yield = 0u32;

        info!(
            event = "delivery_start",
            peer = %self.peer_id,
            %item_id,
            name = %self.file.name,
            size,
            "Starting delivery"
        );

        loop {
            if self.cancel.rejected() {
                warn!(event = "delivery_rejected", peer = %self.peer_id, %item_id, offset = self.offset, "Receiver refused the file");
                return self.finish(DeliveryStatus::Failed);
            }
            if self.cancel.cancelled() {
                self.notify_cancel(announced.is_some()).await;
                info!(event = "delivery_cancelled", peer = %self.peer_id, %item_id, offset = self.offset, "Delivery cancelled");
                return self.finish(DeliveryStatus::Cancelled);
            }

            let session = match self.session().await {
                Waited::Ready(s) => s,
                Waited::Cancelled => continue,
                Waited::TimedOut => {
                    warn!(
                        event = "delivery_peer_lost",
                        peer = %self.peer_id,
                        %item_id,
                        offset = self.offset,
                        wait_secs = self.resume_wait.as_secs(),
                        "Peer did not come back in time"
                    );
                    return self.finish(DeliveryStatus::Failed);
                }
            };

            if announced != Some(session.session_id) {
                let resuming = announced.is_some();
                let start = WireMessage::FileStart {
                    name: self.file.name.clone(),
                    size,
                    item_id,
                    resume: resuming.then_some(true),
                    offset: resuming.then_some(self.offset),
                };
                if let Err(e) = session.send_control(&start).await {
                    if self.give_up_after(&mut failures, &e).await {
                        return self.finish(DeliveryStatus::Failed);
                    }
                    continue;
                }
                if resuming {
                    info!(event = "delivery_resumed", peer = %self.peer_id, %item_id, offset = self.offset, "Resuming on new session");
                }
                announced = Some(session.session_id);
            }

            if self.offset >= size {
                match session.send_control(&WireMessage::FileEnd { item_id }).await {
                    Ok(()) => {
                        info!(event = "delivery_complete", peer = %self.peer_id, %item_id, size, "Delivery complete");
                        return self.finish(DeliveryStatus::Completed);
                    }
                    Err(e) => {
                        if self.give_up_after(&mut failures, &e).await {
                            return self.finish(DeliveryStatus::Failed);
                        }
                        continue;
                    }
                }
            }

            let start = self.offset as usize;
            let len = self.sizer.current().min((size - self.offset) as usize);
            let chunk = self.file.data.slice(start..start + len);

            let began = Instant::now();
            match session.send_chunk(item_id, self.offset, &chunk).await {
                Ok(_) => {
                    failures = 0;
                    self.offset += len as u64;
                    let next = self
                        .sizer
                        .observe(session.channel.buffered_amount(), began.elapsed());
                    if next != len && self.offset < size {
                        debug!(event = "chunk_size_adapted", peer = %self.peer_id, from = len, to = next, "Chunk size changed");
                    }
                    self.report(DeliveryStatus::InFlight);

                    since_yield += 1;
                    if since_yield >= YIELD_EVERY_CHUNKS {
                        since_yield = 0;
                        tokio::task::yield_now().await;
                    }
                }
                Err(e) => {
                    if self.give_up_after(&mut failures, &e).await {
                        return self.finish(DeliveryStatus::Failed);
                    }
                }
            }
        }
    }

    async fn session(&self) -> Waited {
        if let Some(s) = self.registry.ready(&self.peer_id).await {
            return Waited::Ready(s);
        }
        info!(
            event = "delivery_waiting",
            peer = %self.peer_id,
            item_id = %self.item_id,
            offset = self.offset,
            "Channel not ready, waiting for the peer"
        );
        tokio::select! {
            ready = self.registry.wait_ready(&self.peer_id, self.resume_wait) => match ready {
                Some(s) => Waited::Ready(s),
                None => Waited::TimedOut,
            },
            _ = self.cancel.wait() => Waited::Cancelled,
        }
    }

    /// Count a transient failure; true once the retry budget is spent.
    async fn give_up_after(&self, failures: &mut u32, e: &TransferError) -> bool {
        *failures += 1;
        if *failures > SEND_MAX_RETRIES {
            error!(event = "send_failed", peer = %self.peer_id, item_id = %self.item_id, retries = *failures - 1, %e, "Giving up on peer");
            return true;
        }
        warn!(
            event = "send_retry",
            peer = %self.peer_id,
            item_id = %self.item_id,
            retry = *failures,
            max = SEND_MAX_RETRIES,
            %e,
            "Send failed, retrying"
        );
        tokio::select! {
            _ = tokio::time::sleep(SEND_RETRY_BACKOFF) => {}
            _ = self.cancel.wait() => {}
        }
        false
    }

    async fn notify_cancel(&self, announced: bool) {
        if !announced {
            return;
        }
        if let Some(s) = self.registry.ready(&self.peer_id).await {
            if let Err(e) = s
                .send_control(&WireMessage::FileCancel {
                    item_id: self.item_id,
                })
                .await
            {
                debug!(event = "cancel_notify_failed", peer = %self.peer_id, %e, "Could not notify peer of cancel");
            }
        }
    }

    fn report(&self, status: DeliveryStatus) {
        let _ = self.updates.send(PeerDelivery {
            peer_id: self.peer_id.clone(),
            offset: self.offset,
            chunk_size: self.sizer.current(),
            status,
        });
    }

    fn finish(&self, status: DeliveryStatus) -> DeliveryStatus {
        self.report(status);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{
        ChunkSettings, BACKLOG_HIGH_WATERMARK, INITIAL_CHUNK_SIZE, MIN_CHUNK_SIZE,
    };
    use crate::core::connection::channel::ChannelEvent;
    use crate::core::connection::loopback::{pair, LoopbackChannel, LoopbackEnd};
    use crate::core::connection::session::{Direction, PeerSession};
    use crate::core::protocol::wire::{open_chunk, open_control};
    use crate::core::security::{derive_keys, Role, SessionEncryptor};
    use std::sync::Arc;

    const SECRET: [u8; 32] = [9u8; 32];

    async fn ready_registry(
        peer: &str,
    ) -> (SessionRegistry, Arc<LoopbackChannel>, LoopbackEnd, SessionEncryptor) {
        let (ours, theirs) = pair("me", peer);
        let registry = SessionRegistry::new();
        let local = ours.channel.clone();
        let session = PeerSession::new(peer, Role::Initiator, Direction::Outgoing, ours.channel);
        let id = session.session_id;
        registry.insert(session).await;
        let enc = SessionEncryptor::from_keys(&derive_keys(&SECRET, Role::Initiator).unwrap());
        registry.mark_ready(peer, id, Arc::new(enc)).await;
        let remote = SessionEncryptor::from_keys(&derive_keys(&SECRET, Role::Responder).unwrap());
        (registry, local, theirs, remote)
    }

    /// Decode everything `remote` received until `file-end`.
    async fn drain_until_end(remote: &mut LoopbackEnd, enc: &SessionEncryptor) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        loop {
            let Some(ChannelEvent::Data(raw)) = remote.events.recv().await else {
                continue;
            };
            match WireMessage::decode(&raw).unwrap() {
                WireMessage::Encrypted { encrypted } => {
                    if let WireMessage::FileEnd { .. } = open_control(enc, &encrypted).unwrap() {
                        return chunks;
                    }
                }
                WireMessage::FileChunk {
                    item_id,
                    offset,
                    encrypted: Some(e),
                    ..
                } => chunks.push(open_chunk(enc, &item_id, offset, &e).unwrap()),
                other => panic!("unexpected {}", other.kind()),
            }
        }
    }

    fn delivery(
        registry: &SessionRegistry,
        file: OutgoingFile,
        cancel: DeliveryHandle,
    ) -> (Delivery, mpsc::UnboundedReceiver<PeerDelivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Delivery::new(
                "peer".into(),
                Uuid::new_v4(),
                file,
                registry.clone(),
                cancel,
                Duration::from_secs(30),
                ChunkSizer::new(&ChunkSettings::default()),
                tx,
            ),
            rx,
        )
    }

    #[tokio::test]
    async fn test_delivery_streams_whole_file() {
        let (registry, _local, mut remote, enc) = ready_registry("peer").await;
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let (d, mut updates) = delivery(
            &registry,
            OutgoingFile::from_bytes("f.bin", payload.clone()),
            DeliveryHandle::new(),
        );
        assert_eq!(d.run().await, DeliveryStatus::Completed);

        let mut received = Vec::new();
        let mut saw_start = false;
        loop {
            let Some(ChannelEvent::Data(raw)) = remote.events.recv().await else {
                continue;
            };
            match WireMessage::decode(&raw).unwrap() {
                WireMessage::Encrypted { encrypted } => match open_control(&enc, &encrypted).unwrap() {
                    WireMessage::FileStart { size, resume, .. } => {
                        assert_eq!(size, payload.len() as u64);
                        assert_eq!(resume, None);
                        saw_start = true;
                    }
                    WireMessage::FileEnd { .. } => break,
                    other => panic!("unexpected {}", other.kind()),
                },
                WireMessage::FileChunk {
                    item_id,
                    offset,
                    encrypted: Some(e),
                    ..
                } => {
                    assert_eq!(offset, received.len() as u64);
                    received.extend(open_chunk(&enc, &item_id, offset, &e).unwrap());
                }
                other => panic!("unexpected {}", other.kind()),
            }
        }
        assert!(saw_start);
        assert_eq!(received, payload);

        let mut last = None;
        while let Ok(u) = updates.try_recv() {
            last = Some(u);
        }
        let last = last.unwrap();
        assert_eq!(last.status, DeliveryStatus::Completed);
        assert_eq!(last.offset, payload.len() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_peer_fails_after_resume_wait() {
        let registry = SessionRegistry::new();
        let (d, _updates) = delivery(
            &registry,
            OutgoingFile::from_bytes("f.bin", vec![1u8; 10]),
            DeliveryHandle::new(),
        );
        let started = Instant::now();
        assert_eq!(d.run().await, DeliveryStatus::Failed);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_resume_wait() {
        let registry = SessionRegistry::new();
        let cancel = DeliveryHandle::new();
        let (d, _updates) = delivery(
            &registry,
            OutgoingFile::from_bytes("f.bin", vec![1u8; 10]),
            cancel.clone(),
        );
        let task = tokio::spawn(d.run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), DeliveryStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_backlog_shrinks_chunks_to_floor() {
        let (registry, local, mut remote, enc) = ready_registry("peer").await;
        local.set_buffered_amount(BACKLOG_HIGH_WATERMARK + 1);
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (d, _updates) = delivery(
            &registry,
            OutgoingFile::from_bytes("f.bin", payload.clone()),
            DeliveryHandle::new(),
        );
        assert_eq!(d.run().await, DeliveryStatus::Completed);

        let chunks = drain_until_end(&mut remote, &enc).await;
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes[0], INITIAL_CHUNK_SIZE);
        assert_eq!(sizes[1], INITIAL_CHUNK_SIZE / 2);
        assert!(sizes.windows(2).all(|w| w[1] <= w[0]));
        let (last, body) = sizes.split_last().unwrap();
        assert!(body[2..].iter().all(|&s| s == MIN_CHUNK_SIZE));
        assert!(*last <= MIN_CHUNK_SIZE);
        assert_eq!(chunks.concat(), payload);
    }

    #[tokio::test]
    async fn test_rejected_delivery_fails_without_answering() {
        let (registry, _local, mut remote, _enc) = ready_registry("peer").await;
        let handle = DeliveryHandle::new();
        let (d, mut updates) = delivery(
            &registry,
            OutgoingFile::from_bytes("f.bin", vec![1u8; 10]),
            handle.clone(),
        );
        handle.reject();
        assert_eq!(d.run().await, DeliveryStatus::Failed);
        assert_eq!(updates.try_recv().unwrap().status, DeliveryStatus::Failed);
        while let Ok(event) = remote.events.try_recv() {
            assert!(!matches!(event, ChannelEvent::Data(_)));
        }
    }
}
