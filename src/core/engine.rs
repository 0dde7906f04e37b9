//! Transfer engine: text broadcast, multi-peer file fan-out with a
//! watermark aggregator, and receive-side reassembly.
//!
//! One engine lives for the lifetime of a room coordinator. Shared maps
//! sit behind `Arc<RwLock<…>>`; no guard is held across a channel send.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::connection::session::SessionRegistry;
use crate::core::error::TransferError;
use crate::core::events::RoomEvent;
use crate::core::pipeline::chunk_size::ChunkSizer;
use crate::core::pipeline::progress::{
    DeliveryStatus, PeerDelivery, Rate, SpeedMeter, Watermark,
};
use crate::core::pipeline::receiver::ReceiveBuffer;
use crate::core::pipeline::sender::{Delivery, DeliveryHandle};
use crate::core::protocol::WireMessage;
use crate::core::quality::QualityMonitor;
use crate::core::transfer::{
    ItemContent, JobOutcome, OutgoingFile, SendJob, TransferDirection, TransferRecord,
    TransferStatus,
};

type InboundKey = (String, Uuid);

#[derive(Default)]
struct RecordStore {
    order: Vec<Uuid>,
    items: HashMap<Uuid, TransferRecord>,
}

#[derive(Clone)]
pub struct TransferEngine {
    registry: SessionRegistry,
    settings: Arc<Settings>,
    records: Arc<RwLock<RecordStore>>,
    /// Outbound item → per-peer delivery handles.
    jobs: Arc<RwLock<HashMap<Uuid, HashMap<String, DeliveryHandle>>>>,
    /// (sender peer, sender's item id) → reassembly buffer.
    inbound: Arc<RwLock<HashMap<InboundKey, ReceiveBuffer>>>,
    /// Peers whose inbound files are waiting out the resume window.
    lost: Arc<RwLock<HashMap<String, Uuid>>>,
    events: mpsc::UnboundedSender<RoomEvent>,
    quality: QualityMonitor,
}

impl TransferEngine {
    pub fn new(
        registry: SessionRegistry,
        settings: Settings,
        events: mpsc::UnboundedSender<RoomEvent>,
        quality: QualityMonitor,
    ) -> Self {
        Self {
            registry,
            settings: Arc::new(settings),
            records: Arc::new(RwLock::new(RecordStore::default())),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            inbound: Arc::new(RwLock::new(HashMap::new())),
            lost: Arc::new(RwLock::new(HashMap::new())),
            events,
            quality,
        }
    }

    // ── Records ──────────────────────────────────────────────────────────────

    /// Every item seen so far, oldest first.
    pub async fn records(&self) -> Vec<TransferRecord> {
        let store = self.records.read().await;
        store
            .order
            .iter()
            .filter_map(|id| store.items.get(id).cloned())
            .collect()
    }

    pub async fn record(&self, item_id: Uuid) -> Option<TransferRecord> {
        self.records.read().await.items.get(&item_id).cloned()
    }

    async fn store(&self, record: TransferRecord) {
        {
            let mut store = self.records.write().await;
            if !store.items.contains_key(&record.item_id) {
                store.order.push(record.item_id);
            }
            store.items.insert(record.item_id, record.clone());
        }
        self.emit(RoomEvent::Transfer(record));
    }

    async fn update(&self, item_id: Uuid, f: impl FnOnce(&mut TransferRecord)) -> Option<TransferRecord> {
        let updated = {
            let mut store = self.records.write().await;
            let record = store.items.get_mut(&item_id)?;
            f(record);
            record.clone()
        };
        self.emit(RoomEvent::Transfer(updated.clone()));
        Some(updated)
    }

    async fn set_status(&self, item_id: Uuid, status: TransferStatus) {
        self.update(item_id, |r| r.status = status).await;
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Send `text` to every ready peer, each under its own session key.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<Uuid, TransferError> {
        let text = text.into();
        let sessions = self.registry.ready_sessions().await;
        if sessions.is_empty() {
            return Err(TransferError::NoReadyPeers);
        }

        let message = WireMessage::Text {
            content: text.clone(),
        };
        let mut delivered = 0usize;
        for session in &sessions {
            match session.send_control(&message).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(event = "text_send_failed", peer = %session.peer_id, error = %e, "Text not delivered")
                }
            }
        }

        let item_id = Uuid::new_v4();
        let status = if delivered > 0 {
            TransferStatus::Completed
        } else {
            TransferStatus::Failed
        };
        info!(event = "text_sent", %item_id, delivered, peers = sessions.len(), "Text broadcast");
        self.store(TransferRecord::outbound_text(item_id, text, status))
            .await;
        Ok(item_id)
    }

    /// Fan `file` out to every peer ready right now.
    pub async fn send_file(&self, file: OutgoingFile) -> Result<SendJob, TransferError> {
        let peers = self.registry.ready_peer_ids().await;
        if peers.is_empty() {
            return Err(TransferError::NoReadyPeers);
        }

        let item_id = Uuid::new_v4();
        let size = file.size();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let mut tokens = HashMap::new();

        for peer in &peers {
            let cancel = DeliveryHandle::new();
            tokens.insert(peer.clone(), cancel.clone());
            let delivery = Delivery::new(
                peer.clone(),
                item_id,
                file.clone(),
                self.registry.clone(),
                cancel,
                self.settings.resume_wait(),
                ChunkSizer::new(&self.settings.chunking),
                updates_tx.clone(),
            );
            tokio::spawn(delivery.run());
        }
        drop(updates_tx);
        self.jobs.write().await.insert(item_id, tokens);

        let watermark = Watermark::new(
            peers.iter().map(String::as_str),
            ChunkSizer::new(&self.settings.chunking).current(),
        );
        let mut record = TransferRecord::file(
            item_id,
            TransferDirection::Outbound,
            None,
            &file.name,
            size,
        );
        record.deliveries = watermark.deliveries();
        self.store(record.clone()).await;

        info!(event = "file_send_start", %item_id, name = %file.name, size, peers = peers.len(), "Fanning out file");

        let (progress_tx, progress_rx) = watch::channel(record);
        let outcome = tokio::spawn(self.clone().aggregate(
            item_id,
            size,
            watermark,
            updates_rx,
            progress_tx,
        ));

        Ok(SendJob {
            item_id,
            peers,
            progress: progress_rx,
            outcome,
        })
    }

    /// Fold delivery updates into the job watermark until every peer is done.
    async fn aggregate(
        self,
        item_id: Uuid,
        size: u64,
        mut watermark: Watermark,
        mut updates: mpsc::UnboundedReceiver<PeerDelivery>,
        progress: watch::Sender<TransferRecord>,
    ) -> JobOutcome {
        let mut meter = SpeedMeter::new(size, self.settings.progress_interval());

        while let Some(update) = updates.recv().await {
            watermark.update(update);
            let done = watermark.all_terminal();
            if done {
                break;
            }
            if let Some(rate) = meter.sample(watermark.value(), false) {
                self.publish(item_id, &watermark, rate, TransferStatus::Transferring, &progress)
                    .await;
            }
        }

        // A delivery that vanished without a terminal report counts as failed.
        for mut d in watermark.deliveries() {
            if !d.status.is_terminal() {
                d.status = DeliveryStatus::Failed;
                watermark.update(d);
            }
        }

        let deliveries = watermark.deliveries();
        let status = job_status(&deliveries);
        self.jobs.write().await.remove(&item_id);

        let rate = meter.sample(watermark.value(), true).unwrap_or(Rate {
            bytes: watermark.value(),
            speed_bps: meter.speed(),
            eta: None,
        });
        self.publish(item_id, &watermark, rate, status, &progress).await;

        info!(
            event = "file_send_finished",
            %item_id,
            status = ?status,
            completed = deliveries.iter().filter(|d| d.status == DeliveryStatus::Completed).count(),
            failed = deliveries.iter().filter(|d| d.status == DeliveryStatus::Failed).count(),
            cancelled = deliveries.iter().filter(|d| d.status == DeliveryStatus::Cancelled).count(),
            "Send job finished"
        );
        JobOutcome {
            item_id,
            status,
            deliveries,
        }
    }

    async fn publish(
        &self,
        item_id: Uuid,
        watermark: &Watermark,
        rate: Rate,
        status: TransferStatus,
        progress: &watch::Sender<TransferRecord>,
    ) {
        let deliveries = watermark.deliveries();
        let transferred = watermark.value();
        if let Some(record) = self
            .update(item_id, |r| {
                r.transferred = transferred;
                r.speed_bps = rate.speed_bps;
                r.eta = if status.is_terminal() { None } else { rate.eta };
                r.deliveries = deliveries;
                r.status = status;
            })
            .await
        {
            progress.send_replace(record);
        }
    }

    /// Cancel an outbound job (all peers) or abandon an inbound file.
    ///
    /// Abandoning an inbound file tells its sender to stop.
    pub async fn cancel_transfer(&self, item_id: Uuid) -> Result<(), TransferError> {
        if let Some(tokens) = self.jobs.read().await.get(&item_id) {
            info!(event = "file_send_cancel", %item_id, peers = tokens.len(), "Cancelling send job");
            for token in tokens.values() {
                token.cancel();
            }
            return Ok(());
        }

        let abandoned = {
            let mut inbound = self.inbound.write().await;
            let key = inbound
                .iter()
                .find(|(_, b)| b.local_item_id == item_id)
                .map(|(k, _)| k.clone());
            key.and_then(|k| inbound.remove(&k))
        };
        let Some(buffer) = abandoned else {
            return Err(TransferError::UnknownItem(item_id));
        };

        info!(event = "file_receive_cancel", %item_id, peer = %buffer.peer_id, "Abandoning inbound file");
        self.set_status(buffer.local_item_id, TransferStatus::Cancelled)
            .await;
        self.send_cancel_to(&buffer.peer_id, buffer.remote_item_id)
            .await;
        Ok(())
    }

    async fn send_cancel_to(&self, peer_id: &str, remote_item_id: Uuid) {
        let Some(session) = self.registry.ready(peer_id).await else {
            debug!(event = "cancel_not_sent", peer = %peer_id, "Peer not ready");
            return;
        };
        if let Err(e) = session
            .send_control(&WireMessage::FileCancel {
                item_id: remote_item_id,
            })
            .await
        {
            debug!(event = "cancel_not_sent", peer = %peer_id, error = %e, "Could not notify sender");
        }
    }

    /// Cancel every outbound job and drop every partial inbound file.
    pub async fn shutdown(&self) {
        for tokens in self.jobs.read().await.values() {
            for token in tokens.values() {
                token.cancel();
            }
        }
        let abandoned: Vec<_> = self.inbound.write().await.drain().map(|(_, b)| b).collect();
        for buffer in abandoned {
            self.set_status(buffer.local_item_id, TransferStatus::Failed)
                .await;
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// A peer's session went away. Its partial inbound files are failed and
    /// released unless it is ready again within the resume wait.
    pub async fn on_peer_lost(&self, peer_id: &str) {
        let pending = self.inbound.read().await.keys().any(|(p, _)| p == peer_id);
        if !pending {
            return;
        }
        let mark = Uuid::new_v4();
        self.lost.write().await.insert(peer_id.to_string(), mark);

        let engine = self.clone();
        let peer_id = peer_id.to_string();
        let wait = self.settings.resume_wait();
        debug!(event = "inbound_expiry_armed", peer = %peer_id, wait_secs = wait.as_secs(), "Waiting for sender to resume");
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            engine.expire_inbound(&peer_id, mark).await;
        });
    }

    async fn expire_inbound(&self, peer_id: &str, mark: Uuid) {
        {
            let mut lost = self.lost.write().await;
            // A newer loss of the same peer owns the window now.
            if lost.get(peer_id) != Some(&mark) {
                return;
            }
            lost.remove(peer_id);
        }
        if self.registry.ready(peer_id).await.is_some() {
            return;
        }

        let expired: Vec<ReceiveBuffer> = {
            let mut inbound = self.inbound.write().await;
            let keys: Vec<InboundKey> = inbound
                .keys()
                .filter(|(p, _)| p == peer_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| inbound.remove(k)).collect()
        };
        for buffer in expired {
            warn!(
                event = "file_receive_expired",
                peer = %peer_id,
                item_id = %buffer.local_item_id,
                received = buffer.received(),
                "Sender did not resume in time"
            );
            self.set_status(buffer.local_item_id, TransferStatus::Failed)
                .await;
        }
    }

    /// Handle a decrypted control message from `peer_id`.
    ///
    /// Messages that are not about transfers are handed back to the caller.
    pub async fn on_message(&self, peer_id: &str, message: WireMessage) -> Option<WireMessage> {
        match message {
            WireMessage::Text { content } => self.on_text(peer_id, content).await,
            WireMessage::FileStart {
                name,
                size,
                item_id,
                resume,
                offset,
            } => {
                self.on_file_start(peer_id, name, size, item_id, resume.unwrap_or(false), offset.unwrap_or(0))
                    .await
            }
            WireMessage::FileEnd { item_id } => self.on_file_end(peer_id, item_id).await,
            WireMessage::FileCancel { item_id } => self.on_file_cancel(peer_id, item_id).await,
            other => return Some(other),
        }
        None
    }

    async fn on_text(&self, peer_id: &str, content: String) {
        let record = TransferRecord::inbound_text(peer_id, content.clone());
        let item_id = record.item_id;
        debug!(event = "text_received", peer = %peer_id, %item_id, len = content.len(), "Text received");
        self.store(record).await;
        self.emit(RoomEvent::TextReceived {
            peer_id: peer_id.to_string(),
            item_id,
            text: content,
        });
    }

    async fn on_file_start(
        &self,
        peer_id: &str,
        name: String,
        size: u64,
        item_id: Uuid,
        resume: bool,
        offset: u64,
    ) {
        let key = (peer_id.to_string(), item_id);

        if resume {
            let resumed = {
                let mut inbound = self.inbound.write().await;
                match inbound.get_mut(&key) {
                    Some(buffer) => match buffer.rewind_to(offset) {
                        Ok(()) => Ok(Some(buffer.local_item_id)),
                        Err(e) => Err((inbound.remove(&key).map(|b| b.local_item_id), e)),
                    },
                    None => Ok(None),
                }
            };
            match resumed {
                Ok(Some(local)) => {
                    info!(event = "file_receive_resumed", peer = %peer_id, item_id = %local, offset, "Sender resumed");
                    self.update(local, |r| r.transferred = offset).await;
                    return;
                }
                Ok(None) if offset == 0 => {}
                Ok(None) => {
                    warn!(event = "file_resume_unknown", peer = %peer_id, %item_id, offset, "Cannot resume an item we never started");
                    self.send_cancel_to(peer_id, item_id).await;
                    return;
                }
                Err((local, e)) => {
                    warn!(event = "file_resume_rejected", peer = %peer_id, %item_id, offset, error = %e, "Cannot resume");
                    if let Some(local) = local {
                        self.set_status(local, TransferStatus::Failed).await;
                    }
                    self.send_cancel_to(peer_id, item_id).await;
                    return;
                }
            }
        }

        let buffer = ReceiveBuffer::new(
            peer_id,
            item_id,
            name.clone(),
            size,
            self.settings.progress_interval(),
        );
        let local = buffer.local_item_id;
        let replaced = self.inbound.write().await.insert(key, buffer);
        if let Some(old) = replaced {
            self.set_status(old.local_item_id, TransferStatus::Failed)
                .await;
        }

        info!(event = "file_receive_start", peer = %peer_id, item_id = %local, %name, size, "Receiving file");
        self.store(TransferRecord::file(
            local,
            TransferDirection::Inbound,
            Some(peer_id.to_string()),
            &name,
            size,
        ))
        .await;
    }

    /// Append a decrypted chunk to its buffer.
    pub async fn on_chunk(&self, peer_id: &str, item_id: Uuid, offset: u64, data: Vec<u8>) {
        let key = (peer_id.to_string(), item_id);
        let appended = {
            let mut inbound = self.inbound.write().await;
            let Some(buffer) = inbound.get_mut(&key) else {
                debug!(event = "chunk_unknown_item", peer = %peer_id, %item_id, offset, "Dropping chunk");
                return;
            };
            match buffer.append(offset, data) {
                Ok(_) => Ok((buffer.local_item_id, buffer.progress(false))),
                Err(e) => Err((inbound.remove(&key).map(|b| b.local_item_id), e)),
            }
        };

        match appended {
            Ok((_, None)) => {}
            Ok((local, Some(rate))) => {
                self.update(local, |r| {
                    r.transferred = rate.bytes;
                    r.speed_bps = rate.speed_bps;
                    r.eta = rate.eta;
                })
                .await;
                let sample = self.quality.record_bandwidth(peer_id, rate.speed_bps);
                self.emit(RoomEvent::Quality(sample));
            }
            Err((local, e)) => {
                warn!(event = "chunk_rejected", peer = %peer_id, %item_id, offset, error = %e, "Discarding inbound file");
                if let Some(local) = local {
                    self.set_status(local, TransferStatus::Failed).await;
                }
                self.send_cancel_to(peer_id, item_id).await;
            }
        }
    }

    async fn on_file_end(&self, peer_id: &str, item_id: Uuid) {
        let key = (peer_id.to_string(), item_id);
        let Some(mut buffer) = self.inbound.write().await.remove(&key) else {
            debug!(event = "file_end_unknown_item", peer = %peer_id, %item_id, "Ignoring file-end");
            return;
        };
        let local = buffer.local_item_id;
        let rate = buffer.progress(true);

        match buffer.finish() {
            Ok(bytes) => {
                info!(event = "file_receive_complete", peer = %peer_id, item_id = %local, size = bytes.len(), "File received");
                self.update(local, |r| {
                    r.transferred = bytes.len() as u64;
                    r.eta = None;
                    if let Some(rate) = rate {
                        r.speed_bps = rate.speed_bps;
                    }
                    if let ItemContent::File { data, .. } = &mut r.content {
                        *data = Some(bytes);
                    }
                    r.status = TransferStatus::Completed;
                })
                .await;
            }
            Err(e) => {
                warn!(event = "file_receive_incomplete", peer = %peer_id, item_id = %local, error = %e, "File ended early");
                self.set_status(local, TransferStatus::Failed).await;
            }
        }
    }

    async fn on_file_cancel(&self, peer_id: &str, item_id: Uuid) {
        let key = (peer_id.to_string(), item_id);
        let removed = self.inbound.write().await.remove(&key);
        if let Some(buffer) = removed {
            info!(event = "file_receive_cancelled", peer = %peer_id, item_id = %buffer.local_item_id, "Sender cancelled");
            self.set_status(buffer.local_item_id, TransferStatus::Cancelled)
                .await;
            return;
        }

        let token = self
            .jobs
            .read()
            .await
            .get(&item_id)
            .and_then(|peers| peers.get(peer_id).cloned());
        match token {
            Some(token) => {
                info!(event = "file_send_rejected", peer = %peer_id, %item_id, "Receiver refused delivery");
                token.reject();
            }
            None => debug!(event = "file_cancel_unknown_item", peer = %peer_id, %item_id, "Ignoring file-cancel"),
        }
    }
}

fn job_status(deliveries: &[PeerDelivery]) -> TransferStatus {
    let any = |s: DeliveryStatus| deliveries.iter().any(|d| d.status == s);
    if any(DeliveryStatus::Completed) {
        TransferStatus::Completed
    } else if any(DeliveryStatus::Cancelled) {
        TransferStatus::Cancelled
    } else {
        TransferStatus::Failed
    }
}
