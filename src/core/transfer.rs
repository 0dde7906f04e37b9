//! Transfer items as the rest of the application sees them.

use bytes::Bytes;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::error::TransferError;
use crate::core::pipeline::progress::PeerDelivery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Cancelled,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemContent {
    Text(String),
    File {
        name: String,
        size: u64,
        /// Reassembled bytes, present once an inbound file completes.
        data: Option<Bytes>,
    },
}

/// Observable state of one text or file item.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub item_id: Uuid,
    pub direction: TransferDirection,
    /// Sender of an inbound item.
    pub peer_id: Option<String>,
    pub content: ItemContent,
    pub status: TransferStatus,
    pub transferred: u64,
    pub speed_bps: f64,
    pub eta: Option<Duration>,
    /// Per-peer delivery state of an outbound file.
    pub deliveries: Vec<PeerDelivery>,
}

impl TransferRecord {
    pub fn outbound_text(item_id: Uuid, text: String, status: TransferStatus) -> Self {
        let size = text.len() as u64;
        Self {
            item_id,
            direction: TransferDirection::Outbound,
            peer_id: None,
            content: ItemContent::Text(text),
            status,
            transferred: size,
            speed_bps: 0.0,
            eta: None,
            deliveries: Vec::new(),
        }
    }

    pub fn inbound_text(peer_id: &str, text: String) -> Self {
        let size = text.len() as u64;
        Self {
            item_id: Uuid::new_v4(),
            direction: TransferDirection::Inbound,
            peer_id: Some(peer_id.to_string()),
            content: ItemContent::Text(text),
            status: TransferStatus::Completed,
            transferred: size,
            speed_bps: 0.0,
            eta: None,
            deliveries: Vec::new(),
        }
    }

    pub fn file(
        item_id: Uuid,
        direction: TransferDirection,
        peer_id: Option<String>,
        name: &str,
        size: u64,
    ) -> Self {
        Self {
            item_id,
            direction,
            peer_id,
            content: ItemContent::File {
                name: name.to_string(),
                size,
                data: None,
            },
            status: TransferStatus::Transferring,
            transferred: 0,
            speed_bps: 0.0,
            eta: None,
            deliveries: Vec::new(),
        }
    }

    pub fn size(&self) -> u64 {
        match &self.content {
            ItemContent::Text(t) => t.len() as u64,
            ItemContent::File { size, .. } => *size,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            ItemContent::Text(t) => Some(t),
            ItemContent::File { .. } => None,
        }
    }

    pub fn file_data(&self) -> Option<&Bytes> {
        match &self.content {
            ItemContent::File { data, .. } => data.as_ref(),
            ItemContent::Text(_) => None,
        }
    }
}

/// A file held in memory, ready to fan out.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub data: Bytes,
}

impl OutgoingFile {
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::from_bytes(name, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Final state of a send job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub item_id: Uuid,
    pub status: TransferStatus,
    pub deliveries: Vec<PeerDelivery>,
}

/// Handle to an in-flight multi-peer file send.
#[derive(Debug)]
pub struct SendJob {
    pub(crate) item_id: Uuid,
    pub(crate) peers: Vec<String>,
    pub(crate) progress: watch::Receiver<TransferRecord>,
    pub(crate) outcome: JoinHandle<JobOutcome>,
}

impl SendJob {
    pub fn item_id(&self) -> Uuid {
        self.item_id
    }

    /// Peers that were ready when the job started.
    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Live record, refreshed at the progress cadence.
    pub fn progress(&self) -> watch::Receiver<TransferRecord> {
        self.progress.clone()
    }

    pub async fn wait(self) -> Result<JobOutcome, TransferError> {
        self.outcome
            .await
            .map_err(|e| TransferError::TaskFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outgoing_file_from_path() {
        let dir = std::env::temp_dir().join(format!("peerdrop-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("notes.txt");
        tokio::fs::write(&path, b"some notes").await.unwrap();

        let file = OutgoingFile::from_path(&path).await.unwrap();
        assert_eq!(file.name, "notes.txt");
        assert_eq!(file.size(), 10);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn test_record_accessors() {
        let r = TransferRecord::inbound_text("p", "hey".into());
        assert_eq!(r.text(), Some("hey"));
        assert_eq!(r.size(), 3);
        assert!(r.status.is_terminal());
        assert!(r.file_data().is_none());
    }
}
