//! JSON wire messages exchanged over a peer channel.
//!
//! Every message is a JSON object tagged by `type` (kebab-case) with
//! camelCase fields. Only `key-exchange`, `encrypted` and encrypted
//! `file-chunk` messages travel in the clear; every other variant is a
//! control message sealed inside an `encrypted` envelope.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{CryptoError, TransferError};
use crate::core::protocol::{decode_payload, encode_payload};
use crate::core::security::SessionEncryptor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    KeyExchange {
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    Encrypted {
        encrypted: String,
    },
    Text {
        content: String,
    },
    FileStart {
        name: String,
        size: u64,
        #[serde(rename = "itemId")]
        item_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<u64>,
    },
    FileChunk {
        #[serde(rename = "itemId")]
        item_id: Uuid,
        offset: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypted: Option<String>,
    },
    FileEnd {
        #[serde(rename = "itemId")]
        item_id: Uuid,
    },
    FileCancel {
        #[serde(rename = "itemId")]
        item_id: Uuid,
    },
    Ping {
        id: u64,
    },
    Pong {
        id: u64,
    },
    PeerJoined,
    RoomDissolved,
}

impl WireMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::KeyExchange { .. } => "key-exchange",
            WireMessage::Encrypted { .. } => "encrypted",
            WireMessage::Text { .. } => "text",
            WireMessage::FileStart { .. } => "file-start",
            WireMessage::FileChunk { .. } => "file-chunk",
            WireMessage::FileEnd { .. } => "file-end",
            WireMessage::FileCancel { .. } => "file-cancel",
            WireMessage::Ping { .. } => "ping",
            WireMessage::Pong { .. } => "pong",
            WireMessage::PeerJoined => "peer-joined",
            WireMessage::RoomDissolved => "room-dissolved",
        }
    }

    /// Whether this message may only travel inside an `encrypted` envelope.
    pub fn is_control(&self) -> bool {
        !matches!(
            self,
            WireMessage::KeyExchange { .. }
                | WireMessage::Encrypted { .. }
                | WireMessage::FileChunk { .. }
        )
    }
}

/// Associated data binding a file chunk to its item and position.
pub fn chunk_aad(item_id: &Uuid, offset: u64) -> [u8; 24] {
    let mut aad = [0u8; 24];
    aad[..16].copy_from_slice(item_id.as_bytes());
    aad[16..].copy_from_slice(&offset.to_le_bytes());
    aad
}

/// Wrap a control message in an `encrypted` envelope and serialize it.
pub fn seal_control(
    encryptor: &SessionEncryptor,
    message: &WireMessage,
) -> Result<String, TransferError> {
    let inner = serde_json::to_vec(message)?;
    let sealed = encryptor.encrypt(&inner)?;
    Ok(WireMessage::Encrypted {
        encrypted: encode_payload(&sealed),
    }
    .encode()?)
}

/// Open an `encrypted` envelope. The inner message must be a control message.
pub fn open_control(
    encryptor: &SessionEncryptor,
    encrypted: &str,
) -> Result<WireMessage, TransferError> {
    let sealed = decode_payload(encrypted)?;
    let inner = encryptor.decrypt(&sealed)?;
    let message: WireMessage = serde_json::from_slice(&inner)?;
    if !message.is_control() {
        return Err(CryptoError::PlaintextRejected(message.kind()).into());
    }
    Ok(message)
}

/// Seal one file chunk into a `file-chunk` message.
pub fn seal_chunk(
    encryptor: &SessionEncryptor,
    item_id: Uuid,
    offset: u64,
    data: &[u8],
) -> Result<String, TransferError> {
    let sealed = encryptor.encrypt_with_aad(data, &chunk_aad(&item_id, offset))?;
    Ok(WireMessage::FileChunk {
        item_id,
        offset,
        data: None,
        encrypted: Some(encode_payload(&sealed)),
    }
    .encode()?)
}

/// Open the encrypted payload of a `file-chunk` message.
pub fn open_chunk(
    encryptor: &SessionEncryptor,
    item_id: &Uuid,
    offset: u64,
    encrypted: &str,
) -> Result<Vec<u8>, TransferError> {
    let sealed = decode_payload(encrypted)?;
    Ok(encryptor.decrypt_with_aad(&sealed, &chunk_aad(item_id, offset))?)
}
