//! Typed error kinds for the protocol seams.
//!
//! Orchestration code wraps these in `anyhow` where a caller only needs a
//! message; the session driver and the transfer engine match on them.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("authentication failed: ciphertext is malformed or was tampered with")]
    Authentication,
    #[error("session keys are not established")]
    NotReady,
    #[error("invalid peer public key: {0}")]
    InvalidPublicKey(String),
    #[error("unexpected key-exchange message: no handshake is pending")]
    UnexpectedKeyExchange,
    #[error("plaintext {0} message rejected on an encrypted session")]
    PlaintextRejected(&'static str),
    #[error("send IV counter exhausted for this session")]
    IvExhausted,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    Cipher,
    #[error("invalid base64 payload: {0}")]
    Encoding(#[from] base64::DecodeError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel to {0} did not open in time")]
    OpenTimeout(String),
    #[error("channel to {0} is closed")]
    Closed(String),
    #[error("no endpoint named {0} is reachable")]
    UnknownEndpoint(String),
    #[error("endpoint {0} is already listening")]
    EndpointInUse(String),
    #[error("send to {endpoint} failed: {reason}")]
    Send { endpoint: String, reason: String },
    #[error("in-place restart of the channel to {0} failed")]
    RestartFailed(String),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no peers are ready to receive")]
    NoReadyPeers,
    #[error("unknown transfer item {0}")]
    UnknownItem(Uuid),
    #[error("chunk at offset {offset} does not continue the {received} bytes received so far")]
    OutOfOrder { offset: u64, received: u64 },
    #[error("received {received} bytes but only {expected} were announced")]
    Overflow { received: u64, expected: u64 },
    #[error("transfer incomplete: received {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },
    #[error("transfer task stopped unexpectedly: {0}")]
    TaskFailed(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("invalid room code {0:?}: expected 6 characters from ABCDEFGHJKLMNPQRSTUVWXYZ23456789")]
    InvalidCode(String),
    #[error("a room is already active; leave it first")]
    AlreadyActive,
    #[error("not in a room")]
    NotInRoom,
    #[error("handshake with {0} did not complete in time")]
    HandshakeTimeout(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}
