//! Session security: the per-channel X25519 handshake and the directional
//! AES-256-GCM encryptor it produces.

pub mod encryptor;
pub mod key_exchange;

pub use encryptor::{derive_keys, CryptoStats, Role, SessionEncryptor, SessionKeys};
pub use key_exchange::{EphemeralKeypair, HandshakeOutcome, KeyExchange};
