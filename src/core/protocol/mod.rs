pub mod wire;

pub use wire::WireMessage;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::core::error::CryptoError;

/// Standard base64 of a sealed payload.
pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(STANDARD.decode(encoded)?)
}
