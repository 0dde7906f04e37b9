//! One-round-trip X25519 handshake run on every channel open.
//!
//! ```text
//! Initiator                          Responder
//! ─────────                          ─────────
//! key-exchange{pk_I}  ─────────────►  derive(responder)
//!                     ◄─────────────  key-exchange{pk_R}
//! derive(initiator)
//! ```
//!
//! The key pair lives only until the peer's public key arrives.

use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::core::error::CryptoError;
use crate::core::protocol::{decode_payload, encode_payload, WireMessage};
use crate::core::security::encryptor::{derive_keys, Role, SessionEncryptor};

// ── X25519 ECDH ──────────────────────────────────────────────────────────────

/// An ephemeral X25519 key pair backed by `x25519-dalek`.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    pub public: [u8; 32],
}

impl EphemeralKeypair {
    /// Generate a fresh random ephemeral key pair.
    pub fn generate() -> Self {
        Self::from_secret_bytes(rand::random())
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = *X25519PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    /// Perform ECDH with the peer's public key.
    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let peer_pk = X25519PublicKey::from(*peer_public);
        *self.secret.diffie_hellman(&peer_pk).as_bytes()
    }
}

// ── Handshake state ──────────────────────────────────────────────────────────

/// Result of accepting the peer's public key.
pub struct HandshakeOutcome {
    pub encryptor: SessionEncryptor,
    /// Responders must send this back before the session is usable remotely.
    pub reply: Option<WireMessage>,
}

/// Pending handshake for one channel.
pub struct KeyExchange {
    role: Role,
    keypair: Option<EphemeralKeypair>,
}

impl KeyExchange {
    pub fn new(role: Role) -> Self {
        Self::with_keypair(role, EphemeralKeypair::generate())
    }

    pub fn with_keypair(role: Role, keypair: EphemeralKeypair) -> Self {
        Self {
            role,
            keypair: Some(keypair),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_pending(&self) -> bool {
        self.keypair.is_some()
    }

    /// The message an initiator sends as soon as the channel opens.
    pub fn opening_message(&self) -> Option<WireMessage> {
        match (self.role, &self.keypair) {
            (Role::Initiator, Some(kp)) => Some(public_key_message(kp)),
            _ => None,
        }
    }

    /// Consume the peer's `publicKey` and derive the session keys.
    ///
    /// The key pair is dropped afterwards; a second call fails with
    /// `UnexpectedKeyExchange`.
    pub fn accept(&mut self, peer_public_b64: &str) -> Result<HandshakeOutcome, CryptoError> {
        let keypair = self
            .keypair
            .take()
            .ok_or(CryptoError::UnexpectedKeyExchange)?;

        let raw = decode_payload(peer_public_b64)?;
        let peer_public: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidPublicKey(format!("expected 32 bytes, got {}", raw.len()))
        })?;

        let shared = keypair.diffie_hellman(&peer_public);
        if shared == [0u8; 32] {
            return Err(CryptoError::InvalidPublicKey(
                "low-order point produces an all-zero secret".into(),
            ));
        }

        let keys = derive_keys(&shared, self.role)?;
        let reply = match self.role {
            Role::Responder => Some(public_key_message(&keypair)),
            Role::Initiator => None,
        };

        Ok(HandshakeOutcome {
            encryptor: SessionEncryptor::from_keys(&keys),
            reply,
        })
    }
}

fn public_key_message(keypair: &EphemeralKeypair) -> WireMessage {
    WireMessage::KeyExchange {
        public_key: encode_payload(&keypair.public),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).unwrap();
        }
        out
    }

    fn public_of(message: &WireMessage) -> String {
        match message {
            WireMessage::KeyExchange { public_key } => public_key.clone(),
            other => panic!("expected key-exchange, got {}", other.kind()),
        }
    }

    #[test]
    fn test_x25519_rfc7748_vector1() {
        // RFC 7748 §6.1, first test vector
        let scalar = unhex("a546e36bf0527c9d3b16154b82465edd62144c0ac1fc5a18506a2244ba449ac4");
        let input_u = unhex("e6db6867583030db3594c1a424b15f7c726624ec26b3353b10a903a6d0ab1c4c");
        let expected = unhex("c3da55379de9c6908e94ea4df28d084f32eccf03491c71f754b4075577a28552");
        let kp = EphemeralKeypair::from_secret_bytes(scalar);
        assert_eq!(kp.diffie_hellman(&input_u), expected);
    }

    #[test]
    fn test_ecdh_symmetry() {
        let alice = EphemeralKeypair::generate();
        let bob = EphemeralKeypair::generate();
        assert_eq!(
            alice.diffie_hellman(&bob.public),
            bob.diffie_hellman(&alice.public),
            "ECDH must be commutative"
        );
    }

    #[test]
    fn test_full_handshake_yields_matching_encryptors() {
        let mut initiator = KeyExchange::new(Role::Initiator);
        let mut responder = KeyExchange::new(Role::Responder);
        assert!(responder.opening_message().is_none());

        let hello = initiator.opening_message().unwrap();
        let resp = responder.accept(&public_of(&hello)).unwrap();
        let reply = resp.reply.expect("responder must answer");
        let init = initiator.accept(&public_of(&reply)).unwrap();
        assert!(init.reply.is_none());
        assert!(!initiator.is_pending() && !responder.is_pending());

        let sealed = init.encryptor.encrypt(b"over the wire").unwrap();
        assert_eq!(resp.encryptor.decrypt(&sealed).unwrap(), b"over the wire");
        let sealed = resp.encryptor.encrypt(b"and back").unwrap();
        assert_eq!(init.encryptor.decrypt(&sealed).unwrap(), b"and back");
    }

    #[test]
    fn test_rfc7748_pairs_agree_on_session_keys() {
        // RFC 7748 §6.1 Alice / Bob private keys.
        let alice = EphemeralKeypair::from_secret_bytes(unhex(
            "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a",
        ));
        let bob = EphemeralKeypair::from_secret_bytes(unhex(
            "5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb",
        ));
        assert_eq!(
            alice.public,
            unhex("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
        );

        let mut initiator = KeyExchange::with_keypair(Role::Initiator, alice);
        let mut responder = KeyExchange::with_keypair(Role::Responder, bob);
        let hello = initiator.opening_message().unwrap();
        let resp = responder.accept(&public_of(&hello)).unwrap();
        let init = initiator.accept(&public_of(&resp.reply.unwrap())).unwrap();

        // First sealed payloads of both sides match the regression vectors.
        let p = b"peerdrop regression vector";
        let a = init.encryptor.encrypt(p).unwrap();
        assert_eq!(resp.encryptor.decrypt(&a).unwrap(), p);
        assert_eq!(
            a[12..],
            hex_bytes("414258596045c5df985b7a81402db5dbd04b79cd48e501d5ff8c68e23fe802a55ce701ed05d94e53ca56")[..]
        );
    }

    fn hex_bytes(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_second_key_exchange_is_rejected() {
        let mut responder = KeyExchange::new(Role::Responder);
        let peer = EphemeralKeypair::generate();
        let pk = encode_payload(&peer.public);
        responder.accept(&pk).unwrap();
        assert!(matches!(
            responder.accept(&pk),
            Err(CryptoError::UnexpectedKeyExchange)
        ));
    }

    #[test]
    fn test_malformed_public_keys() {
        let mut kx = KeyExchange::new(Role::Responder);
        assert!(matches!(
            kx.accept(&encode_payload(&[1u8; 31])),
            Err(CryptoError::InvalidPublicKey(_))
        ));

        let mut kx = KeyExchange::new(Role::Responder);
        assert!(matches!(kx.accept("@@not base64@@"), Err(CryptoError::Encoding(_))));

        let mut kx = KeyExchange::new(Role::Responder);
        assert!(matches!(
            kx.accept(&encode_payload(&[0u8; 32])),
            Err(CryptoError::InvalidPublicKey(_))
        ));
    }
}
