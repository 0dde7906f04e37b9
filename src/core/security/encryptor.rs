//! Per-session AEAD: directional AES-256-GCM keys derived from the
//! handshake secret, counter-based IVs and rolling performance stats.
//!
//! **Key schedule:**
//!
//! ```text
//! key_a = HKDF-SHA256(ikm = shared_secret, salt = [0; 32], info = "a")
//! key_b = HKDF-SHA256(ikm = shared_secret, salt = [0; 32], info = "b")
//!
//! initiator: send = key_a, recv = key_b
//! responder: send = key_b, recv = key_a
//! ```
//!
//! **Sealed payload:** `IV[12] ‖ ciphertext ‖ tag[16]`, where the IV is the
//! little-endian send counter in bytes 0..8 followed by four zero bytes.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::config::CRYPTO_STATS_WINDOW;
use crate::core::error::CryptoError;

/// Length of the IV prefix on every sealed payload.
pub const IV_LEN: usize = 12;
/// Length of the AES-GCM authentication tag.
pub const TAG_LEN: usize = 16;
/// Per-message expansion of a sealed payload.
pub const SEAL_OVERHEAD: usize = IV_LEN + TAG_LEN;

const HKDF_SALT: [u8; 32] = [0u8; 32];
const INFO_A: &[u8] = b"a";
const INFO_B: &[u8] = b"b";

/// Which side of the handshake this session played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the remote endpoint and sent the first key-exchange.
    Initiator,
    /// Accepted the channel and answered the key-exchange.
    Responder,
}

/// The two directional keys of one session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub send: [u8; 32],
    pub recv: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Derive the directional keys for `role` from an ECDH shared secret.
pub fn derive_keys(shared_secret: &[u8; 32], role: Role) -> Result<SessionKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(&HKDF_SALT), shared_secret);
    let mut key_a = [0u8; 32];
    let mut key_b = [0u8; 32];
    hk.expand(INFO_A, &mut key_a)
        .map_err(|_| CryptoError::KeyDerivation)?;
    hk.expand(INFO_B, &mut key_b)
        .map_err(|_| CryptoError::KeyDerivation)?;

    Ok(match role {
        Role::Initiator => SessionKeys {
            send: key_a,
            recv: key_b,
        },
        Role::Responder => SessionKeys {
            send: key_b,
            recv: key_a,
        },
    })
}

fn iv_for(counter: u64) -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    iv[..8].copy_from_slice(&counter.to_le_bytes());
    iv
}

// ── Performance stats ────────────────────────────────────────────────────────

/// Aggregate over the retained samples of one operation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OpStats {
    pub samples: usize,
    pub avg_latency: Duration,
    /// Bytes per second across the retained samples.
    pub throughput_bps: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CryptoStats {
    pub encrypt: OpStats,
    pub decrypt: OpStats,
}

#[derive(Debug, Default)]
struct Window {
    samples: VecDeque<(usize, Duration)>,
}

impl Window {
    fn push(&mut self, bytes: usize, elapsed: Duration) {
        if self.samples.len() == CRYPTO_STATS_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back((bytes, elapsed));
    }

    fn summary(&self) -> OpStats {
        let n = self.samples.len();
        if n == 0 {
            return OpStats::default();
        }
        let bytes: usize = self.samples.iter().map(|(b, _)| b).sum();
        let total: Duration = self.samples.iter().map(|(_, d)| *d).sum();
        let secs = total.as_secs_f64();
        OpStats {
            samples: n,
            avg_latency: total / n as u32,
            throughput_bps: if secs > 0.0 { bytes as f64 / secs } else { 0.0 },
        }
    }
}

#[derive(Debug, Default)]
struct PerfCounters {
    encrypt: Window,
    decrypt: Window,
}

// ── SessionEncryptor ─────────────────────────────────────────────────────────

/// Directional AEAD state for one peer session.
///
/// Safe to share behind an `Arc`: the IV counter is atomic and the stats
/// sit behind their own lock, so concurrent deliveries to the same peer
/// never reuse an IV.
pub struct SessionEncryptor {
    send: Option<Aes256Gcm>,
    recv: Option<Aes256Gcm>,
    send_counter: AtomicU64,
    perf: Mutex<PerfCounters>,
}

impl std::fmt::Debug for SessionEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEncryptor")
            .field("ready", &self.is_ready())
            .field("sent", &self.send_counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for SessionEncryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEncryptor {
    /// An encryptor without keys; every seal/open fails with `NotReady`.
    pub fn new() -> Self {
        Self {
            send: None,
            recv: None,
            send_counter: AtomicU64::new(0),
            perf: Mutex::new(PerfCounters::default()),
        }
    }

    pub fn from_keys(keys: &SessionKeys) -> Self {
        let mut enc = Self::new();
        enc.install(keys);
        enc
    }

    /// Install both directional keys and restart the IV counter.
    pub fn install(&mut self, keys: &SessionKeys) {
        self.send = Some(Aes256Gcm::new((&keys.send).into()));
        self.recv = Some(Aes256Gcm::new((&keys.recv).into()));
        self.send_counter = AtomicU64::new(0);
    }

    pub fn is_ready(&self) -> bool {
        self.send.is_some() && self.recv.is_some()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encrypt_with_aad(plaintext, &[])
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.decrypt_with_aad(sealed, &[])
    }

    /// Seal `plaintext`, binding `aad` into the tag. Returns `IV ‖ ct ‖ tag`.
    pub fn encrypt_with_aad(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.send.as_ref().ok_or(CryptoError::NotReady)?;
        let started = Instant::now();

        let counter = self
            .send_counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_add(1))
            .map_err(|_| CryptoError::IvExhausted)?;
        let iv = iv_for(counter);

        #[allow(deprecated)]
        let nonce = Nonce::from_slice(&iv);
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Cipher)?;

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);

        self.record(true, plaintext.len(), started.elapsed());
        Ok(out)
    }

    /// Open a payload produced by the peer's `encrypt_with_aad` with the same `aad`.
    pub fn decrypt_with_aad(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.recv.as_ref().ok_or(CryptoError::NotReady)?;
        if sealed.len() < IV_LEN {
            return Err(CryptoError::Authentication);
        }
        let started = Instant::now();

        let (iv, ciphertext) = sealed.split_at(IV_LEN);
        #[allow(deprecated)]
        let nonce = Nonce::from_slice(iv);
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Authentication)?;

        self.record(false, plaintext.len(), started.elapsed());
        Ok(plaintext)
    }

    /// Number of payloads sealed so far in this session.
    pub fn sealed_count(&self) -> u64 {
        self.send_counter.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CryptoStats {
        match self.perf.lock() {
            Ok(perf) => CryptoStats {
                encrypt: perf.encrypt.summary(),
                decrypt: perf.decrypt.summary(),
            },
            Err(_) => CryptoStats::default(),
        }
    }

    fn record(&self, encrypt: bool, bytes: usize, elapsed: Duration) {
        if let Ok(mut perf) = self.perf.lock() {
            if encrypt {
                perf.encrypt.push(bytes, elapsed);
            } else {
                perf.decrypt.push(bytes, elapsed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn unhex<const N: usize>(s: &str) -> [u8; N] {
        let mut out = [0u8; N];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).unwrap();
        }
        out
    }

    fn pair() -> (SessionEncryptor, SessionEncryptor) {
        let secret: [u8; 32] = rand::random();
        let init = derive_keys(&secret, Role::Initiator).unwrap();
        let resp = derive_keys(&secret, Role::Responder).unwrap();
        (
            SessionEncryptor::from_keys(&init),
            SessionEncryptor::from_keys(&resp),
        )
    }

    // X25519 shared secret of the RFC 7748 §6.1 Alice/Bob key pairs.
    const SHARED: &str = "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742";
    const KEY_A: &str = "a202e10681088fe08acd1ad5dd164ac854533111c34759d6d449b386ffe6d73f";
    const KEY_B: &str = "24972c2f8d94169c1c30dbef632f24c99fd76a76c65ec71da0b781a11e73c818";
    const PLAINTEXT: &[u8] = b"peerdrop regression vector";

    #[test]
    fn test_roundtrip_both_directions() {
        let (a, b) = pair();
        let sealed = a.encrypt(b"hello").unwrap();
        assert_eq!(sealed.len(), 5 + SEAL_OVERHEAD);
        assert_eq!(b.decrypt(&sealed).unwrap(), b"hello");

        let back = b.encrypt(b"world").unwrap();
        assert_eq!(a.decrypt(&back).unwrap(), b"world");
    }

    #[test]
    fn test_own_payload_does_not_open_with_own_recv_key() {
        let (a, _b) = pair();
        let sealed = a.encrypt(b"loopback").unwrap();
        assert!(matches!(a.decrypt(&sealed), Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_any_flipped_byte_fails() {
        let (a, b) = pair();
        let sealed = a.encrypt(b"integrity matters").unwrap();
        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(
                matches!(b.decrypt(&tampered), Err(CryptoError::Authentication)),
                "flip at byte {i} was accepted"
            );
        }
    }

    #[test]
    fn test_short_input_is_authentication_error() {
        let (_a, b) = pair();
        assert!(matches!(b.decrypt(&[0u8; 11]), Err(CryptoError::Authentication)));
        assert!(matches!(b.decrypt(&[0u8; 12]), Err(CryptoError::Authentication)));
        assert!(matches!(b.decrypt(&[]), Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_not_ready_without_keys() {
        let enc = SessionEncryptor::new();
        assert!(!enc.is_ready());
        assert!(matches!(enc.encrypt(b"x"), Err(CryptoError::NotReady)));
        assert!(matches!(enc.decrypt(&[0u8; 40]), Err(CryptoError::NotReady)));
    }

    #[test]
    fn test_ivs_are_pairwise_distinct_and_counted() {
        let (a, _b) = pair();
        let mut seen = HashSet::new();
        for i in 0..1000u64 {
            let sealed = a.encrypt(b"same plaintext").unwrap();
            let iv: [u8; IV_LEN] = sealed[..IV_LEN].try_into().unwrap();
            assert_eq!(&iv[..8], &i.to_le_bytes());
            assert_eq!(&iv[8..], &[0u8; 4]);
            assert!(seen.insert(iv), "IV reused at message {i}");
        }
        assert_eq!(a.sealed_count(), 1000);
    }

    #[test]
    fn test_aad_binds_chunk_position() {
        let (a, b) = pair();
        let sealed = a.encrypt_with_aad(b"chunk", b"item-0").unwrap();
        assert_eq!(b.decrypt_with_aad(&sealed, b"item-0").unwrap(), b"chunk");
        assert!(matches!(
            b.decrypt_with_aad(&sealed, b"item-1"),
            Err(CryptoError::Authentication)
        ));
        assert!(matches!(b.decrypt(&sealed), Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_key_schedule_regression_vector() {
        let shared: [u8; 32] = unhex(SHARED);
        let init = derive_keys(&shared, Role::Initiator).unwrap();
        let resp = derive_keys(&shared, Role::Responder).unwrap();

        assert_eq!(hex(&init.send), KEY_A);
        assert_eq!(hex(&init.recv), KEY_B);
        assert_eq!(init.send, resp.recv);
        assert_eq!(init.recv, resp.send);
    }

    #[test]
    fn test_ciphertext_regression_vector() {
        let shared: [u8; 32] = unhex(SHARED);
        let init = derive_keys(&shared, Role::Initiator).unwrap();
        let resp = derive_keys(&shared, Role::Responder).unwrap();

        // Counter 0 under key_a, sealed by the initiator.
        let initiator = SessionEncryptor::from_keys(&init);
        let sealed = initiator.encrypt(PLAINTEXT).unwrap();
        assert_eq!(
            hex(&sealed),
            format!(
                "{}{}",
                "000000000000000000000000",
                "414258596045c5df985b7a81402db5dbd04b79cd48e501d5ff8c68e23fe802a55ce701ed05d94e53ca56"
            )
        );

        // A responder mirrored onto key_a produces the same bytes at the same IV.
        let mirrored = SessionEncryptor::from_keys(&SessionKeys {
            send: resp.recv,
            recv: resp.send,
        });
        assert_eq!(mirrored.encrypt(PLAINTEXT).unwrap(), sealed);

        // Counter 1 under key_b, sealed by the responder.
        let responder = SessionEncryptor::from_keys(&resp);
        responder.encrypt(b"warm-up").unwrap();
        let second = responder.encrypt(PLAINTEXT).unwrap();
        assert_eq!(
            hex(&second),
            format!(
                "{}{}",
                "010000000000000000000000",
                "16270f86d480b636a12cf1182f9995d6150341a1beb399994c20cc87af337bfc7ce087222a8af9c84459"
            )
        );
        assert_eq!(initiator.decrypt(&second).unwrap(), PLAINTEXT);
    }

    #[test]
    fn test_stats_window_is_bounded() {
        let (a, b) = pair();
        for _ in 0..(CRYPTO_STATS_WINDOW + 20) {
            let sealed = a.encrypt(&[7u8; 256]).unwrap();
            b.decrypt(&sealed).unwrap();
        }
        let stats = a.stats();
        assert_eq!(stats.encrypt.samples, CRYPTO_STATS_WINDOW);
        assert_eq!(stats.decrypt.samples, 0);
        assert_eq!(b.stats().decrypt.samples, CRYPTO_STATS_WINDOW);
    }
}
