//! Shareable room codes and the rendezvous ids derived from them.

use rand::Rng;

use crate::core::error::RoomError;

/// 32 symbols without the look-alikes I, O, 0 and 1.
pub const ROOM_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const ROOM_CODE_LEN: usize = 6;
const RENDEZVOUS_PREFIX: &str = "peerdrop-room-";

pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Trim and uppercase `input`, rejecting anything that is not a room code.
pub fn normalize_room_code(input: &str) -> Result<String, RoomError> {
    let code = input.trim().to_ascii_uppercase();
    let valid = code.len() == ROOM_CODE_LEN
        && code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b));
    if valid {
        Ok(code)
    } else {
        Err(RoomError::InvalidCode(input.to_string()))
    }
}

/// Well-known endpoint id the host listens on.
pub fn rendezvous_id(code: &str) -> String {
    format!("{RENDEZVOUS_PREFIX}{}", code.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_codes_are_valid() {
        for _ in 0..500 {
            let code = generate_room_code();
            assert_eq!(normalize_room_code(&code).unwrap(), code);
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_room_code("  ab3k9z ").unwrap(), "AB3K9Z");
        for bad in ["", "ABCDE", "ABCDEFG", "ABCDE0", "ABCDEI", "ABC-EF", "ÄBCDEF"] {
            assert!(
                matches!(normalize_room_code(bad), Err(RoomError::InvalidCode(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn test_rendezvous_id() {
        assert_eq!(rendezvous_id("AB3K9Z"), "peerdrop-room-ab3k9z");
    }
}
