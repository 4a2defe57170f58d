//! Chat message identifiers.

use huddle_protocol::now_millis;
use rand::Rng;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of the random suffix.
const SUFFIX_LEN: usize = 6;

/// Generate a message ID.
///
/// The id is the current time in base 36 followed by a short random
/// suffix. It sorts by creation time within a room and is unique enough
/// for display deduplication; it is not a secure identifier.
#[must_use]
pub fn generate_message_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();

    format!("{}-{}", to_base36(now_millis()), suffix)
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::new();
    while value > 0 {
        digits.push(ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn test_message_id_shape() {
        let id = generate_message_id();
        let (stamp, suffix) = id.split_once('-').unwrap();

        assert!(!stamp.is_empty());
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(id.bytes().all(|b| b == b'-' || ALPHABET.contains(&b)));
    }

    #[test]
    fn test_unique_message_ids() {
        let id1 = generate_message_id();
        let id2 = generate_message_id();
        // IDs should be different (with high probability)
        assert_ne!(id1, id2);
    }
}
