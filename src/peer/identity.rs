//! Peer identifier generation and validation

use rand::Rng;

/// Alphabet for generated identifiers.
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Shortest identifier the relay will bind.
pub const MIN_ID_LEN: usize = 4;

/// Longest identifier the relay will bind.
pub const MAX_ID_LEN: usize = 10;

/// Generate a random identifier of `length` characters drawn uniformly from
/// a lowercase alphanumeric alphabet. Collision avoidance is the relay's
/// concern, not the generator's.
pub fn generate(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Check that an identifier is 4-10 printable ASCII characters. Both the
/// relay (on channel open) and the manager (on connect) enforce this.
pub fn validate(id: &str) -> bool {
    (MIN_ID_LEN..=MAX_ID_LEN).contains(&id.len()) && id.chars().all(|c| c.is_ascii_graphic())
}
