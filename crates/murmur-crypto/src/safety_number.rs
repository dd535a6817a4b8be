//! Safety number rendering for out-of-band identity verification.
//!
//! Both parties compute the same digits from the pair of identity keys, so
//! the rendering must not depend on who runs it: the keys are sorted before
//! hashing. The number changes if and only if one of the identity keys
//! changes, which is exactly the event a user should re-verify after.

use sha2::{Digest, Sha256};

/// Number of hash bytes rendered into digits.
const RENDERED_BYTES: usize = 20;

/// Digits per display group.
const GROUP_SIZE: usize = 5;

/// Compute the human-comparable safety number for a pair of identity keys.
///
/// Each of the first 20 SHA-256 bytes becomes three decimal digits, grouped
/// five at a time: twelve groups of five digits separated by spaces.
pub fn compute(ours: &[u8; 32], theirs: &[u8; 32]) -> String {
    let (first, second) = if ours <= theirs {
        (ours, theirs)
    } else {
        (theirs, ours)
    };

    let mut hasher = Sha256::new();
    hasher.update(first);
    hasher.update(second);
    let digest = hasher.finalize();

    let digits: String = digest[..RENDERED_BYTES]
        .iter()
        .map(|b| format!("{b:03}"))
        .collect();

    digits
        .as_bytes()
        .chunks(GROUP_SIZE)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ")
}
