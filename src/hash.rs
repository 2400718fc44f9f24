//! Content hashing
//!
//! Keys of the heap are canonically the SHA-256 of their value
//! ("content-addressed"). The slot hash is derived from a second hash of the
//! key so it never correlates with the std `HashMap` hashing used by the
//! cache tiers.

use sha2::{Digest, Sha256};

/// Length of a content hash
pub const CONTENT_HASH_LEN: usize = 32;

/// Mask keeping slot hashes non-negative as a signed 64-bit value
const SLOT_HASH_MASK: u64 = 0x7FFF_FFFF_FFFF_FFFF;

/// Signature of a slot hash function
pub type SlotHashFn = fn(&[u8]) -> u64;

/// SHA-256 of `bytes`
pub fn content_hash(bytes: &[u8]) -> [u8; CONTENT_HASH_LEN] {
    Sha256::digest(bytes).into()
}

/// Whether `key` is the content hash of `value`
pub fn is_content_addressed(key: &[u8], value: &[u8]) -> bool {
    key.len() == CONTENT_HASH_LEN && content_hash(value).as_slice() == key
}

/// Slot hash of a key: the last 8 bytes of its content hash, little-endian,
/// masked to 63 bits
pub fn slot_hash(key: &[u8]) -> u64 {
    let digest = content_hash(key);
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&digest[CONTENT_HASH_LEN - 8..]);
    u64::from_le_bytes(tail) & SLOT_HASH_MASK
}
