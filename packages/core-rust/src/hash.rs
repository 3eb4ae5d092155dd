//! FNV-1a hashing for chunk-to-partition routing.
//!
//! The distributor routes every chunk signature to a partition slot with a
//! 32-bit FNV-1a hash of the signature bytes. The hash is stable across
//! processes and releases, so a signature always lands on the same slot for
//! a given partition count.

use crate::signature::Signature;

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash over raw bytes.
///
/// # Examples
///
/// ```
/// use ddb_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash(b""), 2_166_136_261); // FNV offset basis
/// assert_eq!(fnv1a_hash(b"a"), 0xe40c_292c);
/// ```
#[must_use]
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps a signature onto one of `slots` partition slots.
///
/// Returns 0 when `slots` is 0 so callers never divide by zero; they are
/// expected to reject empty partition lists before routing.
#[must_use]
pub fn route_slot(signature: &Signature, slots: usize) -> usize {
    if slots == 0 {
        return 0;
    }
    (fnv1a_hash(signature.as_bytes()) as usize) % slots
}
