//! Keyed byte-string hashing and the process-wide hash seed.
//!
//! The seed is 128 bits, set once at startup (or at quiescence) via
//! [`set_seed`]. Hashing is SipHash-1-3 keyed with that seed; changing the
//! seed while dictionaries built on it are live invalidates their bucket
//! placement, so callers must not do that.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

use siphasher::sip::SipHasher13;

static SEED_LO: AtomicU64 = AtomicU64::new(0);
static SEED_HI: AtomicU64 = AtomicU64::new(0);

/// Install the process-wide 128-bit hash seed.
pub fn set_seed(seed: [u8; 16]) {
    let mut lo = [0u8; 8];
    let mut hi = [0u8; 8];
    lo.copy_from_slice(&seed[..8]);
    hi.copy_from_slice(&seed[8..]);
    SEED_LO.store(u64::from_le_bytes(lo), Ordering::Relaxed);
    SEED_HI.store(u64::from_le_bytes(hi), Ordering::Relaxed);
}

/// Read back the process-wide 128-bit hash seed.
pub fn seed() -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&SEED_LO.load(Ordering::Relaxed).to_le_bytes());
    out[8..].copy_from_slice(&SEED_HI.load(Ordering::Relaxed).to_le_bytes());
    out
}

fn keyed_hasher() -> SipHasher13 {
    SipHasher13::new_with_keys(
        SEED_LO.load(Ordering::Relaxed),
        SEED_HI.load(Ordering::Relaxed),
    )
}

/// Seeded keyed hash of a byte string.
pub fn bytes(data: &[u8]) -> u64 {
    let mut h = keyed_hasher();
    h.write(data);
    h.finish()
}

/// Seeded keyed hash of a byte string with ASCII letters folded to
/// lowercase before hashing.
pub fn bytes_nocase(data: &[u8]) -> u64 {
    let mut h = keyed_hasher();
    for &b in data {
        h.write(&[b.to_ascii_lowercase()]);
    }
    h.finish()
}

/// Thomas Wang's 64-bit integer mix. Used to chain the dictionary
/// fingerprint so the same integers in a different order hash differently.
pub(crate) fn avalanche(mut h: u64) -> u64 {
    h = (!h).wrapping_add(h << 21);
    h ^= h >> 24;
    h = h.wrapping_add(h << 3).wrapping_add(h << 8);
    h ^= h >> 14;
    h = h.wrapping_add(h << 2).wrapping_add(h << 4);
    h ^= h >> 28;
    h = h.wrapping_add(h << 31);
    h
}
