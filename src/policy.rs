//! Key/value policy: the capability bundle a dictionary is built over.

use core::marker::PhantomData;

use crate::hash;

/// Hashing, equality, and teardown hooks for one dictionary.
///
/// The policy value is stored inside the dictionary and passed to every
/// hook by reference, so policy fields act as per-dictionary private data.
/// The dictionary never inspects keys or values itself; everything routes
/// through these methods.
pub trait Policy {
    type Key;
    type Value;

    /// Hash a key. Must be pure and deterministic for the lifetime of the
    /// dictionary; entries are re-hashed during migration.
    fn hash(&self, key: &Self::Key) -> u64;

    /// Key equality, consistent with `hash`.
    fn key_equal(&self, a: &Self::Key, b: &Self::Key) -> bool;

    /// Tear down a key removed from the dictionary.
    fn destroy_key(&self, key: Self::Key) {
        drop(key);
    }

    /// Tear down a value removed from the dictionary (including the old
    /// value replaced by [`Dict::replace`](crate::Dict::replace)).
    fn destroy_value(&self, value: Self::Value) {
        drop(value);
    }
}

/// Byte-string keys hashed with the process-wide keyed hash.
pub struct BytesPolicy<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> BytesPolicy<V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for BytesPolicy<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Policy for BytesPolicy<V> {
    type Key = Vec<u8>;
    type Value = V;

    fn hash(&self, key: &Vec<u8>) -> u64 {
        hash::bytes(key)
    }

    fn key_equal(&self, a: &Vec<u8>, b: &Vec<u8>) -> bool {
        a == b
    }
}

/// Byte-string keys compared and hashed without regard to ASCII case.
pub struct AsciiNocasePolicy<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> AsciiNocasePolicy<V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for AsciiNocasePolicy<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Policy for AsciiNocasePolicy<V> {
    type Key = Vec<u8>;
    type Value = V;

    fn hash(&self, key: &Vec<u8>) -> u64 {
        hash::bytes_nocase(key)
    }

    fn key_equal(&self, a: &Vec<u8>, b: &Vec<u8>) -> bool {
        a.eq_ignore_ascii_case(b)
    }
}
