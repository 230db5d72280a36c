//! The dictionary core: dual-table layout, mutation and lookup, growth
//! policy, and the incremental rehash engine.

use core::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::hash::avalanche;
use crate::policy::Policy;
use crate::table::{Entry, Link, Table};

/// Capacity of the primary table after the first insertion.
pub const INITIAL_CAPACITY: usize = 4;

/// When automatic resizing is disabled, growth still happens once the
/// entries-per-bucket ratio exceeds this.
const FORCE_RESIZE_RATIO: usize = 5;

static RESIZE_ENABLED: AtomicBool = AtomicBool::new(true);

/// Allow automatic growth at a 1:1 load factor (the default).
pub fn enable_resize() {
    RESIZE_ENABLED.store(true, Ordering::Relaxed);
}

/// Defer automatic growth until the load factor exceeds the force ratio.
/// Useful while an external process depends on the table memory staying
/// put (e.g. copy-on-write snapshots).
pub fn disable_resize() {
    RESIZE_ENABLED.store(false, Ordering::Relaxed);
}

fn resize_enabled() -> bool {
    RESIZE_ENABLED.load(Ordering::Relaxed)
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertError {
    DuplicateKey,
}

/// Refusals from the explicit resize operations. These are invariant
/// violations or bad timing, never allocation failures.
#[derive(Debug, PartialEq, Eq)]
pub enum ResizeError {
    /// An incremental rehash is already in progress.
    Rehashing,
    /// Automatic resizing is disabled process-wide.
    Disabled,
    /// The requested capacity cannot hold the entries already stored.
    TooSmall,
    /// The requested capacity equals the current one.
    SameSize,
}

/// Outcome of [`Dict::replace`].
#[derive(Debug, PartialEq, Eq)]
pub enum Replace {
    Inserted,
    Overwritten,
}

/// Outcome of [`Dict::add_raw`]: either a freshly linked entry, or the
/// entry already holding the key together with the rejected key.
pub enum RawEntry<'a, K, V> {
    Added(&'a mut Entry<K, V>),
    Existing(&'a mut Entry<K, V>, K),
}

/// An entry spliced out of the dictionary but not yet torn down.
///
/// Dropping it releases the key and value through their plain `Drop`
/// impls; hand it to [`Dict::free_unlinked`] to run the policy destructors
/// instead, or take ownership with [`UnlinkedEntry::into_pair`].
pub struct UnlinkedEntry<K, V> {
    entry: Box<Entry<K, V>>,
}

impl<K, V> UnlinkedEntry<K, V> {
    pub fn key(&self) -> &K {
        self.entry.key()
    }

    pub fn value(&self) -> &V {
        self.entry.value()
    }

    pub fn value_mut(&mut self) -> &mut V {
        self.entry.value_mut()
    }

    pub fn into_pair(self) -> (K, V) {
        let Entry { key, value, .. } = *self.entry;
        (key, value)
    }
}

enum Slot<K, V> {
    Vacant { table: usize, bucket: usize },
    Occupied(NonNull<Entry<K, V>>),
}

enum Matcher<'a, K> {
    Key(&'a K),
    Identity(*const K),
}

impl<K> Clone for Matcher<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Matcher<'_, K> {}

/// A chained hash dictionary with incremental rehashing.
///
/// Two tables back the dictionary: at rest every entry lives in the
/// primary; during a rehash, buckets migrate one at a time into the
/// secondary while both tables stay queryable. Migration cost is stolen
/// in single steps from ordinary lookups and mutations, or paid down
/// explicitly with [`Dict::rehash`] / [`Dict::rehash_for`].
pub struct Dict<P: Policy> {
    pub(crate) policy: P,
    pub(crate) tables: [Table<P::Key, P::Value>; 2],
    /// Next primary bucket awaiting migration; -1 when not rehashing.
    pub(crate) rehash_index: isize,
    /// Live safe iterators and in-flight scans. While non-zero, passive
    /// rehash steps are suppressed.
    pub(crate) iterators: usize,
}

impl<P: Policy> Dict<P> {
    pub fn new(policy: P) -> Self {
        Self {
            policy,
            tables: [Table::default(), Table::default()],
            rehash_index: -1,
            iterators: 0,
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Number of live entries across both tables.
    pub fn len(&self) -> usize {
        self.tables[0].used + self.tables[1].used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bucket count across both tables.
    pub fn capacity(&self) -> usize {
        self.tables[0].capacity() + self.tables[1].capacity()
    }

    pub fn is_rehashing(&self) -> bool {
        self.rehash_index != -1
    }

    /// Hash of a key under this dictionary's policy. Pair with the
    /// identity lookups to avoid re-hashing a key the caller no longer
    /// owns.
    pub fn get_hash(&self, key: &P::Key) -> u64 {
        self.policy.hash(key)
    }

    /// A 64-bit digest of the dictionary's shape: backing addresses,
    /// capacities, and entry counts of both tables, avalanche-chained so
    /// order matters. Any mutation or migration that touches those fields
    /// produces a different fingerprint.
    pub fn fingerprint(&self) -> u64 {
        let fields = [
            self.tables[0].backing_addr(),
            self.tables[0].capacity() as u64,
            self.tables[0].used as u64,
            self.tables[1].backing_addr(),
            self.tables[1].capacity() as u64,
            self.tables[1].used as u64,
        ];
        let mut h = 0u64;
        for field in fields {
            h = avalanche(h.wrapping_add(field));
        }
        h
    }

    // ---- growth and rehash ----------------------------------------------

    /// Grow (or first-allocate) to at least `capacity` buckets, rounded up
    /// to a power of two. Except for the first allocation, this installs
    /// the secondary table and starts an incremental rehash.
    pub fn expand(&mut self, capacity: usize) -> Result<(), ResizeError> {
        if self.is_rehashing() {
            return Err(ResizeError::Rehashing);
        }
        if self.tables[0].used > capacity {
            return Err(ResizeError::TooSmall);
        }
        let target = next_power(capacity);
        if target == self.tables[0].capacity() {
            return Err(ResizeError::SameSize);
        }

        let table = Table::with_capacity(target);
        if self.tables[0].capacity() == 0 {
            // First allocation: no entries to migrate, no rehash.
            self.tables[0] = table;
            return Ok(());
        }
        debug!(
            "growing dictionary {} -> {} buckets, incremental rehash started",
            self.tables[0].capacity(),
            target
        );
        self.tables[1] = table;
        self.rehash_index = 0;
        Ok(())
    }

    /// Shrink-or-grow so the load factor lands near 1. Refused while
    /// rehashing or while automatic resizing is disabled.
    pub fn resize_to_fit(&mut self) -> Result<(), ResizeError> {
        if !resize_enabled() {
            return Err(ResizeError::Disabled);
        }
        if self.is_rehashing() {
            return Err(ResizeError::Rehashing);
        }
        let minimal = self.tables[0].used.max(INITIAL_CAPACITY);
        self.expand(minimal)
    }

    /// Migrate up to `n` non-empty buckets from the primary into the
    /// secondary, visiting at most `10 * n` empty buckets along the way.
    /// Returns true while migration work remains.
    pub fn rehash(&mut self, n: usize) -> bool {
        if !self.is_rehashing() {
            return false;
        }
        let mut empty_visits = n * 10;
        let mut remaining = n;

        while remaining > 0 && self.tables[0].used != 0 {
            remaining -= 1;
            // used != 0 guarantees a populated bucket at or past the index.
            debug_assert!((self.rehash_index as usize) < self.tables[0].capacity());
            while self.tables[0].bucket(self.rehash_index as usize).is_none() {
                self.rehash_index += 1;
                empty_visits -= 1;
                if empty_visits == 0 {
                    return true;
                }
            }

            let index = self.rehash_index as usize;
            let mut link = self.tables[0].take_bucket(index);
            while let Some(p) = link {
                let entry = unsafe { &mut *p.as_ptr() };
                link = entry.next;
                // Entries move by pointer: only the next link and the
                // target bucket head are rewritten.
                let target = (self.policy.hash(&entry.key) & self.tables[1].mask()) as usize;
                entry.next = self.tables[1].bucket(target);
                self.tables[1].set_bucket(target, Some(p));
                self.tables[0].used -= 1;
                self.tables[1].used += 1;
            }
            self.rehash_index += 1;
        }

        if self.tables[0].used == 0 {
            self.tables[0] = core::mem::take(&mut self.tables[1]);
            self.rehash_index = -1;
            trace!(
                "incremental rehash finished at {} buckets",
                self.tables[0].capacity()
            );
            return false;
        }
        true
    }

    /// Run rehash batches of 100 buckets until `budget` elapses or no work
    /// remains, returning the number of steps issued. Refuses (returns 0)
    /// while any iterator or scan is active.
    pub fn rehash_for(&mut self, budget: Duration) -> usize {
        if self.iterators > 0 {
            return 0;
        }
        let start = Instant::now();
        let mut steps = 0;
        while self.rehash(100) {
            steps += 100;
            if start.elapsed() > budget {
                break;
            }
        }
        steps
    }

    /// Single migration step charged to an ordinary operation, suppressed
    /// while iterators are live.
    pub(crate) fn rehash_step(&mut self) {
        if self.iterators == 0 {
            self.rehash(1);
        }
    }

    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        if self.tables[0].capacity() == 0 {
            let _ = self.expand(INITIAL_CAPACITY);
            return;
        }
        let used = self.tables[0].used;
        let capacity = self.tables[0].capacity();
        if used >= capacity && (resize_enabled() || used / capacity > FORCE_RESIZE_RATIO) {
            // Doubling from a power of two is never refused: the target is
            // strictly larger than the current capacity.
            let _ = self.expand(used * 2);
        }
    }

    // ---- mutation -------------------------------------------------------

    /// Insert a new key with its value. Fails without touching the
    /// dictionary when the key is already present; the rejected key and
    /// value are dropped.
    pub fn add(&mut self, key: P::Key, value: P::Value) -> Result<(), InsertError> {
        match self.add_raw(key, move || value) {
            RawEntry::Added(_) => Ok(()),
            RawEntry::Existing(_, _rejected) => Err(InsertError::DuplicateKey),
        }
    }

    /// Low-level insert. Links a fresh entry whose value comes from
    /// `init`, or reports the entry already holding the key; `init` runs
    /// only on insertion. New entries are prepended to their chain.
    pub fn add_raw(
        &mut self,
        key: P::Key,
        init: impl FnOnce() -> P::Value,
    ) -> RawEntry<'_, P::Key, P::Value> {
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.policy.hash(&key);
        match self.find_slot(&key, hash) {
            Slot::Occupied(p) => RawEntry::Existing(unsafe { &mut *p.as_ptr() }, key),
            Slot::Vacant { table, bucket } => {
                RawEntry::Added(self.tables[table].prepend(bucket, key, init()))
            }
        }
    }

    /// Insert-or-lookup: always returns the entry for `key`, creating it
    /// with `init` when absent.
    pub fn add_or_find(
        &mut self,
        key: P::Key,
        init: impl FnOnce() -> P::Value,
    ) -> &mut Entry<P::Key, P::Value> {
        match self.add_raw(key, init) {
            RawEntry::Added(entry) => entry,
            RawEntry::Existing(entry, _rejected) => entry,
        }
    }

    /// Insert the key or overwrite its value.
    ///
    /// On overwrite, the new value is stored in the entry **before** the
    /// old value is handed to the policy destructor. This order is part of
    /// the contract: when the new and old value alias a reference-counted
    /// resource, the count is raised by the store before the destructor
    /// lowers it, so it never touches zero in between.
    pub fn replace(&mut self, key: P::Key, value: P::Value) -> Replace {
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.policy.hash(&key);
        match self.find_slot(&key, hash) {
            Slot::Occupied(p) => {
                let entry = unsafe { &mut *p.as_ptr() };
                let old = core::mem::replace(&mut entry.value, value);
                self.policy.destroy_value(old);
                drop(key);
                Replace::Overwritten
            }
            Slot::Vacant { table, bucket } => {
                self.tables[table].prepend(bucket, key, value);
                Replace::Inserted
            }
        }
    }

    /// Remove a key, running the policy destructors on its entry. Returns
    /// false when the key is absent.
    pub fn delete(&mut self, key: &P::Key) -> bool {
        match self.remove_entry(key) {
            Some(entry) => {
                self.dispose(entry);
                true
            }
            None => false,
        }
    }

    /// Remove a key but keep its entry alive so the caller can inspect or
    /// transfer the key and value first.
    pub fn unlink(&mut self, key: &P::Key) -> Option<UnlinkedEntry<P::Key, P::Value>> {
        self.remove_entry(key).map(|entry| UnlinkedEntry { entry })
    }

    /// Tear down an entry previously returned by [`Dict::unlink`] or
    /// [`Dict::unlink_by_identity`] through the policy destructors.
    pub fn free_unlinked(&self, unlinked: UnlinkedEntry<P::Key, P::Value>) {
        self.dispose(unlinked.entry);
    }

    /// Remove every entry from both tables and return to the unallocated
    /// state. `progress` is invoked once per 65,536 buckets visited, for
    /// callers that interleave housekeeping with large teardowns.
    pub fn clear(&mut self, progress: Option<&mut dyn FnMut(&P)>) {
        let Dict {
            policy,
            tables,
            rehash_index,
            iterators,
        } = self;
        match progress {
            Some(cb) => {
                for table in tables.iter_mut() {
                    table.clear(policy, cb);
                }
            }
            None => {
                let mut noop = |_: &P| {};
                for table in tables.iter_mut() {
                    table.clear(policy, &mut noop);
                }
            }
        }
        *rehash_index = -1;
        *iterators = 0;
    }

    // ---- lookup ---------------------------------------------------------

    /// Look up a key, searching the secondary table too while a rehash is
    /// in progress.
    pub fn find(&mut self, key: &P::Key) -> Option<&mut Entry<P::Key, P::Value>> {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.policy.hash(key);
        for t in 0..=1 {
            let index = (hash & self.tables[t].mask()) as usize;
            let mut cur = self.tables[t].bucket(index);
            while let Some(p) = cur {
                let entry = unsafe { &*p.as_ptr() };
                if self.policy.key_equal(key, &entry.key) {
                    return Some(unsafe { &mut *p.as_ptr() });
                }
                cur = entry.next;
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    /// Convenience lookup returning just the value.
    pub fn fetch_value(&mut self, key: &P::Key) -> Option<&P::Value> {
        match self.find(key) {
            Some(entry) => Some(&entry.value),
            None => None,
        }
    }

    /// Locate an entry by key address and precomputed hash. No key
    /// comparison is performed and `key_ptr` is never dereferenced, so a
    /// dangling pointer to a formerly-live key is acceptable.
    pub fn find_by_identity(
        &self,
        key_ptr: *const P::Key,
        hash: u64,
    ) -> Option<&Entry<P::Key, P::Value>> {
        if self.len() == 0 {
            return None;
        }
        for t in 0..=1 {
            let index = (hash & self.tables[t].mask()) as usize;
            let mut cur = self.tables[t].bucket(index);
            while let Some(p) = cur {
                let entry = unsafe { &*p.as_ptr() };
                if core::ptr::eq(&entry.key, key_ptr) {
                    return Some(entry);
                }
                cur = entry.next;
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    /// Splice out an entry located by key address and precomputed hash,
    /// without re-hashing or comparing keys. Like [`Dict::find_by_identity`],
    /// `key_ptr` may dangle.
    pub fn unlink_by_identity(
        &mut self,
        key_ptr: *const P::Key,
        hash: u64,
    ) -> Option<UnlinkedEntry<P::Key, P::Value>> {
        if self.len() == 0 {
            return None;
        }
        self.unchain(hash, Matcher::Identity(key_ptr))
            .map(|entry| UnlinkedEntry { entry })
    }

    // ---- internals ------------------------------------------------------

    /// Find either the entry holding `key` or the bucket (in the active
    /// insertion table) where a new entry should be prepended. Triggers
    /// growth first, so the returned slot reflects any table just
    /// installed.
    fn find_slot(&mut self, key: &P::Key, hash: u64) -> Slot<P::Key, P::Value> {
        self.expand_if_needed();
        for t in 0..=1 {
            let index = (hash & self.tables[t].mask()) as usize;
            let mut cur = self.tables[t].bucket(index);
            while let Some(p) = cur {
                let entry = unsafe { &*p.as_ptr() };
                if self.policy.key_equal(key, &entry.key) {
                    return Slot::Occupied(p);
                }
                cur = entry.next;
            }
            if !self.is_rehashing() {
                break;
            }
        }
        let table = if self.is_rehashing() { 1 } else { 0 };
        Slot::Vacant {
            table,
            bucket: (hash & self.tables[table].mask()) as usize,
        }
    }

    fn remove_entry(&mut self, key: &P::Key) -> Option<Box<Entry<P::Key, P::Value>>> {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.policy.hash(key);
        self.unchain(hash, Matcher::Key(key))
    }

    /// Walk the chain at `hash` in each searchable table and splice out
    /// the first entry the matcher accepts.
    fn unchain(
        &mut self,
        hash: u64,
        matcher: Matcher<'_, P::Key>,
    ) -> Option<Box<Entry<P::Key, P::Value>>> {
        for t in 0..=1 {
            if self.tables[t].capacity() == 0 {
                break;
            }
            let index = (hash & self.tables[t].mask()) as usize;
            let mut link: *mut Link<P::Key, P::Value> = self.tables[t].bucket_mut(index);
            unsafe {
                while let Some(p) = *link {
                    let entry = &mut *p.as_ptr();
                    let matched = match matcher {
                        Matcher::Key(key) => self.policy.key_equal(key, &entry.key),
                        Matcher::Identity(ptr) => core::ptr::eq(&entry.key, ptr),
                    };
                    if matched {
                        *link = entry.next.take();
                        self.tables[t].used -= 1;
                        return Some(Box::from_raw(p.as_ptr()));
                    }
                    link = &mut entry.next;
                }
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    fn dispose(&self, entry: Box<Entry<P::Key, P::Value>>) {
        let Entry { key, value, .. } = *entry;
        self.policy.destroy_key(key);
        self.policy.destroy_value(value);
    }
}

impl<P: Policy> Drop for Dict<P> {
    fn drop(&mut self) {
        let Dict { policy, tables, .. } = self;
        let mut noop = |_: &P| {};
        tables[0].clear(policy, &mut noop);
        tables[1].clear(policy, &mut noop);
    }
}

/// Smallest power of two >= `size`, never below the initial capacity.
fn next_power(size: usize) -> usize {
    if size >= usize::MAX >> 1 {
        return 1 << (usize::BITS - 1);
    }
    let mut power = INITIAL_CAPACITY;
    while power < size {
        power <<= 1;
    }
    power
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Identity hashing so tests can steer keys into exact buckets.
    struct IdentityPolicy;

    impl Policy for IdentityPolicy {
        type Key = u64;
        type Value = u64;

        fn hash(&self, key: &u64) -> u64 {
            *key
        }

        fn key_equal(&self, a: &u64, b: &u64) -> bool {
            a == b
        }
    }

    /// Policy that counts destructor invocations.
    #[derive(Clone, Default)]
    struct CountingPolicy {
        keys_destroyed: Rc<Cell<usize>>,
        values_destroyed: Rc<Cell<usize>>,
    }

    impl Policy for CountingPolicy {
        type Key = String;
        type Value = u64;

        fn hash(&self, key: &String) -> u64 {
            crate::hash::bytes(key.as_bytes())
        }

        fn key_equal(&self, a: &String, b: &String) -> bool {
            a == b
        }

        fn destroy_key(&self, key: String) {
            self.keys_destroyed.set(self.keys_destroyed.get() + 1);
            drop(key);
        }

        fn destroy_value(&self, value: u64) {
            self.values_destroyed.set(self.values_destroyed.get() + 1);
            drop(value);
        }
    }

    impl<P: Policy> Dict<P> {
        /// Walk both tables and assert every structural invariant.
        fn check_invariants(&self) {
            for t in 0..=1 {
                let capacity = self.tables[t].capacity();
                assert!(capacity == 0 || capacity.is_power_of_two());
                let mut reachable = 0usize;
                for i in 0..capacity {
                    let mut cur = self.tables[t].bucket(i);
                    while let Some(p) = cur {
                        let entry = unsafe { &*p.as_ptr() };
                        assert_eq!(
                            (self.policy.hash(&entry.key) & self.tables[t].mask()) as usize,
                            i,
                            "entry chained in the wrong bucket"
                        );
                        reachable += 1;
                        cur = entry.next;
                    }
                }
                assert_eq!(reachable, self.tables[t].used);
            }
            assert_eq!(self.tables[1].capacity() > 0, self.rehash_index >= 0);
            for i in 0..self.rehash_index.max(0) as usize {
                assert!(self.tables[0].bucket(i).is_none());
            }
        }
    }

    /// Invariant: the first insertion allocates exactly the initial
    /// capacity of 4.
    #[test]
    fn first_insert_allocates_initial_capacity() {
        let mut d = Dict::new(IdentityPolicy);
        assert_eq!(d.capacity(), 0);
        d.add(1, 10).unwrap();
        assert_eq!(d.capacity(), INITIAL_CAPACITY);
        assert!(!d.is_rehashing());
        d.check_invariants();
    }

    /// Invariant: growth triggers at used == capacity and targets the
    /// next power of two of used * 2.
    #[test]
    fn growth_doubles_into_secondary() {
        let mut d = Dict::new(IdentityPolicy);
        for k in 0..4 {
            d.add(k, k).unwrap();
        }
        assert_eq!(d.capacity(), 4);
        assert!(!d.is_rehashing());
        // Fifth insert finds used == capacity and installs an 8-bucket
        // secondary before inserting.
        d.add(4, 4).unwrap();
        assert!(d.is_rehashing());
        assert_eq!(d.capacity(), 4 + 8);
        d.check_invariants();
        while d.rehash(8) {}
        assert!(!d.is_rehashing());
        assert_eq!(d.capacity(), 8);
        assert_eq!(d.len(), 5);
        d.check_invariants();
    }

    /// Invariant: the empty-bucket skip budget is 10 per requested step;
    /// an exhausted budget pauses migration without moving an entry.
    #[test]
    fn rehash_empty_visit_budget() {
        let mut d = Dict::new(IdentityPolicy);
        d.expand(64).unwrap();
        d.add(0, 0).unwrap();
        d.add(63, 63).unwrap();
        d.expand(128).unwrap();
        assert!(d.is_rehashing());

        // First step migrates bucket 0.
        assert!(d.rehash(1));
        assert_eq!(d.rehash_index, 1);
        // Next step runs out of its 10-empty-bucket budget before reaching
        // bucket 63.
        assert!(d.rehash(1));
        assert_eq!(d.rehash_index, 11);
        assert_eq!(d.tables[0].used, 1);
        d.check_invariants();
        // A larger batch clears the rest and promotes the secondary.
        assert!(!d.rehash(6));
        assert!(!d.is_rehashing());
        assert_eq!(d.capacity(), 128);
        assert_eq!(d.len(), 2);
        d.check_invariants();
    }

    /// Invariant: entries keep their addresses across migration; only the
    /// links are rewritten.
    #[test]
    fn rehash_preserves_entry_addresses() {
        let mut d = Dict::new(IdentityPolicy);
        for k in 0..4 {
            d.add(k, k * 7).unwrap();
        }
        let before: *const Entry<u64, u64> = d.find(&3).unwrap();
        d.add(4, 28).unwrap();
        assert!(d.is_rehashing());
        while d.rehash(4) {}
        let after: *const Entry<u64, u64> = d.find(&3).unwrap();
        assert_eq!(before, after);
    }

    /// Invariant: expand refuses same-size and too-small targets, and any
    /// expand while a rehash is running.
    #[test]
    fn expand_refusals() {
        let mut d = Dict::new(IdentityPolicy);
        for k in 0..8 {
            d.add(k, k).unwrap();
        }
        while d.rehash(16) {}
        assert_eq!(d.capacity(), 8);
        assert_eq!(d.expand(8), Err(ResizeError::SameSize));
        assert_eq!(d.expand(4), Err(ResizeError::TooSmall));
        d.expand(64).unwrap();
        assert!(d.is_rehashing());
        assert_eq!(d.expand(128), Err(ResizeError::Rehashing));
        assert_eq!(d.resize_to_fit(), Err(ResizeError::Rehashing));
        while d.rehash(64) {}
        d.resize_to_fit().unwrap();
        while d.rehash(64) {}
        assert_eq!(d.capacity(), 8);
        d.check_invariants();
    }

    /// Invariant: duplicate adds fail without changing state; add_or_find
    /// returns the existing entry without running init.
    #[test]
    fn duplicate_adds_and_add_or_find() {
        let mut d = Dict::new(IdentityPolicy);
        d.add(7, 70).unwrap();
        assert_eq!(d.add(7, 71), Err(InsertError::DuplicateKey));
        assert_eq!(d.len(), 1);
        assert_eq!(d.fetch_value(&7), Some(&70));

        let ran = Cell::new(false);
        let entry = d.add_or_find(7, || {
            ran.set(true);
            0
        });
        assert_eq!(*entry.value(), 70);
        assert!(!ran.get(), "init must not run for an existing key");

        match d.add_raw(9, || 90) {
            RawEntry::Added(entry) => assert_eq!(*entry.key(), 9),
            RawEntry::Existing(..) => panic!("key 9 was absent"),
        }
        match d.add_raw(9, || 91) {
            RawEntry::Existing(entry, rejected) => {
                assert_eq!(*entry.value(), 90);
                assert_eq!(rejected, 9);
            }
            RawEntry::Added(_) => panic!("key 9 was present"),
        }
        d.check_invariants();
    }

    /// Invariant: replace destroys exactly the overwritten value, and the
    /// destructor runs after the new value is already stored.
    #[test]
    fn replace_destroys_old_value_once() {
        let policy = CountingPolicy::default();
        let values = policy.values_destroyed.clone();
        let mut d = Dict::new(policy);

        assert_eq!(d.replace("a".into(), 1), Replace::Inserted);
        assert_eq!(values.get(), 0);
        assert_eq!(d.replace("a".into(), 99), Replace::Overwritten);
        assert_eq!(values.get(), 1);
        assert_eq!(d.fetch_value(&"a".into()), Some(&99));
        assert_eq!(d.len(), 1);
    }

    /// Invariant: delete runs both destructors; unlink defers them until
    /// free_unlinked, and into_pair skips them entirely.
    #[test]
    fn delete_unlink_destructor_discipline() {
        let policy = CountingPolicy::default();
        let keys = policy.keys_destroyed.clone();
        let values = policy.values_destroyed.clone();
        let mut d = Dict::new(policy);

        d.add("gone".into(), 1).unwrap();
        d.add("kept".into(), 2).unwrap();
        d.add("moved".into(), 3).unwrap();

        assert!(d.delete(&"gone".into()));
        assert_eq!((keys.get(), values.get()), (1, 1));
        assert!(!d.delete(&"gone".into()));

        let unlinked = d.unlink(&"kept".into()).unwrap();
        assert_eq!((keys.get(), values.get()), (1, 1));
        assert_eq!(unlinked.key(), "kept");
        assert_eq!(*unlinked.value(), 2);
        d.free_unlinked(unlinked);
        assert_eq!((keys.get(), values.get()), (2, 2));

        let (k, v) = d.unlink(&"moved".into()).unwrap().into_pair();
        assert_eq!((k.as_str(), v), ("moved", 3));
        assert_eq!((keys.get(), values.get()), (2, 2));
        assert!(d.is_empty());
    }

    /// Invariant: identity lookup matches only the stored key's address,
    /// never a different allocation holding an equal key.
    #[test]
    fn identity_lookup_is_by_address() {
        let mut d = Dict::new(IdentityPolicy);
        d.add(5, 50).unwrap();
        let hash = d.get_hash(&5);
        let stored: *const u64 = d.find(&5).unwrap().key();

        let elsewhere = 5u64;
        assert!(d.find_by_identity(&elsewhere, hash).is_none());
        assert_eq!(*d.find_by_identity(stored, hash).unwrap().value(), 50);

        let unlinked = d.unlink_by_identity(stored, hash).unwrap();
        assert_eq!(unlinked.into_pair(), (5, 50));
        assert!(d.is_empty());
        d.check_invariants();
    }

    /// Invariant: clear tears every entry down through the policy, resets
    /// both tables, and reports progress per 65,536 buckets.
    #[test]
    fn clear_resets_and_reports_progress() {
        let policy = CountingPolicy::default();
        let keys = policy.keys_destroyed.clone();
        let mut d = Dict::new(policy);
        for i in 0..100u64 {
            d.add(format!("k{i}"), i).unwrap();
        }
        let mut progress_calls = 0usize;
        let mut cb = |_: &CountingPolicy| progress_calls += 1;
        d.clear(Some(&mut cb));
        assert_eq!(keys.get(), 100);
        assert!(d.is_empty());
        assert_eq!(d.capacity(), 0);
        assert!(!d.is_rehashing());
        assert!(progress_calls >= 1);
        // The dictionary is reusable after clear.
        d.add("again".into(), 1).unwrap();
        assert_eq!(d.len(), 1);
        d.check_invariants();
    }

    /// Invariant: the fingerprint changes when any of the six shape fields
    /// changes, and is stable across pure lookups.
    #[test]
    fn fingerprint_tracks_shape() {
        let mut d = Dict::new(IdentityPolicy);
        let empty = d.fingerprint();
        d.add(1, 1).unwrap();
        let one = d.fingerprint();
        assert_ne!(empty, one);
        assert_eq!(one, d.fingerprint());

        d.add(2, 2).unwrap();
        let two = d.fingerprint();
        assert_ne!(one, two);

        d.delete(&2);
        // Same used count as before, same backing array: back to the
        // earlier shape.
        assert_eq!(d.fingerprint(), one);

        for k in 2..6 {
            d.add(k, k).unwrap();
        }
        assert!(d.is_rehashing());
        let mid = d.fingerprint();
        while d.rehash(8) {}
        assert_ne!(mid, d.fingerprint());
    }

    /// Invariant: every entry stays reachable through a mixed workload
    /// with growth, deletion, and explicit rehash batches interleaved.
    #[test]
    fn mixed_workload_preserves_invariants() {
        let mut d = Dict::new(IdentityPolicy);
        for k in 0..300u64 {
            d.add(k, k * 2).unwrap();
            if k % 7 == 0 {
                d.rehash(1);
            }
            if k % 3 == 0 {
                assert!(d.delete(&k));
            }
            d.check_invariants();
        }
        for k in 0..300u64 {
            let expect = if k % 3 == 0 { None } else { Some(k * 2) };
            assert_eq!(d.fetch_value(&k).copied(), expect);
        }
        d.check_invariants();
    }

    /// Invariant: rehash_for makes progress in batches and reports the
    /// steps it issued; rehash(0) performs no migration.
    #[test]
    fn timed_rehash_runs_batches() {
        let mut d = Dict::new(IdentityPolicy);
        for k in 0..5000u64 {
            d.add(k, k).unwrap();
        }
        while d.rehash(1 << 20) {}
        d.expand(d.capacity() * 2).unwrap();
        assert!(d.rehash(0));
        let steps = d.rehash_for(Duration::from_millis(100));
        assert!(steps >= 100);
        d.check_invariants();
    }
}
