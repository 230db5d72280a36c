//! Entries and the fixed-capacity bucket array backing one side of a
//! dictionary.

use core::ptr::NonNull;

use crate::policy::Policy;

/// Head-of-chain / next-in-chain link.
pub(crate) type Link<K, V> = Option<NonNull<Entry<K, V>>>;

/// One key/value pair, individually heap-allocated and chained within its
/// bucket. The entry's address is stable from insertion until removal,
/// even across incremental rehashing, which moves entries by pointer.
pub struct Entry<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
    pub(crate) next: Link<K, V>,
}

impl<K, V> Entry<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut V {
        &mut self.value
    }
}

/// One hash table of the dual-table pair: a power-of-two array of chain
/// heads plus the live-entry count.
///
/// The table owns every entry reachable from its buckets. It does not know
/// the policy, so teardown goes through [`Table::clear`], which the owning
/// dictionary calls with its policy; a table must be empty by the time it
/// is dropped.
pub(crate) struct Table<K, V> {
    buckets: Box<[Link<K, V>]>,
    pub(crate) used: usize,
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            buckets: Box::default(),
            used: 0,
        }
    }
}

impl<K, V> Table<K, V> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            buckets: vec![None; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Bitmask turning a hash into a bucket index. Only meaningful for an
    /// allocated table.
    pub(crate) fn mask(&self) -> u64 {
        debug_assert!(!self.buckets.is_empty());
        self.buckets.len() as u64 - 1
    }

    /// Backing-array address, folded into the dictionary fingerprint.
    pub(crate) fn backing_addr(&self) -> u64 {
        self.buckets.as_ptr() as u64
    }

    pub(crate) fn bucket(&self, index: usize) -> Link<K, V> {
        self.buckets[index]
    }

    pub(crate) fn bucket_mut(&mut self, index: usize) -> &mut Link<K, V> {
        &mut self.buckets[index]
    }

    pub(crate) fn take_bucket(&mut self, index: usize) -> Link<K, V> {
        self.buckets[index].take()
    }

    pub(crate) fn set_bucket(&mut self, index: usize, link: Link<K, V>) {
        self.buckets[index] = link;
    }

    /// Allocate a fresh entry and prepend it to the chain at `index`. The
    /// newest entry sits at the head, on the bet that recently added keys
    /// are the ones accessed next.
    pub(crate) fn prepend(&mut self, index: usize, key: K, value: V) -> &mut Entry<K, V> {
        let entry = NonNull::from(Box::leak(Box::new(Entry {
            key,
            value,
            next: self.buckets[index],
        })));
        self.buckets[index] = Some(entry);
        self.used += 1;
        unsafe { &mut *entry.as_ptr() }
    }

    /// Destroy every entry through the policy hooks, free the backing
    /// array, and reset to the unallocated state. `progress` is invoked
    /// once per 65,536 buckets visited.
    pub(crate) fn clear<P>(&mut self, policy: &P, progress: &mut dyn FnMut(&P))
    where
        P: Policy<Key = K, Value = V>,
    {
        for i in 0..self.buckets.len() {
            if self.used == 0 {
                break;
            }
            if (i & 0xFFFF) == 0 {
                progress(policy);
            }
            let mut link = self.buckets[i].take();
            while let Some(p) = link {
                let entry = unsafe { Box::from_raw(p.as_ptr()) };
                link = entry.next;
                let Entry { key, value, .. } = *entry;
                policy.destroy_key(key);
                policy.destroy_value(value);
                self.used -= 1;
            }
        }
        self.buckets = Box::default();
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // Entries are torn down via clear() with the owning policy; a
        // table must never be dropped while it still owns entries.
        debug_assert_eq!(self.used, 0, "table dropped with live entries");
    }
}
