//! Entry iterators: a plain flavor that forbids mutation and checks a
//! fingerprint on release, and a safe flavor that tolerates mutation by
//! pausing incremental rehash for its lifetime.

use crate::dict::Dict;
use crate::policy::Policy;
use crate::table::{Entry, Link};

/// Iterator over a dictionary's entries.
///
/// The iterator holds no borrow of the dictionary; the dictionary is
/// passed to every [`DictIter::next`] call instead, so a safe iterator's
/// caller can mutate between advances. Iteration order is bucket order,
/// chains head-first, continuing into the secondary table while a rehash
/// is in progress.
///
/// A plain iterator (from [`Dict::iterator`]) permits no mutation at all:
/// it snapshots the dictionary fingerprint on first advance and
/// [`DictIter::release`] asserts it unchanged. A safe iterator (from
/// [`Dict::safe_iterator`]) registers itself so no rehash step runs while
/// it is live; the caller may add, look up, and delete freely, with one
/// restriction: of the entries not yet visited, only the entry most
/// recently returned by `next` may be removed.
///
/// Every started iterator must be released; dropping one instead panics.
pub struct DictIter<P: Policy> {
    table: usize,
    index: isize,
    safe: bool,
    entry: Link<P::Key, P::Value>,
    next_entry: Link<P::Key, P::Value>,
    fingerprint: u64,
}

impl<P: Policy> Dict<P> {
    /// A plain iterator. The dictionary must not be mutated until it is
    /// released.
    pub fn iterator(&self) -> DictIter<P> {
        DictIter::new(false)
    }

    /// A safe iterator: mutation is allowed during traversal, and
    /// incremental rehashing is paused until release.
    pub fn safe_iterator(&self) -> DictIter<P> {
        DictIter::new(true)
    }
}

impl<P: Policy> DictIter<P> {
    fn new(safe: bool) -> Self {
        Self {
            table: 0,
            index: -1,
            safe,
            entry: None,
            next_entry: None,
            fingerprint: 0,
        }
    }

    fn started(&self) -> bool {
        !(self.index == -1 && self.table == 0)
    }

    /// Advance to the next entry. The successor is saved before the entry
    /// is handed out, so the caller may delete the returned entry before
    /// the next call.
    pub fn next<'d>(&mut self, dict: &'d mut Dict<P>) -> Option<&'d Entry<P::Key, P::Value>> {
        loop {
            if self.entry.is_none() {
                if !self.started() {
                    if self.safe {
                        dict.iterators += 1;
                    } else {
                        self.fingerprint = dict.fingerprint();
                    }
                }
                self.index += 1;
                if self.index >= dict.tables[self.table].capacity() as isize {
                    if dict.is_rehashing() && self.table == 0 {
                        self.table = 1;
                        self.index = 0;
                    } else {
                        return None;
                    }
                }
                self.entry = dict.tables[self.table].bucket(self.index as usize);
            } else {
                #[cfg(debug_assertions)]
                if self.safe {
                    self.assert_successor_chained(dict);
                }
                self.entry = self.next_entry;
            }
            if let Some(p) = self.entry {
                let entry = unsafe { &*p.as_ptr() };
                self.next_entry = entry.next;
                return Some(entry);
            }
        }
    }

    /// Finish iterating. For a safe iterator this re-enables incremental
    /// rehashing; for a plain iterator it asserts that the dictionary was
    /// not mutated since the first advance, aborting iteration misuse
    /// loudly rather than continuing on a corrupt traversal.
    pub fn release(self, dict: &mut Dict<P>) {
        let started = self.started();
        let safe = self.safe;
        let fingerprint = self.fingerprint;
        core::mem::forget(self);
        if started {
            if safe {
                dict.iterators -= 1;
            } else {
                assert_eq!(
                    fingerprint,
                    dict.fingerprint(),
                    "dictionary was mutated during plain iteration"
                );
            }
        }
    }

    /// The saved successor must still be linked in its bucket: deleting a
    /// pending entry out from under a safe iterator is the one mutation
    /// the safe contract does not cover.
    #[cfg(debug_assertions)]
    fn assert_successor_chained(&self, dict: &Dict<P>) {
        let Some(target) = self.next_entry else {
            return;
        };
        let mut cur = dict.tables[self.table].bucket(self.index as usize);
        while let Some(p) = cur {
            if p == target {
                return;
            }
            cur = unsafe { (*p.as_ptr()).next };
        }
        panic!("entry pending iteration was deleted while a safe iterator was live");
    }
}

impl<P: Policy> Drop for DictIter<P> {
    fn drop(&mut self) {
        // A started iterator holds dictionary bookkeeping (safe flavor) or
        // an unverified fingerprint (plain flavor); only release() can
        // settle either.
        if self.started() {
            panic!("DictIter dropped without release()");
        }
    }
}
