//! Random-entry sampling over the chained tables.

use core::ptr::NonNull;

use rand::Rng;

use crate::dict::Dict;
use crate::policy::Policy;
use crate::table::Entry;

/// How many entries the fair pick draws its candidate set from.
const FAIR_SAMPLE: usize = 15;

impl<P: Policy> Dict<P> {
    /// One random entry: a uniformly random non-empty bucket in the
    /// populated range, then a uniformly random entry within its chain.
    /// Entries in long chains are therefore individually less likely than
    /// entries in short ones; see [`Dict::fair_random_entry`].
    pub fn random_entry(&mut self) -> Option<&Entry<P::Key, P::Value>> {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let mut rng = rand::thread_rng();

        let head = if self.is_rehashing() {
            // Primary buckets below the rehash index are empty, so sample
            // the piecewise range [rehash_index, slots) across both
            // tables.
            loop {
                let base = self.rehash_index as u64;
                let slots = self.capacity() as u64;
                let pick = base + rng.gen_range(0..slots - base);
                let primary = self.tables[0].capacity() as u64;
                let link = if pick >= primary {
                    self.tables[1].bucket((pick - primary) as usize)
                } else {
                    self.tables[0].bucket(pick as usize)
                };
                if let Some(p) = link {
                    break p;
                }
            }
        } else {
            loop {
                let pick = rng.gen::<u64>() & self.tables[0].mask();
                if let Some(p) = self.tables[0].bucket(pick as usize) {
                    break p;
                }
            }
        };

        // A chain gives no random access; count it, then index it.
        let mut chain_len = 0usize;
        let mut cur = Some(head);
        while let Some(p) = cur {
            chain_len += 1;
            cur = unsafe { (*p.as_ptr()).next };
        }
        let mut chosen = head;
        for _ in 0..rng.gen_range(0..chain_len) {
            chosen = unsafe { (*chosen.as_ptr()).next }.expect("chain shorter than counted");
        }
        Some(unsafe { &*chosen.as_ptr() })
    }

    /// Collect up to `count` entries from random locations, scanning
    /// forward from a random bucket and re-seeding after long empty runs.
    /// Best effort: fewer entries may come back, duplicates are possible,
    /// and the distribution is not uniform. Up to `count` passive rehash
    /// steps are spent first.
    pub fn sample(&mut self, count: usize) -> Vec<&Entry<P::Key, P::Value>> {
        let count = count.min(self.len());
        if count == 0 {
            return Vec::new();
        }
        for _ in 0..count {
            if !self.is_rehashing() {
                break;
            }
            self.rehash_step();
        }

        let tables = if self.is_rehashing() { 2 } else { 1 };
        let mut max_mask = self.tables[0].mask();
        if tables == 2 && self.tables[1].mask() > max_mask {
            max_mask = self.tables[1].mask();
        }

        let mut rng = rand::thread_rng();
        let mut index = rng.gen::<u64>() & max_mask;
        let mut empty_run = 0usize;
        let mut out = Vec::with_capacity(count);
        let mut steps = count * 10;

        while out.len() < count && steps > 0 {
            steps -= 1;
            for t in 0..tables {
                // Primary indices below the rehash index hold nothing; jump
                // to the rehash index when the secondary cannot cover this
                // cursor either (shrink in progress), otherwise just skip
                // the primary here.
                if tables == 2 && t == 0 && index < self.rehash_index as u64 {
                    if index >= self.tables[1].capacity() as u64 {
                        index = self.rehash_index as u64;
                    } else {
                        continue;
                    }
                }
                if index >= self.tables[t].capacity() as u64 {
                    continue;
                }
                match self.tables[t].bucket(index as usize) {
                    None => {
                        empty_run += 1;
                        if empty_run >= 5 && empty_run > count {
                            index = rng.gen::<u64>() & max_mask;
                            empty_run = 0;
                        }
                    }
                    Some(head) => {
                        empty_run = 0;
                        let mut cur = Some(head);
                        while let Some(p) = cur {
                            let entry = unsafe { &*p.as_ptr() };
                            out.push(entry);
                            if out.len() == count {
                                return out;
                            }
                            cur = entry.next;
                        }
                    }
                }
            }
            index = (index + 1) & max_mask;
        }
        out
    }

    /// A random entry with a smoother distribution than
    /// [`Dict::random_entry`]: pick uniformly among a linear sample of up
    /// to 15 entries, falling back to the plain pick when the sample comes
    /// back empty.
    pub fn fair_random_entry(&mut self) -> Option<&Entry<P::Key, P::Value>> {
        let picked: Option<NonNull<Entry<P::Key, P::Value>>> = {
            let entries = self.sample(FAIR_SAMPLE);
            if entries.is_empty() {
                None
            } else {
                let index = rand::thread_rng().gen_range(0..entries.len());
                Some(NonNull::from(entries[index]))
            }
        };
        match picked {
            // The sampled entry belongs to this dictionary and nothing has
            // mutated it since the sample was taken.
            Some(p) => Some(unsafe { &*p.as_ptr() }),
            None => self.random_entry(),
        }
    }
}
