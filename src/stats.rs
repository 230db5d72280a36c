//! Human-readable table diagnostics.

use std::fmt::Write;

use crate::dict::Dict;
use crate::policy::Policy;
use crate::table::Table;

/// Chain lengths at or above this fold into the last histogram slot.
const HISTOGRAM_SLOTS: usize = 50;

impl<P: Policy> Dict<P> {
    /// Render a text summary of both tables: capacity, entries, occupied
    /// buckets, longest chain, mean chain lengths, and a chain-length
    /// histogram.
    pub fn stats(&self) -> String {
        let mut out = String::new();
        table_stats(&mut out, &self.tables[0], 0);
        if self.is_rehashing() {
            table_stats(&mut out, &self.tables[1], 1);
        }
        out
    }
}

fn table_stats<K, V>(out: &mut String, table: &Table<K, V>, id: usize) {
    let label = if id == 0 { "primary" } else { "rehash target" };
    if table.used == 0 {
        let _ = writeln!(out, "Hash table {id} ({label}): empty");
        return;
    }

    let mut histogram = [0usize; HISTOGRAM_SLOTS];
    let mut occupied = 0usize;
    let mut max_chain = 0usize;
    let mut walked = 0usize;
    for i in 0..table.capacity() {
        let mut chain = 0usize;
        let mut cur = table.bucket(i);
        while let Some(p) = cur {
            chain += 1;
            cur = unsafe { (*p.as_ptr()).next };
        }
        histogram[chain.min(HISTOGRAM_SLOTS - 1)] += 1;
        if chain > 0 {
            occupied += 1;
            max_chain = max_chain.max(chain);
            walked += chain;
        }
    }

    let _ = writeln!(out, "Hash table {id} ({label}):");
    let _ = writeln!(out, " buckets: {}", table.capacity());
    let _ = writeln!(out, " entries: {}", table.used);
    let _ = writeln!(out, " occupied buckets: {}", occupied);
    let _ = writeln!(out, " max chain length: {}", max_chain);
    let _ = writeln!(
        out,
        " avg chain length (walked): {:.2}",
        walked as f64 / occupied as f64
    );
    let _ = writeln!(
        out,
        " avg chain length (tracked): {:.2}",
        table.used as f64 / occupied as f64
    );
    let _ = writeln!(out, " chain length distribution:");
    for (length, &buckets) in histogram.iter().enumerate() {
        if buckets == 0 {
            continue;
        }
        let _ = writeln!(
            out,
            "   {}{}: {} ({:.2}%)",
            if length == HISTOGRAM_SLOTS - 1 { ">= " } else { "" },
            length,
            buckets,
            buckets as f64 / table.capacity() as f64 * 100.0
        );
    }
}
