//! Open-addressed `spc -> tpc` table (§3, §4.3). Exclusively owned by its
//! thread; the "atomic install" language in the design doc describes write
//! ordering within that single writer, not cross-thread synchronization —
//! no other thread ever touches this table.

use crate::flags;

/// `#[repr(C)]` and field order are load-bearing: the inline hash lookup
/// (C6) walks this table from emitted guest code via raw address
/// arithmetic, expecting `spc` at offset 0 and `tpc` at offset 8 of a
/// 16-byte entry.
#[derive(Copy, Clone)]
#[repr(C)]
struct Entry {
    spc: u64,
    tpc: u64,
}

const EMPTY: Entry = Entry { spc: 0, tpc: 0 };

pub struct HashTable {
    entries: Vec<Entry>,
    mask: usize,
}

impl HashTable {
    pub fn new() -> HashTable {
        Self::with_capacity(flags::HASH_TABLE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> HashTable {
        assert!(capacity.is_power_of_two(), "hash table capacity must be a power of two");
        HashTable {
            entries: vec![EMPTY; capacity],
            mask: capacity - 1,
        }
    }

    fn start_index(&self, spc: u64) -> usize {
        (spc as usize) & self.mask
    }

    /// Returns the stored `tpc` for `spc`, or `None` on a miss. Probing is
    /// linear; an empty slot terminates the search (I1).
    pub fn lookup(&self, spc: u64) -> Option<u64> {
        let mut i = self.start_index(spc);
        loop {
            let e = self.entries[i];
            if e.spc == 0 {
                return None;
            }
            if e.spc == spc {
                return Some(e.tpc);
            }
            i = (i + 1) & self.mask;
        }
    }

    /// Inserts `(spc, tpc)`. Per I1 no entry is ever mutated after
    /// insertion, so a caller must never call this twice for the same
    /// `spc`. Writes the payload (`tpc`) before the key (`spc`) so a
    /// concurrent reader — if this table were ever shared, which it is
    /// not — would observe either "empty" or a fully valid entry.
    pub fn insert(&mut self, spc: u64, tpc: u64) {
        debug_assert_ne!(spc, 0, "spc=0 is the empty-slot sentinel");
        let mut i = self.start_index(spc);
        loop {
            if self.entries[i].spc == 0 {
                self.entries[i].tpc = tpc;
                self.entries[i].spc = spc;
                return;
            }
            debug_assert_ne!(self.entries[i].spc, spc, "duplicate insert for the same spc");
            i = (i + 1) & self.mask;
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Absolute address of the first entry, for the inline hash lookup
    /// sequence (C6) to materialize as an immediate.
    pub fn base_addr(&self) -> u64 {
        self.entries.as_ptr() as u64
    }

    pub fn mask(&self) -> usize {
        self.mask
    }
}

impl Default for HashTable {
    fn default() -> Self {
        HashTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_on_empty_table() {
        let t = HashTable::with_capacity(16);
        assert_eq!(t.lookup(42), None);
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let mut t = HashTable::with_capacity(16);
        t.insert(0x1000, 0x8000);
        assert_eq!(t.lookup(0x1000), Some(0x8000));
    }

    #[test]
    fn collision_chains_to_next_slot() {
        let mut t = HashTable::with_capacity(4);
        // Both spcs map to the same start index modulo 4.
        t.insert(4, 100);
        t.insert(8, 200);
        assert_eq!(t.lookup(4), Some(100));
        assert_eq!(t.lookup(8), Some(200));
    }
}
