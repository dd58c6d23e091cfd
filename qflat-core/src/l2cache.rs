// SPDX-License-Identifier: MIT

//! Hash-bucketed LRU cache of L2 tables, keyed by their host offset.
//!
//! Implemented as an arena of fixed-capacity slots addressed by index rather
//! than a generic `lru`-crate map, since each entry also owns a
//! `clusterSize`-byte table buffer that should be reused across evictions
//! instead of reallocated — the slot holding the LRU victim is recycled in
//! place on a full-cache miss.

use qflat_io::prelude::*;

use crate::error::{CoreError, CoreResult};

/// Maps `clusterBits` (9..=21) to the cache's fixed entry capacity, per
/// the small-prime table.
pub fn capacity_for_cluster_bits(cluster_bits: u32) -> usize {
    match cluster_bits {
        9 => 4099,
        10 => 2053,
        11 => 1031,
        12 => 521,
        13 => 257,
        14 => 131,
        15 => 67,
        16 => 37,
        17 => 17,
        18 => 11,
        19 => 5,
        20 => 3,
        21 => 1,
        _ => 1,
    }
}

const NONE: usize = usize::MAX;

struct Slot {
    offset: u64,
    table: Vec<u8>,
    occupied: bool,
    bucket_next: usize,
    lru_prev: usize,
    lru_next: usize,
}

/// Fixed-capacity, hash-bucketed LRU cache of L2 tables.
pub struct L2Cache {
    cluster_size: u64,
    capacity: usize,
    slots: Vec<Slot>,
    buckets: Vec<usize>,
    lru_head: usize,
    lru_tail: usize,
    len: usize,
}

impl L2Cache {
    pub fn new(cluster_bits: u32) -> Self {
        let capacity = capacity_for_cluster_bits(cluster_bits);
        let cluster_size = 1u64 << cluster_bits;
        let slots = (0..capacity)
            .map(|_| Slot {
                offset: 0,
                table: Vec::new(),
                occupied: false,
                bucket_next: NONE,
                lru_prev: NONE,
                lru_next: NONE,
            })
            .collect();
        L2Cache {
            cluster_size,
            capacity,
            slots,
            buckets: vec![NONE; capacity],
            lru_head: NONE,
            lru_tail: NONE,
            len: 0,
        }
    }

    fn hash(&self, offset: u64) -> usize {
        (((offset >> 32) ^ (offset & 0xFFFF_FFFF)) as usize) % self.capacity
    }

    fn bucket_find(&self, offset: u64) -> Option<usize> {
        let bucket = self.hash(offset);
        let mut idx = self.buckets[bucket];
        while idx != NONE {
            if self.slots[idx].occupied && self.slots[idx].offset == offset {
                return Some(idx);
            }
            idx = self.slots[idx].bucket_next;
        }
        None
    }

    fn bucket_insert(&mut self, idx: usize, offset: u64) {
        let bucket = self.hash(offset);
        self.slots[idx].bucket_next = self.buckets[bucket];
        self.buckets[bucket] = idx;
    }

    fn bucket_remove(&mut self, idx: usize) {
        let offset = self.slots[idx].offset;
        let bucket = self.hash(offset);
        let mut cur = self.buckets[bucket];
        if cur == idx {
            self.buckets[bucket] = self.slots[idx].bucket_next;
            self.slots[idx].bucket_next = NONE;
            return;
        }
        while cur != NONE {
            let next = self.slots[cur].bucket_next;
            if next == idx {
                self.slots[cur].bucket_next = self.slots[idx].bucket_next;
                self.slots[idx].bucket_next = NONE;
                return;
            }
            cur = next;
        }
    }

    fn lru_unlink(&mut self, idx: usize) {
        let prev = self.slots[idx].lru_prev;
        let next = self.slots[idx].lru_next;
        if prev != NONE {
            self.slots[prev].lru_next = next;
        } else {
            self.lru_head = next;
        }
        if next != NONE {
            self.slots[next].lru_prev = prev;
        } else {
            self.lru_tail = prev;
        }
        self.slots[idx].lru_prev = NONE;
        self.slots[idx].lru_next = NONE;
    }

    fn lru_push_front(&mut self, idx: usize) {
        self.slots[idx].lru_prev = NONE;
        self.slots[idx].lru_next = self.lru_head;
        if self.lru_head != NONE {
            self.slots[self.lru_head].lru_prev = idx;
        }
        self.lru_head = idx;
        if self.lru_tail == NONE {
            self.lru_tail = idx;
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.lru_head == idx {
            return;
        }
        self.lru_unlink(idx);
        self.lru_push_front(idx);
    }

    /// Returns the L2 table at `offset` (host, already cluster-aligned),
    /// loading it from `io` on a miss. The returned slice is host-order
    /// 64-bit entries in raw big-endian-on-disk bytes; callers decode each
    /// entry as needed.
    pub fn get<IO: BlockIO + ?Sized>(&mut self, io: &mut IO, offset: u64) -> CoreResult<&[u8]> {
        if let Some(idx) = self.bucket_find(offset) {
            self.touch(idx);
            return Ok(&self.slots[idx].table);
        }

        let idx = if self.len < self.capacity {
            let idx = self.len;
            self.len += 1;
            idx
        } else {
            let victim = self.lru_tail;
            if victim == NONE {
                return Err(CoreError::OutOfMemory);
            }
            self.bucket_remove(victim);
            self.lru_unlink(victim);
            victim
        };

        let mut table = core::mem::take(&mut self.slots[idx].table);
        table.resize(self.cluster_size as usize, 0);
        io.read_at(offset, &mut table)?;

        self.slots[idx].offset = offset;
        self.slots[idx].table = table;
        self.slots[idx].occupied = true;
        self.bucket_insert(idx, offset);
        self.lru_push_front(idx);

        Ok(&self.slots[idx].table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qflat_io::MemBlockIO;

    #[test]
    fn capacity_table_matches_spec() {
        assert_eq!(capacity_for_cluster_bits(9), 4099);
        assert_eq!(capacity_for_cluster_bits(16), 37);
        assert_eq!(capacity_for_cluster_bits(21), 1);
    }

    #[test]
    fn loads_and_hits_cache() {
        let mut io = MemBlockIO::new();
        let cluster_size = 1usize << 16;
        io.write_at(0, &vec![0xABu8; cluster_size]).unwrap();
        let mut cache = L2Cache::new(16);
        let table = cache.get(&mut io, 0).unwrap().to_vec();
        assert_eq!(table.len(), cluster_size);
        assert!(table.iter().all(|&b| b == 0xAB));
        let table2 = cache.get(&mut io, 0).unwrap();
        assert_eq!(table2.len(), cluster_size);
    }

    #[test]
    fn evicts_lru_when_full() {
        let mut io = MemBlockIO::new();
        let cluster_bits = 21; // capacity 1
        let cluster_size = 1usize << cluster_bits;
        io.write_at(0, &vec![1u8; cluster_size]).unwrap();
        io.write_at(cluster_size as u64, &vec![2u8; cluster_size])
            .unwrap();
        let mut cache = L2Cache::new(cluster_bits);
        cache.get(&mut io, 0).unwrap();
        let t = cache.get(&mut io, cluster_size as u64).unwrap();
        assert!(t.iter().all(|&b| b == 2));
        assert!(cache.bucket_find(0).is_none());
    }
}
