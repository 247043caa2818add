//! Fixed-capacity open-addressing table mapping a sparse 64-bit id to a dense
//! slot index.
//!
//! Capacity is fixed at construction. A full table refuses new keys instead of
//! growing, and deleted buckets become tombstones that later inserts reuse.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Never-used bucket. Probing stops here.
const EMPTY: u64 = u64::MAX;
/// Deleted bucket. Probing continues past it.
const TOMBSTONE: u64 = u64::MAX - 1;

/// Linear-probing table with tombstones.
///
/// Keys are stored in atomics so the scheduler thread can label slots with
/// [`key_of`](Self::key_of) while the owning thread keeps inserting. Only one
/// thread may insert or delete.
pub struct IndexMap {
    keys: Box<[AtomicU64]>,
    size: AtomicUsize,
}

impl IndexMap {
    /// Creates a table with `capacity` buckets (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            keys: (0..capacity).map(|_| AtomicU64::new(EMPTY)).collect(),
            size: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.keys.len()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the index holding `key`, inserting it when absent.
    ///
    /// Returns `None` when the table is full or `key` collides with an
    /// internal marker value.
    #[inline]
    pub fn insert(&self, key: u64) -> Option<usize> {
        if is_marker(key) {
            return None;
        }
        if let Some(index) = self.lookup(key) {
            return Some(index);
        }

        let capacity = self.capacity();
        if self.len() >= capacity {
            return None;
        }

        let home = self.home(key);
        for step in 0..capacity {
            let index = (home + step) % capacity;
            let current = self.keys[index].load(Ordering::Relaxed);
            if current == EMPTY || current == TOMBSTONE {
                self.keys[index].store(key, Ordering::Release);
                self.size.fetch_add(1, Ordering::Relaxed);
                return Some(index);
            }
        }

        None
    }

    /// Returns the index holding `key`.
    #[inline]
    pub fn lookup(&self, key: u64) -> Option<usize> {
        if is_marker(key) {
            return None;
        }

        let capacity = self.capacity();
        let home = self.home(key);
        for step in 0..capacity {
            let index = (home + step) % capacity;
            match self.keys[index].load(Ordering::Acquire) {
                EMPTY => return None,
                stored if stored == key => return Some(index),
                _ => {}
            }
        }

        None
    }

    /// Removes `key`, leaving a tombstone. Returns whether it was present.
    pub fn delete(&self, key: u64) -> bool {
        match self.lookup(key) {
            Some(index) => {
                self.keys[index].store(TOMBSTONE, Ordering::Release);
                self.size.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Returns the key stored at `index`, if the bucket is live.
    pub fn key_of(&self, index: usize) -> Option<u64> {
        let key = self.keys.get(index)?.load(Ordering::Acquire);
        (!is_marker(key)).then_some(key)
    }

    /// Iterates live `(index, key)` pairs in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.keys.iter().enumerate().filter_map(|(index, key)| {
            let key = key.load(Ordering::Acquire);
            (!is_marker(key)).then_some((index, key))
        })
    }

    /// Home bucket: small keys map to themselves, larger ones are mixed.
    #[inline]
    fn home(&self, key: u64) -> usize {
        let capacity = self.capacity();
        if key < capacity as u64 {
            key as usize
        } else {
            mix32(key) as usize % capacity
        }
    }
}

impl std::fmt::Debug for IndexMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexMap")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[inline]
fn is_marker(key: u64) -> bool {
    key == EMPTY || key == TOMBSTONE
}

/// 32-bit avalanche finalizer over the folded key.
#[inline]
fn mix32(key: u64) -> u32 {
    let mut h = (key ^ (key >> 32)) as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
