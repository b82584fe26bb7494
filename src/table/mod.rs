//! Fixed-capacity slot arena shared by every engine table.
//!
//! All slots are allocated up front. Keys are hashed into a power-of-two
//! arena and resolved by bounded linear probing, so every lookup and insert
//! finishes in at most [`MAX_PROBES`] steps and never takes a lock. Keys are
//! never removed; callers that need "delete" semantics clear the value in
//! place and keep the key.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;

/// Upper bound on probe steps for a single lookup or insert.
pub const MAX_PROBES: usize = 256;

/// Reserved key value marking an unused slot.
const EMPTY: u64 = 0;

/// Fibonacci hashing multiplier (2^64 / golden ratio).
const HASH_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    #[error("{table} table is full ({capacity} entries)")]
    Full {
        table: &'static str,
        capacity: usize,
    },
    #[error("key 0 is reserved in the {table} table")]
    ReservedKey { table: &'static str },
}

struct Slot<V> {
    key: AtomicU64,
    value: V,
}

/// A resolved slot: its arena index, the value, and whether this call
/// claimed the key.
pub struct Entry<'a, V> {
    pub index: usize,
    pub value: &'a V,
    pub inserted: bool,
}

pub struct SlotTable<V> {
    name: &'static str,
    slots: Box<[Slot<V>]>,
    mask: usize,
    capacity: usize,
    len: AtomicUsize,
}

impl<V: Default> SlotTable<V> {
    /// Pre-allocate a table able to hold `capacity` live keys.
    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        let arena = capacity.max(1).next_power_of_two();
        let slots = (0..arena)
            .map(|_| Slot {
                key: AtomicU64::new(EMPTY),
                value: V::default(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            name,
            slots,
            mask: arena - 1,
            capacity,
            len: AtomicUsize::new(0),
        }
    }
}

impl<V> SlotTable<V> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Maximum number of live keys.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots backing the table (capacity rounded to a power of two).
    pub fn arena_len(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn home(&self, key: u64) -> usize {
        (key.wrapping_mul(HASH_MULTIPLIER) >> 32) as usize & self.mask
    }

    fn probe_window(&self) -> usize {
        MAX_PROBES.min(self.slots.len())
    }

    /// Look up `key` without inserting.
    pub fn get(&self, key: u64) -> Option<Entry<'_, V>> {
        if key == EMPTY {
            return None;
        }
        let home = self.home(key);
        for step in 0..self.probe_window() {
            let index = (home + step) & self.mask;
            let slot = &self.slots[index];
            match slot.key.load(Ordering::Acquire) {
                k if k == key => {
                    return Some(Entry {
                        index,
                        value: &slot.value,
                        inserted: false,
                    })
                }
                EMPTY => return None,
                _ => {}
            }
        }
        None
    }

    /// Atomic insert-if-absent, else fetch.
    ///
    /// Exactly one concurrent caller observes `inserted == true` for a given
    /// key; that caller is responsible for initializing the value.
    pub fn get_or_insert(&self, key: u64) -> Result<Entry<'_, V>, TableError> {
        if key == EMPTY {
            return Err(TableError::ReservedKey { table: self.name });
        }
        let home = self.home(key);
        for step in 0..self.probe_window() {
            let index = (home + step) & self.mask;
            let slot = &self.slots[index];
            let mut current = slot.key.load(Ordering::Acquire);
            if current == EMPTY {
                // An empty slot ends the chain, so the key is absent.
                if !self.reserve() {
                    return Err(self.full());
                }
                match slot
                    .key
                    .compare_exchange(EMPTY, key, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        return Ok(Entry {
                            index,
                            value: &slot.value,
                            inserted: true,
                        })
                    }
                    Err(winner) => {
                        self.len.fetch_sub(1, Ordering::Relaxed);
                        current = winner;
                    }
                }
            }
            if current == key {
                return Ok(Entry {
                    index,
                    value: &slot.value,
                    inserted: false,
                });
            }
        }
        Err(self.full())
    }

    fn reserve(&self) -> bool {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    fn full(&self) -> TableError {
        TableError::Full {
            table: self.name,
            capacity: self.capacity,
        }
    }

    /// Iterate occupied slots as `(key, index, value)`.
    ///
    /// Walks the whole arena; intended for reporting, not the event path.
    pub fn iter(&self) -> impl Iterator<Item = (u64, usize, &V)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            match slot.key.load(Ordering::Acquire) {
                EMPTY => None,
                key => Some((key, index, &slot.value)),
            }
        })
    }
}
