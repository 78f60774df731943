//! Utility-Group Registry.
//!
//! A small bounded table mapping opaque grouping keys to a remembered
//! topology anchor. Protected by a single global spinlock that placement
//! holds across both the search and, when no entry exists yet, the insert
//! — otherwise two concurrent clones sharing a key could each observe "not
//! found" and create divergent anchors.

use core::num::NonZeroU64;

use spin::{Mutex, MutexGuard};

use crate::cpu::CpuId;

pub const GROUP_TABLE_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
struct GroupEntry {
    /// 0 means the slot is free (I7).
    key: u64,
    refcount: u32,
    anchor: CpuId,
}

pub struct UtilityGroupRegistry {
    table: Mutex<[GroupEntry; GROUP_TABLE_SIZE]>,
}

impl Default for UtilityGroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Held across a lookup that fails, so the caller can populate the entry
/// itself without releasing the lock to a racing clone with the same key.
pub struct PendingInsert<'a> {
    guard: MutexGuard<'a, [GroupEntry; GROUP_TABLE_SIZE]>,
    slot: usize,
}

impl<'a> PendingInsert<'a> {
    pub fn write(mut self, key: NonZeroU64, anchor: CpuId) {
        self.guard[self.slot] = GroupEntry {
            key: key.get(),
            refcount: 1,
            anchor,
        };
    }
}

pub enum Lookup<'a> {
    /// An entry already existed; its refcount has been bumped and its
    /// anchor returned.
    Found { anchor: CpuId },
    /// No entry existed. The lock is held in `pending` until the caller
    /// writes the new entry.
    NotFound { pending: PendingInsert<'a> },
}

impl UtilityGroupRegistry {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new([GroupEntry {
                key: 0,
                refcount: 0,
                anchor: 0,
            }; GROUP_TABLE_SIZE]),
        }
    }

    /// Look up `key`. On a hit, bumps refcount and returns the anchor. On a
    /// miss, returns a `PendingInsert` holding the lock so the caller can
    /// write the new entry atomically with respect to other lookups.
    ///
    /// Returns `None` if the table is full and the key was not found.
    pub fn lookup_or_reserve(&self, key: NonZeroU64) -> Option<Lookup<'_>> {
        let mut guard = self.table.lock();
        if let Some(slot) = guard.iter().position(|e| e.key == key.get()) {
            guard[slot].refcount += 1;
            let anchor = guard[slot].anchor;
            return Some(Lookup::Found { anchor });
        }
        let free_slot = guard.iter().position(|e| e.key == 0)?;
        Some(Lookup::NotFound {
            pending: PendingInsert {
                guard,
                slot: free_slot,
            },
        })
    }

    /// Release one reference; frees the slot when the refcount reaches
    /// zero.
    pub fn release(&self, key: NonZeroU64) {
        let mut guard = self.table.lock();
        if let Some(slot) = guard.iter().position(|e| e.key == key.get()) {
            guard[slot].refcount = guard[slot].refcount.saturating_sub(1);
            if guard[slot].refcount == 0 {
                guard[slot] = GroupEntry::default();
            }
        }
    }

    pub fn refcount(&self, key: NonZeroU64) -> u32 {
        let guard = self.table.lock();
        guard
            .iter()
            .find(|e| e.key == key.get())
            .map(|e| e.refcount)
            .unwrap_or(0)
    }
}
