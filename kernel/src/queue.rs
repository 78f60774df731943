//! The per-CPU, priority-array-backed LWK run queue.
//!
//! Mirrors the host kernel's own bitmap-indexed `ReadyQueue`: one ring per
//! priority slot, one bit per non-empty slot, `trailing_zeros` for O(1)
//! highest-priority lookup. The run queue stores `EntityId`s, not entities
//! themselves — entity data lives in the `EntityTable` slab so this struct
//! never needs unsafe pointer linkage.

use alloc::collections::VecDeque;

use crate::entity::{EntityId, EntityTable, ThreadType};
use crate::host::HostClass;

/// Number of real-time priority levels LWK compute/utility threads occupy.
pub const NUM_RT_LEVELS: usize = 8;
/// Reserved slot for an assimilated deadline-class guest.
pub const SLOT_DEADLINE_GUEST: usize = NUM_RT_LEVELS;
/// Reserved slot for an assimilated fair-class guest.
pub const SLOT_FAIR_GUEST: usize = NUM_RT_LEVELS + 1;
/// The LWK idle entity's slot; always the lowest priority.
pub const SLOT_IDLE: usize = NUM_RT_LEVELS + 2;
pub const NUM_SLOTS: usize = NUM_RT_LEVELS + 3;

/// Default real-time level newly forked LWK compute/utility threads start
/// at.
pub const DEFAULT_RT_LEVEL: u8 = NUM_RT_LEVELS as u8 / 2;

/// Compute the priority slot an entity belongs in. LWK Normal/Utility
/// threads use their real-time level directly; an assimilated Guest uses
/// one of the two reserved guest slots depending on its original host
/// class; the Idle entity always occupies `SLOT_IDLE`.
pub fn priority_slot(entities: &EntityTable, id: EntityId, rt_level: u8) -> usize {
    let entity = entities.get(id);
    match entity.thread_type {
        ThreadType::Idle => SLOT_IDLE,
        ThreadType::Guest => match entity.orig.map(|o| o.class) {
            Some(HostClass::Deadline) => SLOT_DEADLINE_GUEST,
            _ => SLOT_FAIR_GUEST,
        },
        ThreadType::Normal | ThreadType::Utility => {
            (rt_level as usize).min(NUM_RT_LEVELS - 1)
        }
    }
}

/// A single priority slot: a FIFO ring of entity ids.
#[derive(Default)]
struct Slot {
    ring: VecDeque<EntityId>,
}

/// Per-CPU run queue: `NUM_SLOTS` priority rings plus a bitmap of
/// non-empty slots.
pub struct RunQueue {
    slots: [Slot; NUM_SLOTS],
    bitmap: u32,
    /// Count of queue entries excluding the idle entity (I5,
    /// `mos_nr_running`).
    nr_running: usize,
    idle: Option<EntityId>,
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::default()),
            bitmap: 0,
            nr_running: 0,
            idle: None,
        }
    }

    /// Install this CPU's dedicated idle entity. Permanently resident in
    /// `SLOT_IDLE`; never counted by `nr_running`, never removed by
    /// `dequeue`.
    pub fn install_idle(&mut self, idle: EntityId) {
        self.slots[SLOT_IDLE].ring.push_back(idle);
        self.bitmap |= 1 << SLOT_IDLE;
        self.idle = Some(idle);
    }

    pub fn idle(&self) -> Option<EntityId> {
        self.idle
    }

    fn is_idle(&self, id: EntityId) -> bool {
        self.idle == Some(id)
    }

    /// Enqueue `id` into `slot` at head or tail.
    pub fn enqueue(&mut self, id: EntityId, slot: usize, head: bool) {
        let was_empty = self.slots[slot].ring.is_empty();
        if head {
            self.slots[slot].ring.push_front(id);
        } else {
            self.slots[slot].ring.push_back(id);
        }
        if was_empty {
            self.bitmap |= 1 << slot;
        }
        if !self.is_idle(id) {
            self.nr_running += 1;
        }
    }

    /// No-op for the idle entity (I4). Otherwise removes `id` from `slot`,
    /// clearing the slot's bit if it becomes empty.
    pub fn dequeue(&mut self, id: EntityId, slot: usize) -> bool {
        if self.is_idle(id) {
            return false;
        }
        let ring = &mut self.slots[slot].ring;
        if let Some(pos) = ring.iter().position(|&e| e == id) {
            ring.remove(pos);
            if ring.is_empty() {
                self.bitmap &= !(1 << slot);
            }
            self.nr_running -= 1;
            true
        } else {
            false
        }
    }

    /// Rotate `id` to the tail of its current slot.
    pub fn requeue_to_tail(&mut self, id: EntityId, slot: usize) {
        let ring = &mut self.slots[slot].ring;
        if let Some(pos) = ring.iter().position(|&e| e == id) {
            ring.remove(pos);
            ring.push_back(id);
        }
    }

    /// The first entity from the lowest-indexed non-empty slot, without
    /// removing it, or `None` if the queue is empty.
    pub fn pick_next(&self) -> Option<EntityId> {
        if self.bitmap == 0 {
            return None;
        }
        let slot = self.bitmap.trailing_zeros() as usize;
        self.slots[slot].ring.front().copied()
    }

    /// Lowest occupied slot index, used by the preemption check.
    pub fn lowest_index(&self) -> Option<usize> {
        if self.bitmap == 0 {
            None
        } else {
            Some(self.bitmap.trailing_zeros() as usize)
        }
    }

    pub fn slot_len(&self, slot: usize) -> usize {
        self.slots[slot].ring.len()
    }

    /// I5: entries on the queue excluding the idle entity.
    pub fn nr_running(&self) -> usize {
        self.nr_running
    }

    pub fn bitmap(&self) -> u32 {
        self.bitmap
    }

    /// A newly enqueued entity at `new_slot` preempts whatever is running
    /// iff its slot index is strictly lower than `current_slot`.
    pub fn should_preempt(current_slot: usize, new_slot: usize) -> bool {
        new_slot < current_slot
    }
}
