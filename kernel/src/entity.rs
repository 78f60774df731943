//! The LWK scheduling entity attached to every task, and the slab arena
//! that owns entity storage.
//!
//! Entities are addressed by a stable index (`EntityId`) rather than an
//! intrusive pointer: the run queue's slots hold ids, not raw links, which
//! keeps enqueue/dequeue O(1) without per-operation allocation while
//! avoiding the unsafe pointer aliasing the host kernel's own `TaskPtr`
//! wrapper has to reason about.

use alloc::vec::Vec;

use crate::cpu::{CpuId, CpuSet};
use crate::hints::{AcceptedHints, CloneHints};
use crate::host::{HostClass, HostPolicy};
use crate::process::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub u32);

/// What an LWK entity is for. Drives commit accounting, priority-slot
/// assignment, and the assimilation protocol's class decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadType {
    /// An LWK compute thread intended to monopolise a CPU.
    Normal,
    /// An LWK utility thread intended to share a CPU.
    Utility,
    /// A host-originated task assimilated onto an LWK CPU.
    Guest,
    /// The per-CPU LWK idle task.
    Idle,
}

/// Snapshot of a task's pre-assimilation scheduling class/policy, restored
/// on give-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrigScheduling {
    pub class: HostClass,
    pub policy: HostPolicy,
    pub nice: i8,
}

/// The LWK scheduling entity attached to every task known to this core.
pub struct SchedEntity {
    pub pid: Pid,
    pub tgid: Pid,
    /// -1 (`None`) or the CPU this entity is committed against.
    pub cpu_home: Option<CpuId>,
    pub thread_type: ThreadType,
    pub assimilated: bool,
    pub orig: Option<OrigScheduling>,
    /// Current LWK-internal policy (Fifo or RoundRobin); set by the
    /// assimilation protocol from the process's `enable_rr` knob.
    pub policy: HostPolicy,
    pub slice_remaining: u32,
    pub slice_reload: u32,
    /// Real-time band within the LWK run queue (`queue::priority_slot`).
    pub rt_level: u8,
    /// Forced into round-robin time-slicing regardless of process policy
    /// (set by a NON_COOP behaviour hint).
    pub force_round_robin: bool,
    pub accepted_hints: AcceptedHints,
    /// The clone-hint channel's staging slot for this task's *next* thread
    /// creation; consumed exactly once by the fork hook.
    pub staged_hints: CloneHints,
    /// Linked onto the process's moveable-utility list.
    pub moveable_linked: bool,
    pub move_syscalls_disable: bool,
    pub allowed: CpuSet,
    /// The node set from the clone hints that placed this entity, if any;
    /// consulted by push-utility rebalancing (a NodeSet hint is the only
    /// one rebalancing honours).
    pub requested_node_set: CpuSet,
    /// Which run-queue slot this entity currently occupies, if enqueued.
    pub(crate) queue_slot: Option<usize>,
}

impl SchedEntity {
    pub fn new(pid: Pid, tgid: Pid, thread_type: ThreadType) -> Self {
        Self {
            pid,
            tgid,
            cpu_home: None,
            thread_type,
            assimilated: false,
            orig: None,
            policy: HostPolicy::Fifo,
            slice_remaining: 0,
            slice_reload: 0,
            rt_level: crate::queue::DEFAULT_RT_LEVEL,
            force_round_robin: false,
            accepted_hints: AcceptedHints::default(),
            staged_hints: CloneHints::default(),
            moveable_linked: false,
            move_syscalls_disable: false,
            allowed: CpuSet::all(),
            requested_node_set: CpuSet::empty(),
            queue_slot: None,
        }
    }

    pub fn is_main_thread(&self) -> bool {
        self.pid == self.tgid
    }
}

/// Slab arena owning every `SchedEntity` known to the core. Freed slots are
/// recycled via a free list so long-running systems do not grow the arena
/// unboundedly.
#[derive(Default)]
pub struct EntityTable {
    slots: Vec<Option<SchedEntity>>,
    free: Vec<u32>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, entity: SchedEntity) -> EntityId {
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(entity);
            EntityId(index)
        } else {
            self.slots.push(Some(entity));
            EntityId((self.slots.len() - 1) as u32)
        }
    }

    pub fn remove(&mut self, id: EntityId) -> Option<SchedEntity> {
        let slot = self.slots.get_mut(id.0 as usize)?;
        let removed = slot.take();
        if removed.is_some() {
            self.free.push(id.0);
        }
        removed
    }

    pub fn get(&self, id: EntityId) -> &SchedEntity {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("dangling EntityId")
    }

    pub fn get_mut(&mut self, id: EntityId) -> &mut SchedEntity {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("dangling EntityId")
    }

    pub fn try_get(&self, id: EntityId) -> Option<&SchedEntity> {
        self.slots.get(id.0 as usize)?.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_recycles_slots() {
        let mut table = EntityTable::new();
        let a = table.insert(SchedEntity::new(1, 1, ThreadType::Normal));
        let b = table.insert(SchedEntity::new(2, 2, ThreadType::Utility));
        assert_eq!(a.0, 0);
        assert_eq!(b.0, 1);

        table.remove(a);
        assert!(table.try_get(a).is_none());

        let c = table.insert(SchedEntity::new(3, 3, ThreadType::Normal));
        assert_eq!(c.0, 0, "freed slot should be recycled");
    }

    #[test]
    fn main_thread_detection() {
        let main = SchedEntity::new(10, 10, ThreadType::Normal);
        let child = SchedEntity::new(11, 10, ThreadType::Normal);
        assert!(main.is_main_thread());
        assert!(!child.is_main_thread());
    }
}
