//! The LWK Process Record: per-process policy knobs, CPU sets, and the
//! moveable-utility-thread list pushed-utility rebalancing walks.

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::cpu::CpuSet;
use crate::entity::EntityId;
use crate::group_registry::UtilityGroupRegistry;

pub type Pid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OvercommitBehaviour {
    AllCommits,
    OnlyCompute,
    OnlyUtility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedCpusPerUtil {
    Multiple,
    One,
}

/// Policy knobs accepted from the boot/yod configuration channel (§6).
#[derive(Debug, Clone, Copy)]
pub struct ProcessPolicy {
    pub max_cpus_for_util: u32,
    pub max_util_threads_per_cpu: u32,
    pub overcommit_behaviour: OvercommitBehaviour,
    pub allowed_cpus_per_util: AllowedCpusPerUtil,
    /// Time slice in ticks; 0 disables round-robin.
    pub enable_rr: u32,
    /// errno to return from setaffinity, or 0 to allow it.
    pub disable_setaffinity: i32,
    pub move_syscalls_disable: bool,
    pub stats_level: u32,
}

impl Default for ProcessPolicy {
    fn default() -> Self {
        Self {
            max_cpus_for_util: u32::MAX,
            max_util_threads_per_cpu: u32::MAX,
            overcommit_behaviour: OvercommitBehaviour::AllCommits,
            allowed_cpus_per_util: AllowedCpusPerUtil::Multiple,
            enable_rr: 0,
            disable_setaffinity: 0,
            move_syscalls_disable: false,
            stats_level: 0,
        }
    }
}

/// Per-process LWK state.
pub struct ProcessRecord {
    pub tgid: Pid,
    pub lwk_cpus: CpuSet,
    /// Ordered assignment preference, typically end-loaded for utility
    /// threads.
    pub lwk_cpu_sequence: alloc::vec::Vec<crate::cpu::CpuId>,
    /// Host CPUs usable for utility threads.
    pub utility_cpus: CpuSet,
    /// The process's allowed-CPU set before it was ceded to the LWK, used
    /// to restore a process-creation child or an exiting process.
    pub saved_allowed: CpuSet,
    pub policy: ProcessPolicy,
    moveable_utility: Mutex<VecDeque<EntityId>>,
    created_threads: core::sync::atomic::AtomicU32,
    pub num_util_threads_expected: u32,
    pub groups: UtilityGroupRegistry,
}

impl ProcessRecord {
    pub fn new(tgid: Pid, lwk_cpus: CpuSet, lwk_cpu_sequence: alloc::vec::Vec<crate::cpu::CpuId>) -> Self {
        Self {
            tgid,
            lwk_cpus,
            lwk_cpu_sequence,
            utility_cpus: CpuSet::empty(),
            saved_allowed: CpuSet::all(),
            policy: ProcessPolicy::default(),
            moveable_utility: Mutex::new(VecDeque::new()),
            created_threads: core::sync::atomic::AtomicU32::new(0),
            num_util_threads_expected: 0,
            groups: UtilityGroupRegistry::new(),
        }
    }

    pub fn bump_created_threads(&self) -> u32 {
        self.created_threads
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed)
            + 1
    }

    /// Head-insert `id` onto the moveable-utility list, held only across
    /// the commit that accompanies placement (§4.3 step 4).
    pub fn link_moveable(&self, id: EntityId) {
        self.moveable_utility.lock().push_front(id);
    }

    pub fn unlink_moveable(&self, id: EntityId) {
        let mut list = self.moveable_utility.lock();
        if let Some(pos) = list.iter().position(|&e| e == id) {
            list.remove(pos);
        }
    }

    /// Pop the head of the moveable-utility list, as the push-rebalancing
    /// walk does.
    pub fn pop_moveable(&self) -> Option<EntityId> {
        self.moveable_utility.lock().pop_front()
    }

    pub fn moveable_is_empty(&self) -> bool {
        self.moveable_utility.lock().is_empty()
    }

    pub fn moveable_len(&self) -> usize {
        self.moveable_utility.lock().len()
    }

    /// Truncate `max_cpus_for_util` to the process's own utility-CPU set
    /// size when `Multiple` sub-mode is active — the documented resolution
    /// of the range-vs-process-set open question.
    pub fn effective_util_cpu_limit(&self) -> u32 {
        self.policy.max_cpus_for_util.min(self.utility_cpus.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;

    #[test]
    fn moveable_list_is_fifo_head_insert_head_pop() {
        let record = ProcessRecord::new(1, CpuSet::empty(), alloc::vec![]);
        record.link_moveable(EntityId(1));
        record.link_moveable(EntityId(2));
        // Head insert means the most recently linked entity pops first.
        assert_eq!(record.pop_moveable(), Some(EntityId(2)));
        assert_eq!(record.pop_moveable(), Some(EntityId(1)));
        assert!(record.moveable_is_empty());
    }

    #[test]
    fn effective_util_cpu_limit_truncates_to_process_set() {
        let mut record = ProcessRecord::new(1, CpuSet::empty(), alloc::vec![]);
        record.policy.max_cpus_for_util = 16;
        record.utility_cpus = CpuSet::from_mask(0b111); // 3 CPUs
        assert_eq!(record.effective_util_cpu_limit(), 3);
    }

    #[test]
    fn unlink_removes_from_middle() {
        let record = ProcessRecord::new(1, CpuSet::empty(), alloc::vec![]);
        record.link_moveable(EntityId(1));
        record.link_moveable(EntityId(2));
        record.link_moveable(EntityId(3));
        record.unlink_moveable(EntityId(2));
        assert_eq!(record.moveable_len(), 2);
        assert_eq!(record.pop_moveable(), Some(EntityId(3)));
        assert_eq!(record.pop_moveable(), Some(EntityId(1)));
    }
}
