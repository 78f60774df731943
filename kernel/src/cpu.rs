//! CPU identity, affinity masks, and the per-CPU descriptor.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::commit::CommitAccounting;
use crate::error::OneShotWarning;
use crate::process::Pid;
use crate::queue::RunQueue;
use crate::topology::TopologyFact;

/// Maximum number of CPUs a single `CpuSet`/sequence can address. Matches
/// the host kernel's own `CpuSet` bitmap width.
pub const MAX_CPUS: usize = 64;

pub type CpuId = usize;

/// A bitmap of CPUs, used for allowed-CPU sets, node sets, and LWK CPU
/// sets alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet {
    mask: u64,
}

impl CpuSet {
    pub const fn empty() -> Self {
        Self { mask: 0 }
    }

    pub const fn all() -> Self {
        Self { mask: !0u64 }
    }

    pub const fn single(cpu: CpuId) -> Self {
        Self {
            mask: 1u64 << cpu,
        }
    }

    pub const fn from_mask(mask: u64) -> Self {
        Self { mask }
    }

    pub const fn as_mask(&self) -> u64 {
        self.mask
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        cpu < MAX_CPUS && (self.mask & (1u64 << cpu)) != 0
    }

    pub fn insert(&mut self, cpu: CpuId) {
        self.mask |= 1u64 << cpu;
    }

    pub fn remove(&mut self, cpu: CpuId) {
        self.mask &= !(1u64 << cpu);
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    pub fn len(&self) -> u32 {
        self.mask.count_ones()
    }

    pub fn iter(&self) -> CpuSetIter {
        CpuSetIter { mask: self.mask }
    }
}

pub struct CpuSetIter {
    mask: u64,
}

impl Iterator for CpuSetIter {
    type Item = CpuId;

    fn next(&mut self) -> Option<CpuId> {
        if self.mask == 0 {
            return None;
        }
        let cpu = self.mask.trailing_zeros() as CpuId;
        self.mask &= self.mask - 1;
        Some(cpu)
    }
}

/// Per-CPU statistics. Collected off the hot path of `pick_next` with
/// relaxed loads and guarded writes, per the statistics-must-not-gate-
/// scheduling design note.
#[derive(Debug, Default)]
pub struct CpuStats {
    pub max_compute_depth: AtomicU64,
    pub max_utility_depth: AtomicU64,
    pub max_runnable: AtomicU64,
    pub guest_dispatches: AtomicU64,
    pub timer_ticks: AtomicU64,
    /// Host-initiated migrations of an LWK task via a syscall path
    /// (counted only while `move_syscalls_disable` is unset for that task).
    pub sysc_migrations: AtomicU64,
    pub setaffinity_count: AtomicU64,
    pub pushed: AtomicU64,
    pub guests: AtomicU64,
    pub givebacks: AtomicU64,
    /// An unrecognised host scheduling class landed on this CPU; warned
    /// once rather than per occurrence.
    pub unrecognised_class_warning: OneShotWarning,
}

impl CpuStats {
    fn bump_max(counter: &AtomicU64, candidate: u64) {
        let mut current = counter.load(Ordering::Relaxed);
        while candidate > current {
            match counter.compare_exchange_weak(
                current,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn record_compute_depth(&self, depth: u64) {
        Self::bump_max(&self.max_compute_depth, depth);
    }

    pub fn record_utility_depth(&self, depth: u64) {
        Self::bump_max(&self.max_utility_depth, depth);
    }

    pub fn record_runnable(&self, count: u64) {
        Self::bump_max(&self.max_runnable, count);
    }
}

/// A present CPU: immutable topology facts plus the mutable scheduling
/// state the core manages for it.
pub struct CpuDescriptor {
    pub id: CpuId,
    pub topology: TopologyFact,
    /// Set when this CPU has been ceded to the LWK core.
    is_lwk: AtomicBool,
    pub run_queue: Mutex<RunQueue>,
    pub commit: CommitAccounting,
    /// 0 = unowned; otherwise the pid holding an exclusive reservation.
    exclusive_owner: AtomicU64,
    shallow_hint: AtomicU32,
    deep_hint: AtomicU32,
    /// pid of the process this CPU currently belongs to (0 = none).
    owner_pid: AtomicU64,
    pub stats: CpuStats,
    pub no_anchor_warning: OneShotWarning,
}

impl CpuDescriptor {
    pub fn new(id: CpuId, topology: TopologyFact) -> Self {
        Self {
            id,
            topology,
            is_lwk: AtomicBool::new(false),
            run_queue: Mutex::new(RunQueue::new()),
            commit: CommitAccounting::new(),
            exclusive_owner: AtomicU64::new(0),
            shallow_hint: AtomicU32::new(0),
            deep_hint: AtomicU32::new(0),
            owner_pid: AtomicU64::new(0),
            stats: CpuStats::default(),
            no_anchor_warning: OneShotWarning::new(),
        }
    }

    pub fn is_lwk(&self) -> bool {
        self.is_lwk.load(Ordering::Acquire)
    }

    /// Mark this CPU LWK/non-LWK. A full memory barrier precedes the caller
    /// waking the idle task, so the idle loop observes the new value before
    /// it next checks `is_lwk`.
    pub fn set_is_lwk(&self, value: bool) {
        self.is_lwk.store(value, Ordering::Release);
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    pub fn owner_pid(&self) -> Pid {
        self.owner_pid.load(Ordering::Acquire)
    }

    pub fn set_owner_pid(&self, pid: Pid) {
        self.owner_pid.store(pid, Ordering::Release);
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    /// `true` while some task holds this CPU for exclusive reservation
    /// (I2).
    pub fn exclusive_owner(&self) -> Pid {
        self.exclusive_owner.load(Ordering::Acquire)
    }

    /// Atomically reserve the CPU for `pid` iff currently unowned.
    pub fn try_reserve_exclusive(&self, pid: Pid) -> bool {
        self.exclusive_owner
            .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear_exclusive(&self, pid: Pid) -> bool {
        self.exclusive_owner
            .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_hints(&self, shallow: u32, deep: u32) {
        self.shallow_hint.store(shallow, Ordering::Relaxed);
        self.deep_hint.store(deep, Ordering::Relaxed);
    }

    pub fn shallow_hint(&self) -> u32 {
        self.shallow_hint.load(Ordering::Relaxed)
    }

    pub fn deep_hint(&self) -> u32 {
        self.deep_hint.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_set_basic_ops() {
        let mut set = CpuSet::empty();
        assert!(set.is_empty());
        set.insert(3);
        set.insert(5);
        assert!(set.contains(3));
        assert!(set.contains(5));
        assert!(!set.contains(4));
        assert_eq!(set.len(), 2);
        let collected: alloc::vec::Vec<CpuId> = set.iter().collect();
        assert_eq!(collected, alloc::vec![3, 5]);
        set.remove(3);
        assert!(!set.contains(3));
    }

    #[test]
    fn exclusive_reservation_is_cas_guarded() {
        let desc = CpuDescriptor::new(0, TopologyFact::default());
        assert_eq!(desc.exclusive_owner(), 0);
        assert!(desc.try_reserve_exclusive(42));
        assert!(!desc.try_reserve_exclusive(7));
        assert_eq!(desc.exclusive_owner(), 42);
        assert!(desc.clear_exclusive(42));
        assert_eq!(desc.exclusive_owner(), 0);
    }
}
