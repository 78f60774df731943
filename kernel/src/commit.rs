//! Per-CPU commit accounting.
//!
//! Every placement decision reads these counters; `commit`/`uncommit` are
//! the only writers, and they are always called under the commit-
//! accounting lock discipline described in the concurrency model (a
//! per-CPU lock held only across the counter read-modify-write).

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::entity::{EntityTable, SchedEntity, ThreadType};
use crate::error::OneShotWarning;

/// Counters saturate here rather than wrapping; saturation is flagged via
/// a one-shot warning, not silently tolerated.
pub const COMMIT_MAX: u64 = 1 << 32;

#[derive(Debug, Default)]
struct Counters {
    compute: u64,
    utility: u64,
}

pub struct CommitAccounting {
    counters: Mutex<Counters>,
    underflow_count: AtomicU64,
    underflow_warning: OneShotWarning,
    saturation_warning: OneShotWarning,
}

impl Default for CommitAccounting {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitAccounting {
    pub const fn new() -> Self {
        Self {
            counters: Mutex::new(Counters {
                compute: 0,
                utility: 0,
            }),
            underflow_count: AtomicU64::new(0),
            underflow_warning: OneShotWarning::new(),
            saturation_warning: OneShotWarning::new(),
        }
    }

    /// Credit `entity` against this CPU: increments the compute or utility
    /// counter depending on `entity.thread_type`, records the new commit
    /// statistics maxima, and stores `cpu` into `entity.cpu_home`.
    pub fn commit(
        &self,
        entities: &mut EntityTable,
        entity_id: crate::entity::EntityId,
        cpu: crate::cpu::CpuId,
        stats: &crate::cpu::CpuStats,
    ) {
        let thread_type = entities.get(entity_id).thread_type;
        let mut counters = self.counters.lock();
        match thread_type {
            ThreadType::Normal | ThreadType::Guest => {
                if counters.compute < COMMIT_MAX {
                    counters.compute += 1;
                } else {
                    self.saturation_warning
                        .warn_once("compute commit counter saturated");
                }
                stats.record_compute_depth(counters.compute);
            }
            ThreadType::Utility => {
                if counters.utility < COMMIT_MAX {
                    counters.utility += 1;
                } else {
                    self.saturation_warning
                        .warn_once("utility commit counter saturated");
                }
                stats.record_utility_depth(counters.utility);
            }
            ThreadType::Idle => {}
        }
        drop(counters);
        entities.get_mut(entity_id).cpu_home = Some(cpu);
    }

    /// Release `entity`'s commit on its current `cpu_home`, if any.
    /// Underflow (decrementing an already-zero counter) is counted and
    /// warned about once, never panics, and never blocks clearing
    /// `cpu_home`.
    pub fn uncommit(&self, entities: &mut EntityTable, entity_id: crate::entity::EntityId) {
        let entity: &SchedEntity = entities.get(entity_id);
        let Some(_cpu) = entity.cpu_home else {
            return;
        };
        let thread_type = entity.thread_type;
        let mut counters = self.counters.lock();
        match thread_type {
            ThreadType::Normal | ThreadType::Guest => {
                if counters.compute == 0 {
                    self.underflow_count.fetch_add(1, Ordering::Relaxed);
                    self.underflow_warning
                        .warn_once("compute commit underflow on uncommit");
                } else {
                    counters.compute -= 1;
                }
            }
            ThreadType::Utility => {
                if counters.utility == 0 {
                    self.underflow_count.fetch_add(1, Ordering::Relaxed);
                    self.underflow_warning
                        .warn_once("utility commit underflow on uncommit");
                } else {
                    counters.utility -= 1;
                }
            }
            ThreadType::Idle => {}
        }
        drop(counters);
        entities.get_mut(entity_id).cpu_home = None;
    }

    /// Atomic read of `(compute, utility)` with respect to a concurrent
    /// commit on the same CPU.
    pub fn read_commits(&self) -> (u64, u64) {
        let counters = self.counters.lock();
        (counters.compute, counters.utility)
    }

    pub fn is_overcommitted(&self) -> bool {
        let counters = self.counters.lock();
        counters.compute + counters.utility > 1
    }

    pub fn underflow_count(&self) -> u64 {
        self.underflow_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityTable, ThreadType};

    #[test]
    fn commit_uncommit_round_trips() {
        let accounting = CommitAccounting::new();
        let stats = crate::cpu::CpuStats::default();
        let mut table = EntityTable::new();
        let id = table.insert(SchedEntity::new(1, 1, ThreadType::Normal));

        assert_eq!(accounting.read_commits(), (0, 0));
        accounting.commit(&mut table, id, 3, &stats);
        assert_eq!(accounting.read_commits(), (1, 0));
        assert_eq!(table.get(id).cpu_home, Some(3));

        accounting.uncommit(&mut table, id);
        assert_eq!(accounting.read_commits(), (0, 0));
        assert_eq!(table.get(id).cpu_home, None);
        assert_eq!(accounting.underflow_count(), 0);
    }

    #[test]
    fn uncommit_on_idle_entity_without_cpu_home_is_noop() {
        let accounting = CommitAccounting::new();
        let mut table = EntityTable::new();
        let id = table.insert(SchedEntity::new(1, 1, ThreadType::Utility));
        accounting.uncommit(&mut table, id);
        assert_eq!(accounting.read_commits(), (0, 0));
        assert_eq!(accounting.underflow_count(), 0);
    }

    #[test]
    fn overcommit_detection() {
        let accounting = CommitAccounting::new();
        let stats = crate::cpu::CpuStats::default();
        let mut table = EntityTable::new();
        let a = table.insert(SchedEntity::new(1, 1, ThreadType::Normal));
        let b = table.insert(SchedEntity::new(2, 2, ThreadType::Utility));
        accounting.commit(&mut table, a, 0, &stats);
        assert!(!accounting.is_overcommitted());
        accounting.commit(&mut table, b, 0, &stats);
        assert!(accounting.is_overcommitted());
    }
}
