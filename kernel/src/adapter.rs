//! The Scheduler Class Adapter: the hook surface the host core scheduler
//! calls into, the assimilation/give-back protocol, and the fork hook.

use crate::cpu::{CpuDescriptor, CpuId, CpuSet};
use crate::entity::{EntityId, EntityTable, OrigScheduling, SchedEntity, ThreadType};
use crate::hints::CloneHints;
use crate::host::{HostClass, HostPolicy, HostScheduler};
use crate::placement::{self, PlacementContext};
use crate::process::{Pid, ProcessRecord};
use crate::queue::{RunQueue, DEFAULT_RT_LEVEL};

/// Place `entity_id` on `cpu`'s run queue, recording its current slot.
pub fn enqueue(cpu: &CpuDescriptor, entities: &mut EntityTable, entity_id: EntityId, head: bool) {
    let rt_level = entities.get(entity_id).rt_level;
    let slot = crate::queue::priority_slot(entities, entity_id, rt_level);
    let nr_running = {
        let mut rq = cpu.run_queue.lock();
        rq.enqueue(entity_id, slot, head);
        rq.nr_running() as u64
    };
    entities.get_mut(entity_id).queue_slot = Some(slot);
    cpu.stats.record_runnable(nr_running);
}

/// Remove `entity_id` from `cpu`'s run queue. No-op for the idle entity.
pub fn dequeue(cpu: &CpuDescriptor, entities: &mut EntityTable, entity_id: EntityId) -> bool {
    let Some(slot) = entities.get(entity_id).queue_slot else {
        return false;
    };
    let removed = cpu.run_queue.lock().dequeue(entity_id, slot);
    if removed {
        entities.get_mut(entity_id).queue_slot = None;
    }
    removed
}

pub fn requeue_to_tail(cpu: &CpuDescriptor, entities: &EntityTable, entity_id: EntityId) {
    if let Some(slot) = entities.get(entity_id).queue_slot {
        cpu.run_queue.lock().requeue_to_tail(entity_id, slot);
    }
}

/// `yield`: returns immediately when the caller is alone at its priority
/// slot; otherwise rotates it to the tail of that slot. No priority
/// demotion either way.
pub fn yield_task(cpu: &CpuDescriptor, entities: &EntityTable, entity_id: EntityId) {
    let Some(slot) = entities.get(entity_id).queue_slot else {
        return;
    };
    if cpu.run_queue.lock().slot_len(slot) <= 1 {
        return;
    }
    requeue_to_tail(cpu, entities, entity_id);
}

/// `check_preempt_curr` / the shared rule behind `prio_changed` and
/// `switched_to`: a strictly lower queue index wins.
pub fn check_preempt_curr(current_slot: usize, candidate_slot: usize) -> bool {
    RunQueue::should_preempt(current_slot, candidate_slot)
}

pub fn pick_next(cpu: &CpuDescriptor) -> Option<EntityId> {
    cpu.run_queue.lock().pick_next()
}

pub fn set_cpus_allowed(entities: &mut EntityTable, entity_id: EntityId, mask: CpuSet) {
    entities.get_mut(entity_id).allowed = mask;
}

/// Outcome of a `tick` call: whether the task was rotated to the tail of
/// its slot and whether a reschedule should be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickOutcome {
    pub requeued: bool,
    pub reschedule: bool,
}

/// `tick`: decrement the round-robin slice for a task running under RR
/// (either process policy `enable_rr` with a RoundRobin internal policy, or
/// a NON_COOP behaviour override); on exhaustion, reload and, unless the
/// task is alone in its slot, requeue to tail and request a reschedule.
pub fn tick(process: &ProcessRecord, cpu: &CpuDescriptor, entities: &mut EntityTable, entity_id: EntityId) -> TickOutcome {
    let round_robin = {
        let entity = entities.get(entity_id);
        entity.force_round_robin || entity.policy == HostPolicy::RoundRobin
    };
    if process.policy.enable_rr == 0 || !round_robin {
        return TickOutcome::default();
    }

    let entity = entities.get_mut(entity_id);
    if entity.slice_remaining > 0 {
        entity.slice_remaining -= 1;
    }
    if entity.slice_remaining != 0 {
        return TickOutcome::default();
    }
    entity.slice_remaining = entity.slice_reload;
    let Some(slot) = entity.queue_slot else {
        return TickOutcome::default();
    };

    let alone = cpu.run_queue.lock().slot_len(slot) <= 1;
    if alone {
        return TickOutcome::default();
    }
    cpu.run_queue.lock().requeue_to_tail(entity_id, slot);
    TickOutcome {
        requeued: true,
        reschedule: true,
    }
}

/// The reason `select_task_rq` was invoked, driving which of the three
/// placement strategies applies.
pub enum SelectReason {
    Wake,
    Fork,
    Other,
}

/// `select_task_rq`: wake prefers `cpu_home` if still allowed; fork
/// delegates to compute placement with an unbounded commit limit; anything
/// else prefers the task's current CPU if allowed, else the
/// least-committed LWK CPU.
pub fn select_task_rq(
    ctx: &PlacementContext<'_>,
    entity_id: EntityId,
    reason: SelectReason,
    current_cpu: CpuId,
) -> CpuId {
    let entity = ctx.entities.get(entity_id);
    match reason {
        SelectReason::Wake => {
            if let Some(home) = entity.cpu_home {
                if entity.allowed.contains(home) {
                    return home;
                }
            }
            least_committed_or_current(ctx, entity_id, current_cpu)
        }
        SelectReason::Fork => {
            let allowed = entity.allowed;
            placement::select_cpu_candidate(
                ctx,
                &allowed,
                u64::MAX,
                crate::topology::MatchType::FirstAvailable,
                crate::topology::TopologyFact::default(),
                &CpuSet::empty(),
                false,
                entity.pid,
                None,
            )
            .unwrap_or(current_cpu)
        }
        SelectReason::Other => {
            if entity.allowed.contains(current_cpu) {
                current_cpu
            } else {
                least_committed_or_current(ctx, entity_id, current_cpu)
            }
        }
    }
}

fn least_committed_or_current(ctx: &PlacementContext<'_>, entity_id: EntityId, current_cpu: CpuId) -> CpuId {
    let allowed = ctx.entities.get(entity_id).allowed;
    placement::select_cpu_candidate(
        ctx,
        &allowed,
        u64::MAX,
        crate::topology::MatchType::FirstAvailable,
        crate::topology::TopologyFact::default(),
        &CpuSet::empty(),
        false,
        ctx.entities.get(entity_id).pid,
        None,
    )
    .unwrap_or(current_cpu)
}

/// What the assimilation protocol did with an arriving task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssimilationAction {
    /// Already an LWK task, already on an LWK CPU: nothing to do.
    NoOp,
    /// An assimilated guest left the LWK CPU; its original class/policy
    /// were restored.
    GiveBack,
    /// A task belonging to an LWK process was installed onto the LWK
    /// class.
    InstalledLwk,
    /// A foreign (host fair/rt/deadline) task landed on an LWK CPU and was
    /// assimilated as a guest.
    Guest,
    /// A stop/idle-class task landed on an LWK CPU; left untouched.
    LeftAlone,
}

/// `assimilate_task`: the decision tree run whenever a task enters (or is
/// already present on) an LWK CPU's run queue.
pub fn assimilate_task(
    entities: &mut EntityTable,
    entity_id: EntityId,
    on_lwk_cpu: bool,
    belongs_to_lwk_process: bool,
    incoming_class: Option<HostClass>,
    enable_rr: u32,
    stats: &crate::cpu::CpuStats,
    host: &mut dyn HostScheduler,
) -> AssimilationAction {
    let entity = entities.get(entity_id);

    if entity.assimilated && entity.thread_type != ThreadType::Guest && on_lwk_cpu {
        return AssimilationAction::NoOp;
    }

    if entity.assimilated && entity.thread_type == ThreadType::Guest && !on_lwk_cpu {
        let orig = entity.orig;
        let pid = entity.pid;
        let entity = entities.get_mut(entity_id);
        entity.orig = None;
        entity.assimilated = false;
        entity.thread_type = ThreadType::Normal;
        if let Some(orig) = orig {
            host.transfer_to_host(pid, orig.class, orig.policy, orig.nice);
        }
        stats.givebacks.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        return AssimilationAction::GiveBack;
    }

    if belongs_to_lwk_process {
        let entity = entities.get_mut(entity_id);
        entity.policy = if enable_rr != 0 {
            HostPolicy::RoundRobin
        } else {
            HostPolicy::Fifo
        };
        entity.rt_level = DEFAULT_RT_LEVEL;
        entity.thread_type = ThreadType::Normal;
        entity.slice_remaining = entity.slice_reload;
        entity.assimilated = true;
        return AssimilationAction::InstalledLwk;
    }

    match incoming_class {
        Some(HostClass::Stop) | Some(HostClass::Idle) => AssimilationAction::LeftAlone,
        Some(class @ (HostClass::Fair | HostClass::RealTime | HostClass::Deadline)) => {
            let entity = entities.get_mut(entity_id);
            entity.orig = Some(OrigScheduling {
                class,
                policy: entity.policy,
                nice: 0,
            });
            entity.policy = if enable_rr != 0 {
                HostPolicy::RoundRobin
            } else {
                HostPolicy::Fifo
            };
            entity.rt_level = DEFAULT_RT_LEVEL;
            entity.slice_remaining = entity.slice_reload;
            entity.thread_type = ThreadType::Guest;
            entity.assimilated = true;
            stats.guests.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            AssimilationAction::Guest
        }
        None => {
            stats
                .unrecognised_class_warning
                .warn_once("unrecognised host scheduling class on LWK CPU, leaving task alone");
            AssimilationAction::LeftAlone
        }
    }
}

/// Result of the fork hook: the new entity and where (if anywhere) it was
/// placed.
pub struct ForkOutcome {
    pub child: EntityId,
    pub placed_cpu: Option<CpuId>,
}

/// `fork`: a new child inherits parent priority and `ThreadType::Normal`,
/// `cpu_home = None`. Thread creation within the same thread group either
/// widens to the full LWK set and triggers push-utility rebalancing (past
/// the process's expected utility-thread count, without a UTILITY hint),
/// or is routed through utility-thread placement. Process creation
/// transfers the child to the host scheduler and restores its pre-LWK
/// allowed set. Clone hints are cleared on both parent and child either
/// way.
pub fn fork_hook(
    ctx: &mut PlacementContext<'_>,
    host: &mut dyn HostScheduler,
    parent_id: EntityId,
    child_pid: Pid,
    child_tgid: Pid,
    same_thread_group: bool,
) -> ForkOutcome {
    let parent_rt_level = ctx.entities.get(parent_id).rt_level;
    let hints = ctx.entities.get(parent_id).staged_hints.clone();

    let mut child_entity = SchedEntity::new(child_pid, child_tgid, ThreadType::Normal);
    child_entity.rt_level = parent_rt_level;
    child_entity.allowed = ctx.entities.get(parent_id).allowed;
    let child = ctx.entities.insert(child_entity);

    let placed_cpu = if same_thread_group {
        let created = ctx.process.bump_created_threads();
        let wants_utility = hints.behaviour.contains(crate::hints::BehaviourFlags::UTILITY);
        if created > ctx.process.num_util_threads_expected && !wants_utility {
            ctx.entities.get_mut(child).allowed = ctx.process.lwk_cpus;
            placement::push_utility_rebalance(ctx, host);
            None
        } else {
            let result = placement::place_utility_thread(ctx, parent_id, child, &hints, host);
            Some(result.cpu)
        }
    } else {
        crate::behavior::move_to_host_scheduler(ctx.entities, child, hints.behaviour, host);
        ctx.entities.get_mut(child).allowed = ctx.process.saved_allowed;
        None
    };

    ctx.entities.get_mut(parent_id).staged_hints = CloneHints::default();
    ctx.entities.get_mut(child).staged_hints = CloneHints::default();

    ForkOutcome { child, placed_cpu }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{CpuSet, CpuStats};
    use crate::topology::TopologyFact;

    fn make_cpu() -> CpuDescriptor {
        let desc = CpuDescriptor::new(0, TopologyFact::default());
        desc.set_is_lwk(true);
        desc
    }

    #[test]
    fn yield_alone_at_slot_does_not_rotate() {
        let cpu = make_cpu();
        let mut entities = EntityTable::new();
        let id = entities.insert(SchedEntity::new(1, 1, ThreadType::Normal));
        enqueue(&cpu, &mut entities, id, false);
        assert_eq!(pick_next(&cpu), Some(id));
        yield_task(&cpu, &entities, id);
        assert_eq!(pick_next(&cpu), Some(id));
    }

    #[test]
    fn yield_with_sibling_rotates_to_tail() {
        let cpu = make_cpu();
        let mut entities = EntityTable::new();
        let a = entities.insert(SchedEntity::new(1, 1, ThreadType::Normal));
        let b = entities.insert(SchedEntity::new(2, 2, ThreadType::Normal));
        enqueue(&cpu, &mut entities, a, false);
        enqueue(&cpu, &mut entities, b, false);
        assert_eq!(pick_next(&cpu), Some(a));
        yield_task(&cpu, &entities, a);
        assert_eq!(pick_next(&cpu), Some(b));
    }

    #[test]
    fn enqueue_then_dequeue_round_trips_queue_slot() {
        let cpu = make_cpu();
        let mut entities = EntityTable::new();
        let id = entities.insert(SchedEntity::new(1, 1, ThreadType::Normal));
        enqueue(&cpu, &mut entities, id, false);
        assert!(entities.get(id).queue_slot.is_some());
        assert!(dequeue(&cpu, &mut entities, id));
        assert!(entities.get(id).queue_slot.is_none());
    }

    #[test]
    fn tick_reloads_and_requeues_when_not_alone() {
        let cpu = make_cpu();
        let mut entities = EntityTable::new();
        let a = entities.insert(SchedEntity::new(1, 1, ThreadType::Normal));
        let b = entities.insert(SchedEntity::new(2, 2, ThreadType::Normal));
        entities.get_mut(a).policy = HostPolicy::RoundRobin;
        entities.get_mut(a).slice_remaining = 1;
        entities.get_mut(a).slice_reload = 4;
        enqueue(&cpu, &mut entities, a, false);
        enqueue(&cpu, &mut entities, b, false);

        let mut process = ProcessRecord::new(1, CpuSet::all(), alloc::vec![0]);
        process.policy.enable_rr = 1;

        let outcome = tick(&process, &cpu, &mut entities, a);
        assert!(outcome.requeued);
        assert!(outcome.reschedule);
        assert_eq!(entities.get(a).slice_remaining, 4);
    }

    struct NoopHost;
    impl HostScheduler for NoopHost {
        fn transfer_to_host(&mut self, _pid: Pid, _class: HostClass, _policy: HostPolicy, _nice: i8) {}
    }

    #[test]
    fn assimilate_foreign_fair_task_becomes_guest() {
        let mut entities = EntityTable::new();
        let stats = CpuStats::default();
        let mut host = NoopHost;
        let id = entities.insert(SchedEntity::new(5, 5, ThreadType::Normal));
        let action = assimilate_task(&mut entities, id, true, false, Some(HostClass::Fair), 0, &stats, &mut host);
        assert_eq!(action, AssimilationAction::Guest);
        assert_eq!(entities.get(id).thread_type, ThreadType::Guest);
        assert!(entities.get(id).assimilated);
        assert_eq!(stats.guests.load(core::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn give_back_restores_on_non_lwk_cpu() {
        let mut entities = EntityTable::new();
        let stats = CpuStats::default();
        let mut host = NoopHost;
        let id = entities.insert(SchedEntity::new(5, 5, ThreadType::Guest));
        entities.get_mut(id).assimilated = true;
        entities.get_mut(id).orig = Some(OrigScheduling {
            class: HostClass::Fair,
            policy: HostPolicy::Other,
            nice: 0,
        });
        let action = assimilate_task(&mut entities, id, false, false, None, 0, &stats, &mut host);
        assert_eq!(action, AssimilationAction::GiveBack);
        assert!(!entities.get(id).assimilated);
        assert_eq!(stats.givebacks.load(core::sync::atomic::Ordering::Relaxed), 1);
    }
}
