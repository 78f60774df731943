//! The placement engine: candidate search, topology relaxation, utility-
//! thread placement, exclusive reservation, and push-utility-threads
//! rebalancing.

use alloc::vec::Vec;

use crate::cpu::{CpuDescriptor, CpuId, CpuSet};
use crate::entity::{EntityId, EntityTable};
#[cfg(test)]
use crate::entity::ThreadType;
use crate::error::PlacementOutcome;
use crate::hints::{BehaviourFlags, CloneHints, PlacementFlags};
use crate::host::HostScheduler;
use crate::process::{AllowedCpusPerUtil, Pid, ProcessRecord};
use crate::topology::{MatchType, TopologyFact};

/// Bound on the utility-placement retry loop (P5).
pub const MAX_UTILITY_RETRIES: usize = 100;

/// Bundles the pieces placement needs without forcing a god struct: the
/// present CPUs, the entity arena, and the owning process record.
pub struct PlacementContext<'a> {
    pub cpus: &'a [CpuDescriptor],
    pub entities: &'a mut EntityTable,
    pub process: &'a ProcessRecord,
}

impl<'a> PlacementContext<'a> {
    fn topology(&self, cpu: CpuId) -> TopologyFact {
        self.cpus[cpu].topology
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    FullyUncommitted,
    UncommittedByCompute,
    LeastCommitted,
}

/// Compute-thread placement (`select_cpu_candidate`). Walks
/// `process.lwk_cpu_sequence`, returning the first CPU matching the
/// topology request, in preference order: entirely uncommitted, then
/// uncommitted-by-compute, then least-committed up to `limit`. A CPU with
/// a conflicting exclusive owner is skipped; when `exclusive_pid` is set,
/// a failed reservation CAS also skips the CPU.
pub fn select_cpu_candidate(
    ctx: &PlacementContext<'_>,
    allowed: &CpuSet,
    limit: u64,
    match_type: MatchType,
    anchor: TopologyFact,
    node_set: &CpuSet,
    reverse: bool,
    caller_pid: Pid,
    exclusive_pid: Option<Pid>,
) -> Option<CpuId> {
    let sequence: Vec<CpuId> = if reverse {
        ctx.process.lwk_cpu_sequence.iter().rev().copied().collect()
    } else {
        ctx.process.lwk_cpu_sequence.clone()
    };

    // Candidates still in play, in sequence order; we re-filter on every
    // pass since a CAS failure can remove one without disturbing the rest.
    let mut excluded: Vec<CpuId> = Vec::new();

    loop {
        let mut best: Option<(Tier, CpuId, u64)> = None;
        for &cpu in &sequence {
            if excluded.contains(&cpu) {
                continue;
            }
            let desc = &ctx.cpus[cpu];
            if !desc.is_lwk() || !allowed.contains(cpu) {
                continue;
            }
            let owner = desc.exclusive_owner();
            if owner != 0 && owner != caller_pid {
                continue;
            }
            if !match_type.matches(cpu, &desc.topology, &anchor, node_set) {
                continue;
            }
            let (compute, utility) = desc.commit.read_commits();
            let tier = if compute == 0 && utility == 0 {
                Tier::FullyUncommitted
            } else if compute == 0 {
                Tier::UncommittedByCompute
            } else if compute <= limit {
                Tier::LeastCommitted
            } else {
                continue;
            };

            let better = match &best {
                None => true,
                Some((best_tier, _, best_compute)) => {
                    tier_rank(tier) < tier_rank(*best_tier)
                        || (tier_rank(tier) == tier_rank(*best_tier) && compute < *best_compute)
                }
            };
            if better {
                best = Some((tier, cpu, compute));
            }
        }

        let Some((_, cpu, _)) = best else {
            return None;
        };

        if let Some(pid) = exclusive_pid {
            if !ctx.cpus[cpu].try_reserve_exclusive(pid) {
                excluded.push(cpu);
                continue;
            }
        }
        return Some(cpu);
    }
}

fn tier_rank(tier: Tier) -> u8 {
    match tier {
        Tier::FullyUncommitted => 0,
        Tier::UncommittedByCompute => 1,
        Tier::LeastCommitted => 2,
    }
}

/// Main-thread-home optimisation: if `entity_id` is the process's initial
/// thread, the first sequence CPU is allowed, and its compute-commits is
/// zero, return it immediately without running the general search.
pub fn main_thread_home(ctx: &PlacementContext<'_>, entity_id: EntityId) -> Option<CpuId> {
    let entity = ctx.entities.get(entity_id);
    if !entity.is_main_thread() {
        return None;
    }
    let first = *ctx.process.lwk_cpu_sequence.first()?;
    if !entity.allowed.contains(first) {
        return None;
    }
    let desc = &ctx.cpus[first];
    let (compute, _) = desc.commit.read_commits();
    if desc.is_lwk() && compute == 0 {
        Some(first)
    } else {
        None
    }
}

/// Derive the topology match request, anchor CPU, and node set the
/// placement word in `hints` implies.
fn derive_match(hints: &CloneHints, anchor_cpu: CpuId) -> (MatchType, CpuSet) {
    let placement = hints.placement;
    let match_type = if placement.contains(PlacementFlags::SAME_L1) {
        MatchType::SameL1
    } else if placement.contains(PlacementFlags::SAME_L2) {
        MatchType::SameL2
    } else if placement.contains(PlacementFlags::SAME_L3) {
        MatchType::SameL3
    } else if placement.contains(PlacementFlags::SAME_NUMA) {
        MatchType::SameNuma
    } else if placement.contains(PlacementFlags::USE_NODE_SET) {
        MatchType::InNodeSet
    } else {
        MatchType::FirstAvailable
    };
    let _ = anchor_cpu;
    (match_type, hints.node_set)
}

/// Resolve the topology anchor for a utility-thread placement request
/// (§4.3 step 1): the CPU the spawning thread (`caller_id`) currently runs
/// on, or the group's remembered anchor when a grouping key is present.
pub fn resolve_anchor(ctx: &mut PlacementContext<'_>, caller_id: EntityId, hints: &CloneHints) -> CpuId {
    if let Some(key) = hints.key {
        match ctx.process.groups.lookup_or_reserve(key) {
            Some(crate::group_registry::Lookup::Found { anchor }) => return anchor,
            Some(crate::group_registry::Lookup::NotFound { pending }) => {
                let anchor = ctx
                    .entities
                    .get(caller_id)
                    .cpu_home
                    .unwrap_or_else(|| fallback_anchor(ctx));
                pending.write(key, anchor);
                return anchor;
            }
            None => {
                // Table full: degrade to the caller's own anchor.
            }
        }
    }
    ctx.entities
        .get(caller_id)
        .cpu_home
        .unwrap_or_else(|| fallback_anchor(ctx))
}

/// The degraded anchor used when the caller has no `cpu_home` yet (it has
/// not itself been placed). Warned once, since a hot fork loop hitting this
/// path repeatedly would otherwise flood the log.
fn fallback_anchor(ctx: &PlacementContext<'_>) -> CpuId {
    let cpu = first_lwk_cpu(ctx);
    ctx.cpus[cpu]
        .no_anchor_warning
        .warn_once("no caller cpu_home for anchor resolution, falling back to first LWK CPU");
    cpu
}

fn first_lwk_cpu(ctx: &PlacementContext<'_>) -> CpuId {
    ctx.process
        .lwk_cpu_sequence
        .iter()
        .copied()
        .find(|&c| ctx.cpus[c].is_lwk())
        .unwrap_or(0)
}

/// Outcome of a utility-thread placement attempt.
pub struct UtilityPlacement {
    pub cpu: CpuId,
    pub on_lwk: bool,
    pub outcome: PlacementOutcome,
}

/// Utility-thread placement (§4.3). Drives the bounded retry loop over the
/// LWK and host utility-CPU searches, applying behaviour adjustments and
/// linking the moveable-utility list on success. `caller_id` is the thread
/// performing the clone, whose current CPU anchors the topology search;
/// `entity_id` is the new thread being placed.
pub fn place_utility_thread(
    ctx: &mut PlacementContext<'_>,
    caller_id: EntityId,
    entity_id: EntityId,
    hints: &CloneHints,
    host: &mut dyn HostScheduler,
) -> UtilityPlacement {
    let entity_pid = ctx.entities.get(entity_id).pid;
    let anchor_cpu = resolve_anchor(ctx, caller_id, hints);
    let anchor_topology = ctx.topology(anchor_cpu);
    let (mut match_type, node_set) = derive_match(hints, anchor_cpu);

    let exclusive = hints.behaviour.contains(BehaviourFlags::EXCLUSIVE);
    let mut limit: u64 = 0;
    if hints.placement.contains(PlacementFlags::USE_NODE_SET) {
        ctx.entities.get_mut(entity_id).requested_node_set = node_set;
    }

    let lwk_only = hints.placement.contains(PlacementFlags::LWK_ONLY);
    let host_only = hints.placement.contains(PlacementFlags::HOST_ONLY);

    for _ in 0..MAX_UTILITY_RETRIES {
        if !host_only {
            let allowed = ctx.entities.get(entity_id).allowed;
            let exclusive_pid = exclusive.then_some(entity_pid);
            if let Some(cpu) = select_cpu_candidate(
                ctx,
                &allowed,
                limit,
                match_type,
                anchor_topology,
                &node_set,
                false,
                entity_pid,
                exclusive_pid,
            ) {
                ctx.entities.get_mut(entity_id).allowed = CpuSet::single(cpu);
                crate::behavior::adjust_util_behaviour(ctx.entities, entity_id, hints.behaviour);
                commit_entity(ctx, entity_id, cpu);
                link_if_moveable(ctx, entity_id, exclusive, hints);
                publish_accepted_hints(ctx, entity_id, hints, PlacementOutcome::Accepted);
                return UtilityPlacement {
                    cpu,
                    on_lwk: true,
                    outcome: PlacementOutcome::Accepted,
                };
            }
        }

        if !lwk_only {
            if let Some(cpu) = search_utility_cpus(ctx, match_type, anchor_topology, &node_set) {
                ctx.entities.get_mut(entity_id).allowed = CpuSet::single(cpu);
                commit_entity(ctx, entity_id, cpu);
                publish_accepted_hints(ctx, entity_id, hints, PlacementOutcome::Accepted);
                crate::behavior::move_to_host_scheduler(ctx.entities, entity_id, hints.behaviour, host);
                return UtilityPlacement {
                    cpu,
                    on_lwk: false,
                    outcome: PlacementOutcome::Accepted,
                };
            }
        }

        if match_type.is_first_available() && lwk_only {
            let bound = ctx.process.effective_util_cpu_limit() as u64;
            if limit < bound {
                limit += 1;
                continue;
            } else {
                break;
            }
        }

        match match_type.relax() {
            Some(next) => match_type = next,
            None => break,
        }
    }

    // P6 / PlacementUnsatisfiable: place on FirstAvailable, mark rejected.
    let allowed = ctx.entities.get(entity_id).allowed;
    let cpu = select_cpu_candidate(
        ctx,
        &allowed,
        u64::MAX,
        MatchType::FirstAvailable,
        anchor_topology,
        &node_set,
        false,
        entity_pid,
        None,
    )
    .unwrap_or(anchor_cpu);
    commit_entity(ctx, entity_id, cpu);
    publish_accepted_hints(ctx, entity_id, hints, PlacementOutcome::Rejected);
    UtilityPlacement {
        cpu,
        on_lwk: ctx.cpus[cpu].is_lwk(),
        outcome: PlacementOutcome::Rejected,
    }
}

/// §4.3 step 4: publish the behaviour/placement hints that actually drove
/// this placement, and its accept/reject outcome, for user space to read
/// back and for push-rebalancing to re-derive behaviour on a later move.
fn publish_accepted_hints(
    ctx: &mut PlacementContext<'_>,
    entity_id: EntityId,
    hints: &CloneHints,
    outcome: PlacementOutcome,
) {
    let entity = ctx.entities.get_mut(entity_id);
    entity.accepted_hints.behaviour = hints.behaviour;
    entity.accepted_hints.placement = hints.placement;
    entity.accepted_hints.outcome = Some(outcome);
}

fn search_utility_cpus(
    ctx: &PlacementContext<'_>,
    match_type: MatchType,
    anchor: TopologyFact,
    node_set: &CpuSet,
) -> Option<CpuId> {
    match ctx.process.policy.allowed_cpus_per_util {
        AllowedCpusPerUtil::Multiple => ctx
            .process
            .utility_cpus
            .iter()
            .find(|&cpu| match_type.matches(cpu, &ctx.cpus[cpu].topology, &anchor, node_set)),
        AllowedCpusPerUtil::One => {
            let mut level = 0u64;
            loop {
                if let Some(cpu) = ctx.process.utility_cpus.iter().find(|&cpu| {
                    match_type.matches(cpu, &ctx.cpus[cpu].topology, &anchor, node_set)
                        && ctx.cpus[cpu].commit.read_commits().1 == level
                }) {
                    return Some(cpu);
                }
                level += 1;
                if level as u32 > ctx.process.utility_cpus.len() {
                    return None;
                }
            }
        }
    }
}

fn commit_entity(ctx: &mut PlacementContext<'_>, entity_id: EntityId, cpu: CpuId) {
    let desc = &ctx.cpus[cpu];
    desc.commit.commit(ctx.entities, entity_id, cpu, &desc.stats);
}

fn link_if_moveable(
    ctx: &mut PlacementContext<'_>,
    entity_id: EntityId,
    exclusive: bool,
    hints: &CloneHints,
) {
    let explicit_placement = !hints.placement.is_empty();
    if !exclusive && !explicit_placement {
        ctx.process.link_moveable(entity_id);
        ctx.entities.get_mut(entity_id).moveable_linked = true;
    }
}

/// Push-utility-threads rebalancing. Invoked when forking a new compute
/// thread finds no uncommitted LWK CPU. Relocates moveable utility threads
/// to host CPUs until one becomes free or the list empties.
pub fn push_utility_rebalance(ctx: &mut PlacementContext<'_>, host: &mut dyn HostScheduler) {
    while !any_uncommitted_lwk_cpu(ctx) && !ctx.process.moveable_is_empty() {
        let Some(victim) = ctx.process.pop_moveable() else {
            break;
        };
        let origin = ctx.entities.get(victim).cpu_home;
        let victim_behaviour = ctx.entities.get(victim).accepted_hints.behaviour;

        let node_set = ctx.entities.get(victim).requested_node_set;
        let mut mt = if node_set.is_empty() {
            MatchType::FirstAvailable
        } else {
            MatchType::InNodeSet
        };
        let anchor = origin.map(|c| ctx.cpus[c].topology).unwrap_or_default();
        let mut target = None;
        loop {
            if let Some(cpu) = search_utility_cpus(ctx, mt, anchor, &node_set) {
                target = Some(cpu);
                break;
            }
            match mt.relax() {
                Some(next) => mt = next,
                None => break,
            }
        }

        let Some(target_cpu) = target else {
            // Nothing to push to; put it back and give up this round.
            ctx.process.link_moveable(victim);
            break;
        };

        if let Some(origin_cpu) = origin {
            ctx.cpus[origin_cpu].commit.uncommit(ctx.entities, victim);
            ctx.cpus[origin_cpu]
                .stats
                .pushed
                .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        }
        ctx.entities.get_mut(victim).allowed = CpuSet::single(target_cpu);
        commit_entity(ctx, victim, target_cpu);
        ctx.entities.get_mut(victim).moveable_linked = false;
        crate::behavior::move_to_host_scheduler(ctx.entities, victim, victim_behaviour, host);
    }
}

fn any_uncommitted_lwk_cpu(ctx: &PlacementContext<'_>) -> bool {
    ctx.process.lwk_cpu_sequence.iter().any(|&cpu| {
        let desc = &ctx.cpus[cpu];
        desc.is_lwk() && desc.commit.read_commits() == (0, 0)
    })
}
