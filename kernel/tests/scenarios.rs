//! Integration tests exercising the literal scenarios against the public
//! crate API: a grouped concurrent utility placement, push-utility
//! rebalancing freeing a CPU for a new compute thread, clone-attribute
//! validation, and round-robin tick rotation.

use mosched::adapter::{self, SelectReason};
use mosched::cpu::{CpuDescriptor, CpuSet};
use mosched::entity::{EntityTable, SchedEntity, ThreadType};
use mosched::hints::{self, BehaviourFlags, CloneHints};
use mosched::host::{HostClass, HostPolicy, HostScheduler};
use mosched::placement::{self, PlacementContext};
use mosched::process::{Pid, ProcessRecord};
use mosched::topology::TopologyFact;

struct NoopHost;
impl HostScheduler for NoopHost {
    fn transfer_to_host(&mut self, _pid: Pid, _class: HostClass, _policy: HostPolicy, _nice: i8) {}
}

fn make_cpus(n: usize) -> std::vec::Vec<CpuDescriptor> {
    (0..n)
        .map(|i| {
            let desc = CpuDescriptor::new(i, TopologyFact::default());
            desc.set_is_lwk(true);
            desc
        })
        .collect()
}

/// S4: two concurrent utility-thread forks with the same grouping key and
/// no prior group entry create exactly one registry entry with refcount 2,
/// and both threads land on the same anchor CPU.
#[test]
fn s4_shared_grouping_key_converges_on_one_anchor() {
    let mut cpus = std::vec::Vec::new();
    for i in 0..4 {
        let l2 = if i < 2 { 0 } else { 1 };
        let topo = TopologyFact {
            l2c_id: l2,
            core_id: i as u32,
            ..Default::default()
        };
        let desc = CpuDescriptor::new(i, topo);
        desc.set_is_lwk(true);
        cpus.push(desc);
    }
    let mut entities = EntityTable::new();
    let process = ProcessRecord::new(100, CpuSet::from_mask(0b1111), std::vec![0, 1, 2, 3]);

    let caller = entities.insert(SchedEntity::new(100, 100, ThreadType::Normal));
    entities.get_mut(caller).cpu_home = Some(2);

    let key = core::num::NonZeroU64::new(42).unwrap();
    let hints = CloneHints {
        key: Some(key),
        placement: mosched::hints::PlacementFlags::SAME_L2,
        ..Default::default()
    };

    let first = entities.insert(SchedEntity::new(101, 100, ThreadType::Utility));
    let second = entities.insert(SchedEntity::new(102, 100, ThreadType::Utility));

    let mut host = NoopHost;
    let first_cpu = {
        let mut ctx = PlacementContext {
            cpus: &cpus,
            entities: &mut entities,
            process: &process,
        };
        placement::place_utility_thread(&mut ctx, caller, first, &hints, &mut host).cpu
    };
    let second_cpu = {
        let mut ctx = PlacementContext {
            cpus: &cpus,
            entities: &mut entities,
            process: &process,
        };
        placement::place_utility_thread(&mut ctx, caller, second, &hints, &mut host).cpu
    };

    // Both forks must resolve the same group anchor (CPU 2's L2 domain),
    // even though they land on different CPUs within it.
    let anchor_l2 = cpus[2].topology.l2c_id;
    assert_eq!(cpus[first_cpu].topology.l2c_id, anchor_l2);
    assert_eq!(cpus[second_cpu].topology.l2c_id, anchor_l2);
    assert_ne!(first_cpu, second_cpu);
    assert_eq!(process.groups.refcount(key), 2);
}

/// S5: both LWK CPUs {0,1} committed by utility threads with a non-empty
/// moveable list; a new compute thread forces at least one utility thread
/// off to a host CPU before it lands.
#[test]
fn s5_push_rebalance_frees_a_cpu_for_a_compute_thread() {
    // CPUs 0 and 1 are the LWK pair under test; CPU 2 is a host CPU
    // available to receive a pushed utility thread.
    let mut cpus = make_cpus(2);
    cpus.push(CpuDescriptor::new(2, TopologyFact::default()));
    let mut entities = EntityTable::new();
    let mut process = ProcessRecord::new(200, CpuSet::from_mask(0b11), std::vec![0, 1]);
    process.utility_cpus = CpuSet::single(2);

    let util_a = entities.insert(SchedEntity::new(201, 200, ThreadType::Utility));
    let util_b = entities.insert(SchedEntity::new(202, 200, ThreadType::Utility));
    {
        let desc = &cpus[0];
        desc.commit.commit(&mut entities, util_a, 0, &desc.stats);
    }
    {
        let desc = &cpus[1];
        desc.commit.commit(&mut entities, util_b, 1, &desc.stats);
    }
    process.link_moveable(util_a);
    process.link_moveable(util_b);

    let mut host = NoopHost;
    {
        let mut ctx = PlacementContext {
            cpus: &cpus,
            entities: &mut entities,
            process: &process,
        };
        placement::push_utility_rebalance(&mut ctx, &mut host);
    }

    assert!(
        cpus[0].stats.pushed.load(core::sync::atomic::Ordering::Relaxed) > 0
            || cpus[1].stats.pushed.load(core::sync::atomic::Ordering::Relaxed) > 0,
        "at least one origin CPU must record a push"
    );

    let freed = cpus[..2]
        .iter()
        .position(|c| c.commit.read_commits() == (0, 0));
    assert!(freed.is_some(), "pushing should free at least one LWK CPU");

    let compute = entities.insert(SchedEntity::new(203, 200, ThreadType::Normal));
    let ctx = PlacementContext {
        cpus: &cpus,
        entities: &mut entities,
        process: &process,
    };
    let chosen = placement::select_cpu_candidate(
        &ctx,
        &CpuSet::all(),
        0,
        mosched::topology::MatchType::FirstAvailable,
        TopologyFact::default(),
        &CpuSet::empty(),
        false,
        203,
        None,
    )
    .expect("freed CPU must be selectable");
    assert_eq!(chosen, freed.unwrap());
    drop(ctx);
    let desc = &cpus[chosen];
    desc.commit.commit(&mut entities, compute, chosen, &desc.stats);
    assert_eq!(cpus[chosen].commit.read_commits(), (1, 0));
}

/// S6: HIGH_PRIO and LOW_PRIO together are rejected outright with no
/// partial effect on the hint record itself.
#[test]
fn s6_conflicting_behaviour_bits_rejected() {
    let conflicting = CloneHints {
        behaviour: BehaviourFlags::HIGH_PRIO | BehaviourFlags::LOW_PRIO,
        ..Default::default()
    };
    assert!(hints::validate(&conflicting).is_err());
}

/// S7: with enable_rr = 100ms (config key, converted to ticks) and two
/// siblings at the same priority, the running task rotates to the tail
/// after its slice and a reschedule is requested.
#[test]
fn s7_round_robin_rotation_after_slice_exhaustion() {
    let cpu = {
        let desc = CpuDescriptor::new(0, TopologyFact::default());
        desc.set_is_lwk(true);
        desc
    };
    let mut entities = EntityTable::new();

    let mut policy = mosched::process::ProcessPolicy::default();
    mosched::config::apply(&mut policy, "enable-rr", "100").unwrap();
    assert!(policy.enable_rr >= 1);

    let mut process = ProcessRecord::new(1, CpuSet::single(0), std::vec![0]);
    process.policy = policy;

    let running = entities.insert(SchedEntity::new(10, 1, ThreadType::Normal));
    let sibling = entities.insert(SchedEntity::new(11, 1, ThreadType::Normal));
    entities.get_mut(running).policy = HostPolicy::RoundRobin;
    entities.get_mut(running).slice_remaining = 1;
    entities.get_mut(running).slice_reload = process.policy.enable_rr;
    entities.get_mut(sibling).policy = HostPolicy::RoundRobin;

    adapter::enqueue(&cpu, &mut entities, running, false);
    adapter::enqueue(&cpu, &mut entities, sibling, false);
    assert_eq!(adapter::pick_next(&cpu), Some(running));

    let outcome = adapter::tick(&process, &cpu, &mut entities, running);
    assert!(outcome.requeued);
    assert!(outcome.reschedule);
    assert_eq!(adapter::pick_next(&cpu), Some(sibling));
}

/// `select_task_rq` under `SelectReason::Wake` prefers a still-allowed
/// `cpu_home` over a fresh search.
#[test]
fn select_task_rq_wake_prefers_cpu_home() {
    let cpus = make_cpus(2);
    let mut entities = EntityTable::new();
    let process = ProcessRecord::new(1, CpuSet::all(), std::vec![0, 1]);
    let id = entities.insert(SchedEntity::new(1, 1, ThreadType::Normal));
    entities.get_mut(id).cpu_home = Some(1);

    let ctx = PlacementContext {
        cpus: &cpus,
        entities: &mut entities,
        process: &process,
    };
    let chosen = adapter::select_task_rq(&ctx, id, SelectReason::Wake, 0);
    assert_eq!(chosen, 1);
}
