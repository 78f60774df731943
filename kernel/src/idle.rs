//! The per-CPU cooperative idle loop.
//!
//! The loop body is pure policy (which hint word, whether hardware
//! extensions apply); the actual interrupt, monitor/mwait, halt, and RCU
//! primitives are supplied by the host through `IdleHooks` so this module
//! stays architecture-neutral and testable with a fake.

use crate::cpu::CpuDescriptor;
use crate::entity::{EntityId, EntityTable, ThreadType};
use crate::host::LowPowerProvider;

/// Architecture primitives the idle loop drives. A real integration wires
/// this to `cli`/`sti`, `monitor`/`mwait` or `hlt`, and the RCU
/// quiescent-state markers; tests use a recording fake.
pub trait IdleHooks {
    fn disable_interrupts(&self);
    fn enable_interrupts(&self);
    fn monitor(&self, hint: u32);
    fn mwait(&self, hint: u32);
    fn halt(&self);
    /// Whether a reschedule has been requested since the last check.
    fn need_resched(&self) -> bool;
    fn enter_rcu_quiescent(&self);
    fn exit_rcu_quiescent(&self);
}

/// One iteration of the idle loop for `cpu`. Returns `false` once
/// `is_lwk` has flipped off, at which point the caller should stop
/// looping and let the idle entity exit.
pub fn idle_step(cpu: &CpuDescriptor, power: &dyn LowPowerProvider, hooks: &dyn IdleHooks) -> bool {
    if !cpu.is_lwk() {
        return false;
    }

    hooks.disable_interrupts();
    hooks.enter_rcu_quiescent();

    let hints = power.hints_for(cpu.id);
    let owned = cpu.owner_pid() != 0;
    let hint = if owned { hints.shallow } else { hints.deep };

    if hints.has_monitor_mwait {
        hooks.monitor(hint);
        if !hooks.need_resched() {
            hooks.mwait(hint);
        }
    } else {
        hooks.halt();
    }

    hooks.exit_rcu_quiescent();
    hooks.enable_interrupts();
    true
}

/// Run the idle loop for `cpu` until `is_lwk` flips off, then mark the
/// idle entity `ThreadType::Guest` so it can be torn down like any other
/// task.
pub fn run_idle_loop(
    cpu: &CpuDescriptor,
    power: &dyn LowPowerProvider,
    hooks: &dyn IdleHooks,
    entities: &mut EntityTable,
    idle_id: EntityId,
) {
    while idle_step(cpu, power, hooks) {}
    entities.get_mut(idle_id).thread_type = ThreadType::Guest;
}
