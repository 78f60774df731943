//! Interfaces to collaborators the core consumes but does not own.
//!
//! Topology discovery, low-power instruction issue, and the host's own
//! task-control data structures live outside the core; it only ever talks
//! to them through these traits. Production integration supplies a
//! concrete implementation backed by real hardware probes; tests use a
//! deterministic fake.

use crate::cpu::CpuId;
use crate::topology::TopologyFact;

/// Supplies per-CPU topology facts, sourced once from the host at startup.
pub trait TopologyProvider {
    /// Number of present CPUs.
    fn num_cpus(&self) -> usize;

    /// Topology record for `cpu`. Panics if `cpu` is out of range — the
    /// core only ever queries CPUs it already knows are present.
    fn topology(&self, cpu: CpuId) -> TopologyFact;
}

/// Low-power hint words a CPU's idle driver may issue, and the capability
/// probe that supplies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LowPowerHints {
    /// Hint word used when the CPU still belongs to a running LWK process.
    pub shallow: u32,
    /// Hint word used when the CPU has no current owner.
    pub deep: u32,
    /// Whether monitor/mwait-equivalent instructions are available; if not,
    /// the idle driver falls back to a portable halt.
    pub has_monitor_mwait: bool,
}

pub trait LowPowerProvider {
    fn hints_for(&self, cpu: CpuId) -> LowPowerHints;
}

/// The host scheduler class an assimilated/guest task is transferred
/// to or restored from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostClass {
    Fair,
    RealTime,
    Deadline,
    Stop,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPolicy {
    Other,
    Fifo,
    RoundRobin,
    Batch,
}

/// The subset of host-scheduler control the core invokes when it transfers
/// a task back out of LWK scheduling (behaviour transfer, give-back,
/// process-creation fork path).
pub trait HostScheduler {
    /// Reassign `pid` to `class`/`policy` with the given nice value, outside
    /// the LWK adapter's control from that point on.
    fn transfer_to_host(&mut self, pid: crate::process::Pid, class: HostClass, policy: HostPolicy, nice: i8);
}
