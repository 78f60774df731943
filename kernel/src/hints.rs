//! The clone-hint channel: per-caller staging for the next thread
//! creation's desired placement and behaviour, consumed exactly once by
//! fork.

use crate::cpu::CpuSet;
use crate::entity::{EntityId, EntityTable};
use crate::error::{PlacementOutcome, SchedError};

bitflags::bitflags! {
    /// Control flags on the clone-attribute call itself.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CloneFlags: u32 {
        /// Wipe any staged hints instead of recording new ones.
        const CLEAR = 1 << 0;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BehaviourFlags: u32 {
        const EXCLUSIVE  = 1 << 0;
        const HIGH_PRIO  = 1 << 1;
        const LOW_PRIO   = 1 << 2;
        const NON_COOP   = 1 << 3;
        const UTILITY    = 1 << 4;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PlacementFlags: u32 {
        const SAME_L1          = 1 << 0;
        const SAME_L2          = 1 << 1;
        const SAME_L3          = 1 << 2;
        const SAME_NUMA        = 1 << 3;
        const DIFFERENT_EACH   = 1 << 4;
        const LWK_ONLY         = 1 << 5;
        const HOST_ONLY        = 1 << 6;
        const USE_NODE_SET     = 1 << 7;
        const FABRIC_INTERRUPT = 1 << 8;
    }
}

/// Staged, not-yet-consumed thread-creation hints.
#[derive(Debug, Clone, Default)]
pub struct CloneHints {
    pub flags: CloneFlags,
    pub behaviour: BehaviourFlags,
    pub placement: PlacementFlags,
    pub node_set: CpuSet,
    pub key: Option<core::num::NonZeroU64>,
}

/// Record of what a completed placement actually did with the hints that
/// drove it, written back for user space to inspect.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptedHints {
    pub behaviour: BehaviourFlags,
    pub placement: PlacementFlags,
    pub outcome: Option<PlacementOutcome>,
}

/// Validate a freshly staged `CloneHints` record per the clone-attribute
/// call's semantics. Does not touch the channel itself.
pub fn validate(hints: &CloneHints) -> Result<(), SchedError> {
    if hints
        .behaviour
        .contains(BehaviourFlags::HIGH_PRIO | BehaviourFlags::LOW_PRIO)
    {
        return Err(SchedError::AttrConflict {
            reason: "HIGH_PRIO and LOW_PRIO together",
        });
    }
    if hints.behaviour.contains(BehaviourFlags::EXCLUSIVE)
        && hints.placement.contains(PlacementFlags::HOST_ONLY)
    {
        return Err(SchedError::AttrConflict {
            reason: "EXCLUSIVE on a host-only placement",
        });
    }
    if hints
        .placement
        .contains(PlacementFlags::LWK_ONLY | PlacementFlags::HOST_ONLY)
    {
        return Err(SchedError::AttrConflict {
            reason: "LWK_ONLY and HOST_ONLY together",
        });
    }
    if hints.placement.contains(PlacementFlags::USE_NODE_SET) && hints.key.is_some() {
        return Err(SchedError::AttrConflict {
            reason: "node set and grouping key are mutually exclusive",
        });
    }
    if hints.placement.contains(PlacementFlags::USE_NODE_SET) && hints.node_set.is_empty() {
        return Err(SchedError::AttrConflict {
            reason: "USE_NODE_SET requires a non-empty node mask",
        });
    }
    Ok(())
}

/// The "set clone attributes" entry point (§6): validates `hints` and
/// stages them onto `entity_id`'s clone-hint channel for the next fork, or,
/// if `CLEAR` is set, wipes whatever is currently staged. Reading/writing
/// the actual user-space record (size check, the result pointer) is the
/// external collaborator's job; this only handles the already-decoded
/// record. On success, writes `Requested` into the result record ahead of
/// the fork that will resolve it to `Accepted`/`Rejected`.
pub fn set_clone_attributes(entities: &mut EntityTable, entity_id: EntityId, hints: CloneHints) -> Result<(), SchedError> {
    let entity = entities.get_mut(entity_id);
    if hints.flags.contains(CloneFlags::CLEAR) {
        entity.staged_hints = CloneHints::default();
        entity.accepted_hints = AcceptedHints::default();
        return Ok(());
    }
    validate(&hints)?;
    entity.accepted_hints = AcceptedHints {
        behaviour: hints.behaviour,
        placement: hints.placement,
        outcome: Some(PlacementOutcome::Requested),
    };
    entity.staged_hints = hints;
    Ok(())
}
