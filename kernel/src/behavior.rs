//! Behaviour transfer: translating a clone-hint behaviour word into either
//! an LWK priority-band adjustment or a full handoff to the host's fair
//! class.

use crate::entity::{EntityId, EntityTable};
use crate::hints::BehaviourFlags;
use crate::host::{HostClass, HostPolicy, HostScheduler};
use crate::process::Pid;
use crate::queue::{DEFAULT_RT_LEVEL, NUM_RT_LEVELS};

/// Real-time level a HIGH_PRIO utility thread runs at.
pub const HIGH_PRIO_LEVEL: u8 = 1;
/// Real-time level a LOW_PRIO utility thread runs at.
pub const LOW_PRIO_LEVEL: u8 = (NUM_RT_LEVELS - 2) as u8;

/// Adjust `entity`'s LWK-internal scheduling band per `behaviour`. Applies
/// only while the entity stays on an LWK CPU; a later transfer to the host
/// scheduler supersedes this.
pub fn adjust_util_behaviour(entities: &mut EntityTable, entity_id: EntityId, behaviour: BehaviourFlags) {
    let entity = entities.get_mut(entity_id);
    if behaviour.contains(BehaviourFlags::HIGH_PRIO) {
        entity.rt_level = HIGH_PRIO_LEVEL;
    } else if behaviour.contains(BehaviourFlags::LOW_PRIO) {
        entity.rt_level = LOW_PRIO_LEVEL;
    } else {
        entity.rt_level = DEFAULT_RT_LEVEL;
    }
    if behaviour.contains(BehaviourFlags::NON_COOP) {
        entity.force_round_robin = true;
    }
}

/// Nice value the host's fair class uses for a transferred task, derived
/// from its behaviour word.
fn nice_for(behaviour: BehaviourFlags) -> i8 {
    if behaviour.contains(BehaviourFlags::HIGH_PRIO) {
        -20
    } else if behaviour.contains(BehaviourFlags::LOW_PRIO) {
        19
    } else {
        -10
    }
}

/// Reassign `entity` from the LWK adapter to the host's fair class. All
/// subsequent scheduling of that task happens outside this core.
pub fn move_to_host_scheduler(
    entities: &EntityTable,
    entity_id: EntityId,
    behaviour: BehaviourFlags,
    host: &mut dyn HostScheduler,
) {
    let pid: Pid = entities.get(entity_id).pid;
    host.transfer_to_host(pid, HostClass::Fair, HostPolicy::Other, nice_for(behaviour));
}
