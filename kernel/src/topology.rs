//! Topology facts and the match/relaxation machinery the placement engine
//! walks against them.

use crate::cpu::{CpuId, CpuSet};

/// Immutable per-CPU topology record, sourced once from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TopologyFact {
    pub numa_id: u32,
    pub core_id: u32,
    pub l1c_id: u32,
    pub l2c_id: u32,
    pub l3c_id: u32,
    pub thread_index: u32,
}

/// A topology match request: a kind paired with the id (or node set) it is
/// evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    FirstAvailable,
    SameCore,
    SameL1,
    SameL2,
    SameL3,
    SameNuma,
    OtherCore,
    OtherL1,
    OtherL2,
    OtherL3,
    OtherNuma,
    InNodeSet,
}

impl MatchType {
    /// Whether `candidate` (at `candidate_cpu`) satisfies this request
    /// against the anchor topology `anchor`, given `id` for Same*/Other*
    /// matches or `node_set` for `InNodeSet`.
    pub fn matches(
        &self,
        candidate_cpu: CpuId,
        candidate: &TopologyFact,
        anchor: &TopologyFact,
        node_set: &CpuSet,
    ) -> bool {
        match self {
            MatchType::FirstAvailable => true,
            MatchType::SameCore => candidate.core_id == anchor.core_id,
            MatchType::SameL1 => candidate.l1c_id == anchor.l1c_id,
            MatchType::SameL2 => candidate.l2c_id == anchor.l2c_id,
            MatchType::SameL3 => candidate.l3c_id == anchor.l3c_id,
            MatchType::SameNuma => candidate.numa_id == anchor.numa_id,
            MatchType::OtherCore => candidate.core_id != anchor.core_id,
            MatchType::OtherL1 => candidate.l1c_id != anchor.l1c_id,
            MatchType::OtherL2 => candidate.l2c_id != anchor.l2c_id,
            MatchType::OtherL3 => candidate.l3c_id != anchor.l3c_id,
            MatchType::OtherNuma => candidate.numa_id != anchor.numa_id,
            MatchType::InNodeSet => node_set.contains(candidate_cpu),
        }
    }

    /// Widen a `Same*` request to the next-larger cache domain, finally to
    /// `FirstAvailable`. Returns `None` once already at `FirstAvailable`.
    pub fn widen(&self) -> Option<MatchType> {
        match self {
            MatchType::SameCore => Some(MatchType::SameL1),
            MatchType::SameL1 => Some(MatchType::SameL2),
            MatchType::SameL2 => Some(MatchType::SameL3),
            MatchType::SameL3 => Some(MatchType::SameNuma),
            MatchType::SameNuma => Some(MatchType::FirstAvailable),
            MatchType::InNodeSet => Some(MatchType::FirstAvailable),
            MatchType::FirstAvailable => None,
            // Other* narrows, it does not widen.
            _ => Some(MatchType::FirstAvailable),
        }
    }

    /// Narrow an `Other*` request: OtherNUMA/OtherCore -> OtherL3 ->
    /// OtherL2 -> OtherL1 -> FirstAvailable.
    pub fn narrow(&self) -> Option<MatchType> {
        match self {
            MatchType::OtherNuma | MatchType::OtherCore => Some(MatchType::OtherL3),
            MatchType::OtherL3 => Some(MatchType::OtherL2),
            MatchType::OtherL2 => Some(MatchType::OtherL1),
            MatchType::OtherL1 => Some(MatchType::FirstAvailable),
            MatchType::FirstAvailable => None,
            _ => Some(MatchType::FirstAvailable),
        }
    }

    /// Apply one relaxation step in the correct direction for this kind of
    /// request.
    pub fn relax(&self) -> Option<MatchType> {
        match self {
            MatchType::OtherCore
            | MatchType::OtherL1
            | MatchType::OtherL2
            | MatchType::OtherL3
            | MatchType::OtherNuma => self.narrow(),
            _ => self.widen(),
        }
    }

    pub fn is_first_available(&self) -> bool {
        matches!(self, MatchType::FirstAvailable)
    }
}
