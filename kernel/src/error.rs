//! Error types for the LWK scheduler core.
//!
//! Mirrors the validation/runtime-degradation split the core follows:
//! caller-facing validation failures propagate as `SchedError`, while
//! internal bookkeeping faults (counter underflow, an unrecognised task
//! landing on an LWK CPU) are folded into statistics and one-shot log
//! lines at the point of detection and never reach a `Result`.

use core::fmt;

/// Top-level error type returned by the fallible entry points of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "scheduler errors must be handled, not silently discarded"]
pub enum SchedError {
    /// A boot/yod configuration key was malformed or out of range.
    ConfigInvalid { key: &'static str },
    /// A user-space buffer passed to the clone-attribute call could not be
    /// read or written.
    UserFault,
    /// Conflicting placement or behaviour bits were requested together.
    AttrConflict { reason: &'static str },
    /// A CPU mask or kernel-thread allocation failed.
    AllocFail,
    /// Behaviour bits outside the acceptable set were requested.
    BehaviourUnacceptable,
}

pub type SchedResult<T> = Result<T, SchedError>;

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigInvalid { key } => write!(f, "invalid configuration for '{key}'"),
            Self::UserFault => write!(f, "invalid user-space buffer"),
            Self::AttrConflict { reason } => write!(f, "conflicting clone attributes: {reason}"),
            Self::AllocFail => write!(f, "allocation failed"),
            Self::BehaviourUnacceptable => write!(f, "unacceptable behaviour bits"),
        }
    }
}

impl core::error::Error for SchedError {}

/// Outcome a placement attempt records into the caller's clone-hint
/// writeback record. Distinct from `SchedError`: a rejected placement still
/// runs the task, it just lost the race for its preferred topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementOutcome {
    Requested,
    Accepted,
    Rejected,
}

/// A one-shot flag for diagnostics that must never spam the log. Each
/// distinct internal fault site owns one of these.
#[derive(Debug, Default)]
pub struct OneShotWarning {
    fired: core::sync::atomic::AtomicBool,
}

impl OneShotWarning {
    pub const fn new() -> Self {
        Self {
            fired: core::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Emit `msg` through the log facade exactly once for this site.
    pub fn warn_once(&self, msg: &str) {
        use core::sync::atomic::Ordering;
        if self
            .fired
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            log::warn!("{msg}");
        }
    }
}
