//! Boot/yod configuration-channel key parsing (§6).
//!
//! Parsing the configuration blob itself — reading it off disk or a boot
//! protocol, splitting it into key/value pairs — is the host's job. This
//! module only validates and applies already-split pairs, leaving the
//! existing policy knob untouched on any rejection.

use crate::error::SchedError;
use crate::process::{AllowedCpusPerUtil, OvercommitBehaviour, ProcessPolicy};

/// Milliseconds per scheduling tick; `enable-rr` values below this are
/// rejected rather than silently rounded to zero.
const TICK_MS: u32 = 4;

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "0" | "false" => Some(false),
        "1" | "true" => Some(true),
        _ => None,
    }
}

/// Apply one `key = value` pair from the boot/yod channel to `policy`.
/// Unchanged on error; the rejection is logged at the point of detection.
pub fn apply(policy: &mut ProcessPolicy, key: &str, value: &str) -> Result<(), SchedError> {
    let result = apply_inner(policy, key, value);
    if let Err(err) = result {
        log::warn!("rejecting boot/yod config '{key}' = '{value}': {err}");
    }
    result
}

fn apply_inner(policy: &mut ProcessPolicy, key: &str, value: &str) -> Result<(), SchedError> {
    match key {
        "move-syscalls-disable" => {
            let flag = parse_bool(value).ok_or(SchedError::ConfigInvalid {
                key: "move-syscalls-disable",
            })?;
            policy.move_syscalls_disable = flag;
        }
        "enable-rr" => {
            let ms: u32 = value
                .parse()
                .map_err(|_| SchedError::ConfigInvalid { key: "enable-rr" })?;
            let ticks = ms / TICK_MS;
            if ticks < 1 {
                return Err(SchedError::ConfigInvalid { key: "enable-rr" });
            }
            policy.enable_rr = ticks;
        }
        "disable-setaffinity" => {
            let errno: i32 = value.parse().map_err(|_| SchedError::ConfigInvalid {
                key: "disable-setaffinity",
            })?;
            if errno < 0 {
                return Err(SchedError::ConfigInvalid {
                    key: "disable-setaffinity",
                });
            }
            policy.disable_setaffinity = errno;
        }
        "stats-level" => {
            let level: u32 = value
                .parse()
                .map_err(|_| SchedError::ConfigInvalid { key: "stats-level" })?;
            policy.stats_level = level;
        }
        "util-threshold" => {
            let (max_cpus_str, max_per_cpu_str) =
                value.split_once(':').ok_or(SchedError::ConfigInvalid {
                    key: "util-threshold",
                })?;
            let max_cpus: u32 = max_cpus_str.parse().map_err(|_| SchedError::ConfigInvalid {
                key: "util-threshold",
            })?;
            let max_per_cpu: u32 = max_per_cpu_str
                .parse()
                .map_err(|_| SchedError::ConfigInvalid {
                    key: "util-threshold",
                })?;
            policy.max_cpus_for_util = max_cpus;
            policy.max_util_threads_per_cpu = max_per_cpu;
        }
        "overcommit-behaviour" => {
            policy.overcommit_behaviour = match value {
                "all" => OvercommitBehaviour::AllCommits,
                "compute" => OvercommitBehaviour::OnlyCompute,
                "utility" => OvercommitBehaviour::OnlyUtility,
                _ => {
                    return Err(SchedError::ConfigInvalid {
                        key: "overcommit-behaviour",
                    })
                }
            };
        }
        "one-cpu-per-util" => {
            let flag = parse_bool(value).ok_or(SchedError::ConfigInvalid {
                key: "one-cpu-per-util",
            })?;
            policy.allowed_cpus_per_util = if flag {
                AllowedCpusPerUtil::One
            } else {
                AllowedCpusPerUtil::Multiple
            };
        }
        _ => return Err(SchedError::ConfigInvalid { key: "unknown" }),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_rr_below_one_tick_is_rejected() {
        let mut policy = ProcessPolicy::default();
        let before = policy.enable_rr;
        assert!(apply(&mut policy, "enable-rr", "1").is_err());
        assert_eq!(policy.enable_rr, before);
    }

    #[test]
    fn enable_rr_converts_ms_to_ticks() {
        let mut policy = ProcessPolicy::default();
        apply(&mut policy, "enable-rr", "20").unwrap();
        assert_eq!(policy.enable_rr, 5);
    }

    #[test]
    fn util_threshold_splits_pair() {
        let mut policy = ProcessPolicy::default();
        apply(&mut policy, "util-threshold", "4:2").unwrap();
        assert_eq!(policy.max_cpus_for_util, 4);
        assert_eq!(policy.max_util_threads_per_cpu, 2);
    }

    #[test]
    fn malformed_util_threshold_rejected() {
        let mut policy = ProcessPolicy::default();
        assert!(apply(&mut policy, "util-threshold", "garbage").is_err());
    }

    #[test]
    fn negative_errno_rejected() {
        let mut policy = ProcessPolicy::default();
        assert!(apply(&mut policy, "disable-setaffinity", "-1").is_err());
    }

    #[test]
    fn overcommit_behaviour_accepts_known_values() {
        let mut policy = ProcessPolicy::default();
        apply(&mut policy, "overcommit-behaviour", "compute").unwrap();
        assert_eq!(policy.overcommit_behaviour, OvercommitBehaviour::OnlyCompute);
        assert!(apply(&mut policy, "overcommit-behaviour", "nonsense").is_err());
    }

    #[test]
    fn unknown_key_rejected() {
        let mut policy = ProcessPolicy::default();
        assert!(apply(&mut policy, "made-up-key", "1").is_err());
    }
}
