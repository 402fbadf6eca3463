// safety-service-rs/src/classifier.rs
// Declared safety level + session policy -> gate decision

use std::fmt;

use serde::{Deserialize, Serialize};
use shared_types::SafetyLevel;

/// Session policy the gate is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyPolicy {
    pub safety_mode_enabled: bool,
    pub is_remote_origin: bool,
}

impl SafetyPolicy {
    pub fn local(safety_mode_enabled: bool) -> Self {
        Self {
            safety_mode_enabled,
            is_remote_origin: false,
        }
    }

    pub fn remote(safety_mode_enabled: bool) -> Self {
        Self {
            safety_mode_enabled,
            is_remote_origin: true,
        }
    }
}

/// Outcome of the gate for an interactive caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Reject,
    RequireConfirmation,
    Proceed,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject => write!(f, "reject"),
            Self::RequireConfirmation => write!(f, "require_confirmation"),
            Self::Proceed => write!(f, "proceed"),
        }
    }
}

/// Outcome of the gate for a caller that cannot be asked anything.
///
/// There is no confirmation variant: code holding an `UnattendedDecision`
/// has no way to reach an operator prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnattendedDecision {
    Reject,
    Proceed,
}

impl From<UnattendedDecision> for Decision {
    fn from(decision: UnattendedDecision) -> Self {
        match decision {
            UnattendedDecision::Reject => Decision::Reject,
            UnattendedDecision::Proceed => Decision::Proceed,
        }
    }
}

/// Decide whether a command with the given declared level may run.
///
/// BLOCKED is always rejected. DANGEROUS needs confirmation only when safety
/// mode is on and the request is local; remote requests cannot be confirmed
/// and proceed.
pub fn decide(level: SafetyLevel, policy: SafetyPolicy) -> Decision {
    match level {
        SafetyLevel::Blocked => Decision::Reject,
        SafetyLevel::Dangerous if policy.safety_mode_enabled && !policy.is_remote_origin => {
            Decision::RequireConfirmation
        }
        SafetyLevel::Dangerous | SafetyLevel::Safe | SafetyLevel::Caution => Decision::Proceed,
    }
}

/// Gate used by the remote path. Agrees with [`decide`] for every policy
/// with `is_remote_origin == true`.
pub fn decide_unattended(level: SafetyLevel) -> UnattendedDecision {
    match level {
        SafetyLevel::Blocked => UnattendedDecision::Reject,
        SafetyLevel::Safe | SafetyLevel::Caution | SafetyLevel::Dangerous => {
            UnattendedDecision::Proceed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_policies() -> Vec<SafetyPolicy> {
        let mut policies = Vec::new();
        for safety_mode_enabled in [true, false] {
            for is_remote_origin in [true, false] {
                policies.push(SafetyPolicy {
                    safety_mode_enabled,
                    is_remote_origin,
                });
            }
        }
        policies
    }

    #[test]
    fn blocked_is_rejected_under_every_policy() {
        for policy in all_policies() {
            assert_eq!(decide(SafetyLevel::Blocked, policy), Decision::Reject, "{policy:?}");
        }
        assert_eq!(decide_unattended(SafetyLevel::Blocked), UnattendedDecision::Reject);
    }

    #[test]
    fn dangerous_local_with_safety_mode_needs_confirmation() {
        assert_eq!(
            decide(SafetyLevel::Dangerous, SafetyPolicy::local(true)),
            Decision::RequireConfirmation
        );
    }

    #[test]
    fn dangerous_remote_proceeds_even_with_safety_mode() {
        assert_eq!(
            decide(SafetyLevel::Dangerous, SafetyPolicy::remote(true)),
            Decision::Proceed
        );
        assert_eq!(
            decide(SafetyLevel::Dangerous, SafetyPolicy::remote(false)),
            Decision::Proceed
        );
    }

    #[test]
    fn dangerous_local_without_safety_mode_proceeds() {
        assert_eq!(
            decide(SafetyLevel::Dangerous, SafetyPolicy::local(false)),
            Decision::Proceed
        );
    }

    #[test]
    fn safe_and_caution_always_proceed() {
        for level in [SafetyLevel::Safe, SafetyLevel::Caution] {
            for policy in all_policies() {
                assert_eq!(decide(level, policy), Decision::Proceed);
            }
        }
    }

    #[test]
    fn unattended_gate_matches_remote_policy() {
        for level in SafetyLevel::ALL {
            for safety_mode_enabled in [true, false] {
                let expected = decide(level, SafetyPolicy::remote(safety_mode_enabled));
                assert_eq!(Decision::from(decide_unattended(level)), expected, "{level}");
            }
        }
    }

    #[test]
    fn decisions_are_deterministic() {
        for level in SafetyLevel::ALL {
            for policy in all_policies() {
                assert_eq!(decide(level, policy), decide(level, policy));
            }
        }
    }
}
