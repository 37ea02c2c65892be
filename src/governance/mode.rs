//! Governance mode state machine.
//!
//! A workspace runs in one of three modes. `detect_only` (the initial mode)
//! observes and reports; `propose` additionally stages proposals for manual
//! apply; `enforce` additionally auto-applies proposals flagged low-risk.
//! Upgrades require explicit operator action backed by clean observation
//! evidence; downgrades are always allowed. No upward transition is ever
//! automatic.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::MemError;

/// The three governance modes, ordered by capability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceMode {
    /// Observe and report only; no proposals, no applies.
    #[default]
    DetectOnly,
    /// Generate proposals; applies are manual.
    Propose,
    /// Additionally auto-apply low-risk proposals within budget.
    Enforce,
}

impl GovernanceMode {
    /// Whether the integrity engine may stage proposals.
    pub fn allows_proposals(&self) -> bool {
        matches!(self, GovernanceMode::Propose | GovernanceMode::Enforce)
    }

    /// Whether `apply_proposal` is permitted at all.
    pub fn allows_apply(&self) -> bool {
        matches!(self, GovernanceMode::Propose | GovernanceMode::Enforce)
    }

    /// Whether low-risk proposals may be applied without an operator.
    pub fn allows_auto_apply(&self) -> bool {
        matches!(self, GovernanceMode::Enforce)
    }

    /// Guard an operation behind a capability, producing the uniform error.
    pub fn require(&self, allowed: bool, operation: &str) -> Result<(), MemError> {
        if allowed {
            Ok(())
        } else {
            Err(MemError::ModeForbidden {
                mode: self.to_string(),
                operation: operation.to_string(),
            })
        }
    }
}

impl fmt::Display for GovernanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GovernanceMode::DetectOnly => "detect_only",
            GovernanceMode::Propose => "propose",
            GovernanceMode::Enforce => "enforce",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for GovernanceMode {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detect_only" => Ok(GovernanceMode::DetectOnly),
            "propose" => Ok(GovernanceMode::Propose),
            "enforce" => Ok(GovernanceMode::Enforce),
            _ => Err(MemError::CustomError(format!(
                "unknown governance mode `{s}`"
            ))),
        }
    }
}

/// Operator-supplied evidence backing an upgrade request.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanEvidence {
    /// Completed observation windows with no open findings.
    pub clean_windows: u32,
    /// Consecutive clean weeks.
    pub clean_weeks: u32,
}

/// Validate a requested transition. Downgrades are unconditional; upgrades
/// advance one step at a time and require the matching clean evidence.
pub fn check_transition(
    from: GovernanceMode,
    to: GovernanceMode,
    evidence: CleanEvidence,
) -> Result<(), MemError> {
    if to <= from {
        return Ok(());
    }
    let refused = |why: &str| {
        Err(MemError::ModeForbidden {
            mode: from.to_string(),
            operation: format!("transition to {to}: {why}"),
        })
    };
    match (from, to) {
        (GovernanceMode::DetectOnly, GovernanceMode::Propose) => {
            if evidence.clean_windows >= 1 {
                Ok(())
            } else {
                refused("requires at least one clean observation window")
            }
        }
        (GovernanceMode::Propose, GovernanceMode::Enforce) => {
            if evidence.clean_weeks >= 2 {
                Ok(())
            } else {
                refused("requires at least two clean weeks")
            }
        }
        _ => refused("modes must be upgraded one step at a time"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_per_mode() {
        assert!(!GovernanceMode::DetectOnly.allows_proposals());
        assert!(!GovernanceMode::DetectOnly.allows_apply());
        assert!(GovernanceMode::Propose.allows_proposals());
        assert!(GovernanceMode::Propose.allows_apply());
        assert!(!GovernanceMode::Propose.allows_auto_apply());
        assert!(GovernanceMode::Enforce.allows_auto_apply());
    }

    #[test]
    fn test_downgrade_always_allowed() {
        let evidence = CleanEvidence::default();
        assert!(
            check_transition(GovernanceMode::Enforce, GovernanceMode::DetectOnly, evidence)
                .is_ok()
        );
        assert!(
            check_transition(GovernanceMode::Propose, GovernanceMode::Propose, evidence).is_ok()
        );
    }

    #[test]
    fn test_upgrade_requires_evidence() {
        let none = CleanEvidence::default();
        assert!(
            check_transition(GovernanceMode::DetectOnly, GovernanceMode::Propose, none).is_err()
        );

        let one_window = CleanEvidence {
            clean_windows: 1,
            clean_weeks: 0,
        };
        assert!(
            check_transition(GovernanceMode::DetectOnly, GovernanceMode::Propose, one_window)
                .is_ok()
        );

        let one_week = CleanEvidence {
            clean_windows: 3,
            clean_weeks: 1,
        };
        assert!(
            check_transition(GovernanceMode::Propose, GovernanceMode::Enforce, one_week).is_err()
        );
        let two_weeks = CleanEvidence {
            clean_windows: 0,
            clean_weeks: 2,
        };
        assert!(
            check_transition(GovernanceMode::Propose, GovernanceMode::Enforce, two_weeks).is_ok()
        );
    }

    #[test]
    fn test_no_skipping_modes() {
        let plenty = CleanEvidence {
            clean_windows: 9,
            clean_weeks: 9,
        };
        assert!(
            check_transition(GovernanceMode::DetectOnly, GovernanceMode::Enforce, plenty)
                .is_err()
        );
    }

    #[test]
    fn test_serde_names() {
        let mode: GovernanceMode = serde_json::from_str("\"detect_only\"").unwrap();
        assert_eq!(mode, GovernanceMode::DetectOnly);
        assert_eq!(
            serde_json::to_string(&GovernanceMode::Enforce).unwrap(),
            "\"enforce\""
        );
    }
}
