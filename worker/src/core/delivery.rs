//! Post-execution delivery classification.
//!
//! The verifier observes the repository once the agent exits and maps that
//! observation to one of a handful of states. Keeping the mapping pure lets
//! the table be tested without a repository.

use std::fmt;

/// Why the agent is being resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// Work was left uncommitted on the default branch.
    IncompleteDelivery,
    /// A feature branch exists but no change request is open for it.
    NoPr,
    Generic,
}

impl RecoveryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryReason::IncompleteDelivery => "incomplete_delivery",
            RecoveryReason::NoPr => "no_pr",
            RecoveryReason::Generic => "generic",
        }
    }
}

impl fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repository state sampled right after the agent exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoObservation {
    /// Currently checked-out branch.
    pub branch: String,
    /// True if `branch` is the default branch.
    pub on_default_branch: bool,
    /// True if HEAD is still the claim commit.
    pub head_is_claim_commit: bool,
    /// True if there are uncommitted or untracked changes.
    pub has_local_changes: bool,
}

/// Classification of an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    /// Agent succeeded but left its work uncommitted on the default branch.
    IncompleteDelivery,
    /// Agent succeeded and changed nothing at all.
    NoWorkProduced,
    /// Default branch with anything else going on; plain terminal update.
    Standard,
    /// Agent moved to a feature branch.
    FeatureBranch { branch: String },
}

/// Map an observation plus the agent's success flag to a delivery state.
pub fn classify(observation: &RepoObservation, exit_success: bool) -> DeliveryState {
    if !observation.on_default_branch {
        return DeliveryState::FeatureBranch {
            branch: observation.branch.clone(),
        };
    }
    if observation.head_is_claim_commit && exit_success {
        if observation.has_local_changes {
            return DeliveryState::IncompleteDelivery;
        }
        return DeliveryState::NoWorkProduced;
    }
    DeliveryState::Standard
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on_default(head_is_claim_commit: bool, has_local_changes: bool) -> RepoObservation {
        RepoObservation {
            branch: "main".to_string(),
            on_default_branch: true,
            head_is_claim_commit,
            has_local_changes,
        }
    }

    #[test]
    fn uncommitted_work_after_success_is_incomplete_delivery() {
        assert_eq!(
            classify(&on_default(true, true), true),
            DeliveryState::IncompleteDelivery
        );
    }

    #[test]
    fn clean_tree_after_success_is_no_work() {
        assert_eq!(
            classify(&on_default(true, false), true),
            DeliveryState::NoWorkProduced
        );
    }

    #[test]
    fn failed_exit_on_default_branch_is_standard() {
        assert_eq!(classify(&on_default(true, true), false), DeliveryState::Standard);
        assert_eq!(classify(&on_default(true, false), false), DeliveryState::Standard);
    }

    #[test]
    fn new_commits_on_default_branch_are_standard() {
        assert_eq!(classify(&on_default(false, true), true), DeliveryState::Standard);
        assert_eq!(classify(&on_default(false, false), true), DeliveryState::Standard);
    }

    #[test]
    fn feature_branch_wins_regardless_of_exit() {
        let observation = RepoObservation {
            branch: "feature/abc123".to_string(),
            on_default_branch: false,
            head_is_claim_commit: false,
            has_local_changes: true,
        };
        for success in [true, false] {
            assert_eq!(
                classify(&observation, success),
                DeliveryState::FeatureBranch {
                    branch: "feature/abc123".to_string()
                }
            );
        }
    }
}
