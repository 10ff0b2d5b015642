//! Failure classification for the stored reason text.
//!
//! The stored `error_message` must tell a timeout apart from a crash, so the
//! agent exit is mapped to a [`FailureKind`] before anything is written.

use std::fmt;
use std::time::Duration;

use crate::exit_codes::AGENT_TIMEOUT;

/// Why a session could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The agent hit the wall-clock limit and was terminated.
    Timeout { limit: Option<Duration> },
    /// The agent exited with a non-zero code (or was killed by a signal).
    Crashed { exit_code: i32 },
    /// The agent exited 0 without changing anything.
    NoWorkProduced,
    /// Work was left undelivered and the recovery attempt did not fix it.
    RecoveryExhausted { detail: String },
    /// A branch was pushed but no change request could be opened.
    NoChangeRequest { branch: String },
    /// The worker itself failed while handling the session.
    WorkerError { detail: String },
}

impl FailureKind {
    /// Classify a non-successful agent exit.
    pub fn from_exit(exit_code: i32, timed_out: bool, limit: Option<Duration>) -> Self {
        if timed_out || exit_code == AGENT_TIMEOUT {
            FailureKind::Timeout { limit }
        } else {
            FailureKind::Crashed { exit_code }
        }
    }

    /// Short, stable label used in branch names and titles.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Timeout { .. } => "timeout",
            FailureKind::Crashed { .. } => "crashed",
            FailureKind::NoWorkProduced => "no-work",
            FailureKind::RecoveryExhausted { .. } => "recovery-exhausted",
            FailureKind::NoChangeRequest { .. } => "no-change-request",
            FailureKind::WorkerError { .. } => "worker-error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout { limit: Some(limit) } => write!(
                f,
                "agent timed out after {}s and was terminated",
                limit.as_secs()
            ),
            FailureKind::Timeout { limit: None } => {
                f.write_str("agent timed out and was terminated")
            }
            FailureKind::Crashed { exit_code } => {
                write!(f, "agent crashed with exit code {exit_code}")
            }
            FailureKind::NoWorkProduced => {
                f.write_str("agent exited successfully but produced no work")
            }
            FailureKind::RecoveryExhausted { detail } => {
                write!(f, "delivery incomplete after recovery attempt: {detail}")
            }
            FailureKind::NoChangeRequest { branch } => {
                write!(f, "branch {branch} was pushed but no change request could be opened")
            }
            FailureKind::WorkerError { detail } => {
                write!(f, "worker error while handling the session: {detail}")
            }
        }
    }
}
