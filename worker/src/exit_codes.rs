//! Stable exit codes for worker CLI commands and supervised agents.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid config, repository state, or other errors.
pub const INVALID: i32 = 1;
/// `session-worker claim` lost the race (or the session was not queued).
pub const CLAIM_CONFLICT: i32 = 2;
/// Exit code recorded for an agent terminated by the wall-clock timeout.
///
/// Matches coreutils `timeout` so logs read the same as shell-driven workers.
pub const AGENT_TIMEOUT: i32 = 124;
/// Offset added to a signal number when an agent is killed by a signal.
pub const SIGNAL_BASE: i32 = 128;
