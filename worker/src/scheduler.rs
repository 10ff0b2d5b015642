//! Top-level worker loop: discover, claim, execute, verify, report.
//!
//! One session at a time per worker. Many workers may run against the same
//! remote; they only coordinate through the claim push.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info, instrument, warn};

use crate::claim::{ClaimError, claim};
use crate::context::WorkerContext;
use crate::core::failure::FailureKind;
use crate::execute::execute;
use crate::io::agent::AgentRun;
use crate::report::{FailureContext, report_failure};
use crate::verify::{Outcome, verify};

const SLEEP_TICK: Duration = Duration::from_secs(1);
const RESTARTED_FLAG: &str = "--restarted";
const MAX_SESSIONS_FLAG: &str = "--max-sessions";
/// Every stash the worker makes carries this in its message.
const STASH_MARKER: &str = "session-worker:";

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    Shutdown,
    MaxSessions,
    /// The watched tooling changed; re-exec with the remaining budget (`None` = unlimited).
    Restart { remaining: Option<u32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    pub processed: u32,
    pub stop: LoopStop,
}

/// What happened to one discovered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResult {
    /// Another worker got it first (or it was no longer queued).
    Skipped,
    Processed(Outcome),
}

/// Run until shutdown, the session limit, or a self-update.
#[instrument(skip_all, fields(worker = %ctx.worker_id))]
pub fn run_loop(ctx: &WorkerContext<'_>) -> Result<LoopOutcome> {
    let watch = SelfUpdateWatch::start(ctx)?;
    let max = ctx.config.max_sessions;
    let mut processed = 0u32;
    info!(
        max_sessions = max,
        poll_interval_secs = ctx.config.poll_interval_secs,
        "worker started"
    );

    loop {
        if ctx.shutdown.is_requested() {
            return Ok(stop(processed, LoopStop::Shutdown));
        }
        if let Err(err) = sync_default_branch(ctx) {
            warn!(err = %format!("{err:#}"), "could not sync default branch");
            if sleep_unless_shutdown(ctx, ctx.config.poll_interval()) {
                return Ok(stop(processed, LoopStop::Shutdown));
            }
            continue;
        }
        if watch.changed(ctx) {
            let remaining = (max > 0).then(|| max - processed);
            return Ok(stop(processed, LoopStop::Restart { remaining }));
        }

        let next = match ctx.store.oldest_queued(&ctx.filter()) {
            Ok(next) => next,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not list sessions");
                None
            }
        };
        let Some(session) = next else {
            debug!("no queued sessions");
            if sleep_unless_shutdown(ctx, ctx.config.poll_interval()) {
                return Ok(stop(processed, LoopStop::Shutdown));
            }
            continue;
        };

        match process_session(ctx, &session.id) {
            Ok(SessionResult::Skipped) => {
                // A remote that keeps rejecting claims must not be hammered.
                if sleep_unless_shutdown(ctx, ctx.config.poll_interval()) {
                    return Ok(stop(processed, LoopStop::Shutdown));
                }
                continue;
            }
            Ok(SessionResult::Processed(outcome)) => {
                processed += 1;
                info!(session_id = %session.id, ?outcome, processed, "session finished");
            }
            Err(err) => {
                error!(
                    session_id = %session.id,
                    err = %format!("{err:#}"),
                    "session processing failed"
                );
                if sleep_unless_shutdown(ctx, ctx.config.poll_interval()) {
                    return Ok(stop(processed, LoopStop::Shutdown));
                }
                continue;
            }
        }
        if max > 0 && processed >= max {
            return Ok(stop(processed, LoopStop::MaxSessions));
        }
    }
}

fn stop(processed: u32, stop: LoopStop) -> LoopOutcome {
    info!(processed, ?stop, "worker stopping");
    LoopOutcome { processed, stop }
}

/// Claim, execute and verify one session.
///
/// Once the claim is pushed the session is this worker's responsibility: a
/// worker-side error still ends in a diagnostic report when possible.
#[instrument(skip_all, fields(session_id = %id))]
pub fn process_session(ctx: &WorkerContext<'_>, id: &str) -> Result<SessionResult> {
    let claimed = match claim(ctx, id) {
        Ok(claimed) => claimed,
        Err(err) => {
            if let Some(conflict) = err.downcast_ref::<ClaimError>() {
                info!(reason = %conflict, "skipping session");
                return Ok(SessionResult::Skipped);
            }
            return Err(err);
        }
    };

    let run = execute(ctx, &claimed);
    match verify(ctx, &claimed, &run) {
        Ok(outcome) => Ok(SessionResult::Processed(outcome)),
        Err(err) => {
            error!(err = %format!("{err:#}"), "verification failed, filing worker error");
            salvage(ctx, id, &run, &err)
        }
    }
}

fn salvage(
    ctx: &WorkerContext<'_>,
    id: &str,
    run: &AgentRun,
    cause: &anyhow::Error,
) -> Result<SessionResult> {
    let failure = FailureKind::WorkerError {
        detail: format!("{cause:#}"),
    };
    let context = FailureContext {
        run: run.clone(),
        ..FailureContext::default()
    };
    let reported = sync_default_branch(ctx)
        .and_then(|()| report_failure(ctx, id, &failure, &context));
    match reported {
        Ok(diagnostic_url) => Ok(SessionResult::Processed(Outcome::Failed {
            failure: failure.to_string(),
            diagnostic_url,
        })),
        Err(err) => {
            // Nothing reconciles this later; an operator has to look.
            error!(err = %format!("{err:#}"), "claimed session left active");
            Err(err.context(format!("session {id} left active")))
        }
    }
}

/// Clean worktree on an up-to-date default branch.
///
/// Only the newest `stash_keep` worker stashes are retained.
pub fn sync_default_branch(ctx: &WorkerContext<'_>) -> Result<()> {
    ctx.git.rebase_abort();
    ctx.git.stash_all("session-worker: leftovers before sync")?;
    ctx.git.prune_stashes(STASH_MARKER, ctx.config.stash_keep)?;
    if ctx.git.current_branch()? != ctx.default_branch() {
        ctx.git.checkout_branch(ctx.default_branch())?;
    }
    ctx.git.pull_rebase(ctx.remote(), ctx.default_branch())
}

/// Sleep `total` in one-second ticks. Returns `true` if shutdown was requested.
fn sleep_unless_shutdown(ctx: &WorkerContext<'_>, total: Duration) -> bool {
    let mut slept = Duration::ZERO;
    while slept < total {
        if ctx.shutdown.is_requested() {
            return true;
        }
        let tick = SLEEP_TICK.min(total - slept);
        thread::sleep(tick);
        slept += tick;
    }
    ctx.shutdown.is_requested()
}

/// Tracks the tree hash of the worker's own sources inside the repository.
struct SelfUpdateWatch {
    path: Option<String>,
    baseline: Option<String>,
}

impl SelfUpdateWatch {
    fn start(ctx: &WorkerContext<'_>) -> Result<Self> {
        let Some(path) = ctx.config.self_update.watch_path.clone() else {
            return Ok(Self {
                path: None,
                baseline: None,
            });
        };
        let baseline = ctx.git.tree_hash(&path)?;
        info!(
            path = %path,
            baseline = baseline.as_deref().unwrap_or("-"),
            "watching for self-updates"
        );
        Ok(Self {
            path: Some(path),
            baseline,
        })
    }

    fn changed(&self, ctx: &WorkerContext<'_>) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        match ctx.git.tree_hash(path) {
            Ok(current) if current != self.baseline => {
                info!(
                    path = %path,
                    current = current.as_deref().unwrap_or("-"),
                    "worker sources changed"
                );
                true
            }
            Ok(_) => false,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not read watched tree hash");
                false
            }
        }
    }
}

/// Arguments for re-exec after a self-update: `original` without any earlier
/// restart flags, plus `--restarted` and the remaining session budget.
pub fn restart_args(original: &[String], remaining: Option<u32>) -> Vec<String> {
    let mut args = Vec::with_capacity(original.len() + 3);
    let mut iter = original.iter();
    while let Some(arg) = iter.next() {
        if arg == RESTARTED_FLAG || arg.starts_with(&format!("{MAX_SESSIONS_FLAG}=")) {
            continue;
        }
        if arg == MAX_SESSIONS_FLAG {
            iter.next();
            continue;
        }
        args.push(arg.clone());
    }
    args.push(RESTARTED_FLAG.to_string());
    if let Some(remaining) = remaining {
        args.push(MAX_SESSIONS_FLAG.to_string());
        args.push(remaining.to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn restart_args_replace_budget_and_flag() {
        let original = strings(&[
            "--repo",
            "/srv/repo",
            "run",
            "--unattended",
            "--max-sessions",
            "5",
            "--restarted",
        ]);
        assert_eq!(
            restart_args(&original, Some(3)),
            strings(&[
                "--repo",
                "/srv/repo",
                "run",
                "--unattended",
                "--restarted",
                "--max-sessions",
                "3"
            ])
        );
    }

    #[test]
    fn restart_args_handle_equals_form_and_unlimited() {
        let original = strings(&["run", "--max-sessions=4", "--backend", "codex"]);
        assert_eq!(
            restart_args(&original, None),
            strings(&["run", "--backend", "codex", "--restarted"])
        );
    }
}
