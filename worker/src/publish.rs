//! Publication of session status changes to the shared store.
//!
//! Unlike the claim, a status update is owned by this worker alone, so a
//! rejected push is rebased and retried a bounded number of times.

use anyhow::{Result, bail};
use tracing::{debug, error, info, instrument, warn};

use crate::context::{WorkerContext, timestamp};
use crate::core::types::Session;

/// Atomically write `session`, commit that one file and push it.
///
/// Returns `false` (after logging) when the worker cannot get onto the
/// default branch, or when the push could not be completed within
/// `push_retries` rebases.
#[instrument(skip_all, fields(session_id = %session.id, status = %session.status))]
pub fn publish_session(ctx: &WorkerContext<'_>, session: &Session) -> bool {
    if let Err(err) = ensure_default_branch(ctx) {
        error!(
            err = %format!("{err:#}"),
            "session status not published; the shared store is stale for this session"
        );
        return false;
    }
    let attempts = ctx.config.push_retries + 1;
    for attempt in 1..=attempts {
        match publish_once(ctx, session) {
            Ok(()) => {
                info!(attempt, "session status published");
                return true;
            }
            Err(err) => warn!(attempt, err = %format!("{err:#}"), "status publication failed"),
        }
        if attempt == attempts {
            break;
        }
        if let Err(err) = ctx.git.pull_rebase(ctx.remote(), ctx.default_branch()) {
            // The rebase conflicted; start again from the remote state and rewrite the record.
            warn!(err = %format!("{err:#}"), "rebase failed, resetting to remote");
            let upstream = format!("{}/{}", ctx.remote(), ctx.default_branch());
            if let Err(err) = ctx.git.reset_hard(&upstream) {
                warn!(err = %format!("{err:#}"), "reset to remote failed");
            }
        }
    }
    error!(
        attempts,
        "session status could not be pushed; the shared store is stale for this session"
    );
    false
}

/// Status commits only ever land on the default branch.
fn ensure_default_branch(ctx: &WorkerContext<'_>) -> Result<()> {
    let branch = ctx.git.current_branch()?;
    if branch == ctx.default_branch() {
        return Ok(());
    }
    warn!(branch = %branch, "returning to the default branch before publishing");
    ctx.git
        .stash_all(&format!("session-worker: leftovers on {branch} before publishing"))?;
    ctx.git.checkout_branch(ctx.default_branch())?;
    let now = ctx.git.current_branch()?;
    if now != ctx.default_branch() {
        bail!("still on {now} after checking out {}", ctx.default_branch());
    }
    Ok(())
}

fn publish_once(ctx: &WorkerContext<'_>, session: &Session) -> Result<()> {
    let branch = ctx.git.current_branch()?;
    if branch != ctx.default_branch() {
        bail!("refusing to publish from {branch}");
    }
    ctx.store.write(session)?;
    let rel = ctx.store.rel_path(&session.id)?;
    if ctx.git.path_has_changes(&rel)? {
        ctx.git.commit_paths(
            &format!("session {}: {}", session.id, session.status),
            &[rel.as_path()],
        )?;
    } else {
        debug!("record unchanged, pushing existing commits");
    }
    ctx.git.push(ctx.remote(), ctx.default_branch())
}

/// Read the latest record for `id`, apply `mutate`, bump `updated_at` and publish.
pub fn update_session(
    ctx: &WorkerContext<'_>,
    id: &str,
    mutate: impl FnOnce(&mut Session) -> Result<()>,
) -> Result<Session> {
    let mut session = ctx.store.read(id)?;
    mutate(&mut session)?;
    session.updated_at = Some(timestamp());
    publish_session(ctx, &session);
    Ok(session)
}
