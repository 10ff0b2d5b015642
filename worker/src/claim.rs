//! Distributed claim of one queued session.
//!
//! The push of the claim commit is the mutex: the remote accepts exactly one
//! fast-forward for a given parent. A rejected push, for whatever reason,
//! means the claim is lost and the local commit is discarded. Claims are
//! never rebased and retried.

use std::fmt;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::context::{WorkerContext, timestamp};
use crate::core::types::{Session, SessionStatus};

/// Claim outcomes callers branch on (`downcast_ref::<ClaimError>()`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    /// The record exists but is not `queued`.
    NotQueued { id: String, status: SessionStatus },
    /// The remote did not accept the claim commit.
    PushRejected { id: String, detail: String },
}

impl fmt::Display for ClaimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimError::NotQueued { id, status } => {
                write!(f, "session {id} is {status}, not queued")
            }
            ClaimError::PushRejected { id, detail } => {
                write!(f, "claim of session {id} lost: push rejected: {detail}")
            }
        }
    }
}

impl std::error::Error for ClaimError {}

/// A session this worker now exclusively owns.
#[derive(Debug, Clone)]
pub struct ClaimedSession {
    pub session: Session,
    /// HEAD right after the claim commit was pushed.
    pub claim_sha: String,
}

/// Claim session `id` for this worker.
///
/// A missing or malformed record is a hard error, unlike discovery.
#[instrument(skip_all, fields(session_id = %id))]
pub fn claim(ctx: &WorkerContext<'_>, id: &str) -> Result<ClaimedSession> {
    let mut session = ctx.store.read(id)?;
    if session.status != SessionStatus::Queued {
        return Err(ClaimError::NotQueued {
            id: id.to_string(),
            status: session.status,
        }
        .into());
    }

    let prior = ctx.git.head_sha().context("record pre-claim HEAD")?;
    let now = timestamp();
    session.transition(SessionStatus::Active)?;
    session.claimed_by = Some(ctx.worker_id.clone());
    session.claimed_at = Some(now.clone());
    session.updated_at = Some(now);

    let rel = ctx.store.rel_path(id)?;
    let committed = ctx
        .store
        .write(&session)
        .and_then(|_| ctx.git.commit_paths(&format!("claim session {id}"), &[rel.as_path()]));
    if let Err(err) = committed {
        rollback(ctx, &prior)?;
        return Err(err.context(format!("commit claim for session {id}")));
    }

    if let Err(err) = ctx.git.push(ctx.remote(), ctx.default_branch()) {
        warn!(err = %format!("{err:#}"), "claim push rejected, rolling back");
        rollback(ctx, &prior)?;
        return Err(ClaimError::PushRejected {
            id: id.to_string(),
            detail: format!("{err:#}"),
        }
        .into());
    }

    let claim_sha = ctx.git.head_sha()?;
    info!(worker = %ctx.worker_id, claim_sha = %claim_sha, "session claimed");
    Ok(ClaimedSession { session, claim_sha })
}

fn rollback(ctx: &WorkerContext<'_>, prior: &str) -> Result<()> {
    ctx.git
        .reset_hard(prior)
        .context("discard local claim commit")
}
