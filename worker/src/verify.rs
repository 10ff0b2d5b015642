//! Post-execution delivery verification.
//!
//! Observes the repository once the agent exits, classifies what it sees,
//! and drives the session to a terminal status: directly, after one
//! recovery attempt, or through a diagnostic report.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::claim::ClaimedSession;
use crate::context::{WorkerContext, timestamp};
use crate::core::delivery::{DeliveryState, RecoveryReason, RepoObservation, classify};
use crate::core::failure::FailureKind;
use crate::core::report::{fallback_title, render_fallback_body};
use crate::core::types::{
    CONFIG_EXIT_CODE, CONFIG_PR_STATE, CONFIG_PR_URL, CONFIG_RESUME_ID, CONFIG_WORKER_BRANCH,
    Session, SessionStatus,
};
use crate::io::agent::AgentRun;
use crate::io::forge::NewPullRequest;
use crate::publish::update_session;
use crate::recovery;
use crate::report::{FailureContext, report_failure};

/// Terminal result of one orchestration cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { pr_url: Option<String> },
    Failed {
        failure: String,
        diagnostic_url: Option<String>,
    },
}

/// Sample the repository state the classification table needs.
pub fn observe(ctx: &WorkerContext<'_>, claim_sha: &str) -> Result<RepoObservation> {
    let branch = ctx.git.current_branch()?;
    Ok(RepoObservation {
        on_default_branch: branch == ctx.default_branch(),
        branch,
        head_is_claim_commit: ctx.git.head_sha()? == claim_sha,
        has_local_changes: ctx.git.has_local_changes()?,
    })
}

/// Verify the run for `claimed` and bring the session to a terminal status.
#[instrument(skip_all, fields(session_id = %claimed.session.id, exit_code = run.exit_code))]
pub fn verify(
    ctx: &WorkerContext<'_>,
    claimed: &ClaimedSession,
    run: &AgentRun,
) -> Result<Outcome> {
    let observation = observe(ctx, &claimed.claim_sha)?;
    let state = classify(&observation, run.success());
    info!(?state, branch = %observation.branch, "delivery classified");

    match state {
        DeliveryState::IncompleteDelivery => {
            let resumed = recovery::attempt(
                ctx,
                &claimed.session,
                run.resume_id.as_deref(),
                RecoveryReason::IncompleteDelivery,
                None,
            );
            let attempted = resumed.is_some();
            let run = recovery::settle(run, resumed);
            let after = observe(ctx, &claimed.claim_sha)?;
            if !after.on_default_branch {
                return feature_branch(ctx, claimed, &run, &after.branch, attempted);
            }
            if after.head_is_claim_commit {
                let detail = if attempted {
                    "changes were still left uncommitted on the default branch"
                } else {
                    "changes were left uncommitted and no resume id was captured"
                };
                return fail(
                    ctx,
                    claimed,
                    &run,
                    FailureKind::RecoveryExhausted {
                        detail: detail.to_string(),
                    },
                    None,
                    None,
                );
            }
            standard(ctx, claimed, &run)
        }
        DeliveryState::NoWorkProduced => {
            fail(ctx, claimed, run, FailureKind::NoWorkProduced, None, None)
        }
        DeliveryState::Standard => standard(ctx, claimed, run),
        DeliveryState::FeatureBranch { branch } => {
            feature_branch(ctx, claimed, run, &branch, false)
        }
    }
}

/// Default branch, nothing special: complete on success, report otherwise.
fn standard(ctx: &WorkerContext<'_>, claimed: &ClaimedSession, run: &AgentRun) -> Result<Outcome> {
    if !run.success() {
        let failure =
            FailureKind::from_exit(run.exit_code, run.timed_out, ctx.config.session_timeout());
        return fail(ctx, claimed, run, failure, None, None);
    }
    if ctx.git.has_local_changes()? {
        warn!("agent left uncommitted changes on the default branch");
        ctx.git
            .stash_all(&format!("session-worker: leftovers of session {}", claimed.session.id))?;
    }
    complete(ctx, claimed, run, None, None)
}

/// Deliver work the agent left on `branch`.
///
/// `recovery_used` is set when this session already had its one resumed run.
fn feature_branch(
    ctx: &WorkerContext<'_>,
    claimed: &ClaimedSession,
    run: &AgentRun,
    branch: &str,
    recovery_used: bool,
) -> Result<Outcome> {
    let id = &claimed.session.id;
    if ctx.git.has_local_changes()? {
        warn!(branch, "agent left uncommitted changes on its branch");
    }
    let mut pushed = ensure_pushed(ctx, branch);
    let mut pr_url = find_pr(ctx, branch);

    let mut settled = run.clone();
    if pr_url.is_none() && recovery_used {
        info!(branch, "recovery already used for this session, not resuming again");
    } else if pr_url.is_none() {
        let reason = if run.success() {
            RecoveryReason::NoPr
        } else {
            RecoveryReason::Generic
        };
        let resumed = recovery::attempt(
            ctx,
            &claimed.session,
            run.resume_id.as_deref(),
            reason,
            Some(branch),
        );
        if resumed.is_some() {
            settled = recovery::settle(run, resumed);
            pushed = ensure_pushed(ctx, branch);
            pr_url = find_pr(ctx, branch);
        }
    }
    let run = &settled;

    if pr_url.is_none() && pushed && run.success() {
        pr_url = open_fallback_pr(ctx, claimed, run, branch);
    }

    let pr_state = pr_url.as_deref().and_then(|url| match ctx.forge.view_pr(url) {
        Ok(status) => {
            info!(url, state = %status.summary(), "change request state");
            Some(status.summary())
        }
        Err(err) => {
            warn!(url, err = %format!("{err:#}"), "could not read change request state");
            None
        }
    });

    ctx.git
        .stash_all(&format!("session-worker: leftovers of session {id} on {branch}"))?;
    ctx.git.checkout_branch(ctx.default_branch())?;
    ctx.git.pull_rebase(ctx.remote(), ctx.default_branch())?;

    if !run.success() {
        let failure =
            FailureKind::from_exit(run.exit_code, run.timed_out, ctx.config.session_timeout());
        return fail(ctx, claimed, run, failure, Some(branch), pr_url);
    }
    match pr_url {
        Some(url) => complete(ctx, claimed, run, Some((branch, url)), pr_state),
        None => fail(
            ctx,
            claimed,
            run,
            FailureKind::NoChangeRequest {
                branch: branch.to_string(),
            },
            Some(branch),
            None,
        ),
    }
}

/// Push `branch` unless the remote already has its tip. Returns whether the remote has it now.
fn ensure_pushed(ctx: &WorkerContext<'_>, branch: &str) -> bool {
    match ctx.git.is_pushed(ctx.remote(), branch) {
        Ok(true) => return true,
        Ok(false) => {}
        Err(err) => warn!(
            branch,
            err = %format!("{err:#}"),
            "could not compare branch with remote"
        ),
    }
    match ctx.git.push_upstream(ctx.remote(), branch) {
        Ok(()) => {
            info!(branch, "pushed agent branch");
            true
        }
        Err(err) => {
            warn!(branch, err = %format!("{err:#}"), "could not push agent branch");
            false
        }
    }
}

fn find_pr(ctx: &WorkerContext<'_>, branch: &str) -> Option<String> {
    match ctx.forge.find_open_pr(branch) {
        Ok(found) => found.map(|pr| pr.url),
        Err(err) => {
            warn!(branch, err = %format!("{err:#}"), "could not list change requests");
            None
        }
    }
}

fn open_fallback_pr(
    ctx: &WorkerContext<'_>,
    claimed: &ClaimedSession,
    run: &AgentRun,
    branch: &str,
) -> Option<String> {
    let session = &claimed.session;
    let request = render_fallback_body(session, branch, run.exit_code, &ctx.worker_id).map(|body| {
        NewPullRequest {
            base: ctx.default_branch().to_string(),
            head: branch.to_string(),
            title: fallback_title(session),
            body,
        }
    });
    match request.and_then(|request| ctx.forge.create_pr(&request)) {
        Ok(url) => {
            info!(url = %url, "opened fallback change request");
            Some(url)
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "could not open fallback change request");
            None
        }
    }
}

/// Mark completed unless something else already finalized the session.
fn complete(
    ctx: &WorkerContext<'_>,
    claimed: &ClaimedSession,
    run: &AgentRun,
    delivery: Option<(&str, String)>,
    pr_state: Option<String>,
) -> Result<Outcome> {
    let pr_url = delivery.as_ref().map(|(_, url)| url.clone());
    update_session(ctx, &claimed.session.id, |session| {
        if session.status.is_terminal() {
            info!(status = %session.status, "session already terminal, recording links only");
        } else {
            session.transition(SessionStatus::Completed)?;
            session.completed_at = Some(timestamp());
        }
        record_run(session, run);
        if let Some((branch, url)) = &delivery {
            session.set_config(CONFIG_WORKER_BRANCH, *branch);
            session.set_config(CONFIG_PR_URL, url.as_str());
        }
        if let Some(state) = &pr_state {
            session.set_config(CONFIG_PR_STATE, state.as_str());
        }
        Ok(())
    })?;
    info!(pr_url = pr_url.as_deref().unwrap_or("-"), "session completed");
    Ok(Outcome::Completed { pr_url })
}

fn fail(
    ctx: &WorkerContext<'_>,
    claimed: &ClaimedSession,
    run: &AgentRun,
    failure: FailureKind,
    work_branch: Option<&str>,
    pr_url: Option<String>,
) -> Result<Outcome> {
    warn!(failure = %failure, "session could not be delivered");
    let context = FailureContext {
        run: run.clone(),
        work_branch: work_branch.map(str::to_string),
        pr_url,
    };
    let diagnostic_url = report_failure(ctx, &claimed.session.id, &failure, &context)?;
    Ok(Outcome::Failed {
        failure: failure.to_string(),
        diagnostic_url,
    })
}

fn record_run(session: &mut Session, run: &AgentRun) {
    session.set_config(CONFIG_EXIT_CODE, run.exit_code);
    if let Some(id) = &run.resume_id {
        session.set_config(CONFIG_RESUME_ID, id.as_str());
    }
}
