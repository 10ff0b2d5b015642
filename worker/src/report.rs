//! Diagnostic reports for sessions that could not be delivered.
//!
//! A report is a markdown file committed on its own branch with a change
//! request against the default branch, so every unrecoverable failure ends
//! up in the review queue. The session is marked failed and linked to it.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::context::{WorkerContext, timestamp};
use crate::core::failure::FailureKind;
use crate::core::report::{
    DiagnosticFacts, diagnostic_branch, diagnostic_title, render_diagnostic_report,
};
use crate::core::types::{
    CONFIG_DIAGNOSTIC_URL, CONFIG_EXIT_CODE, CONFIG_PR_URL, CONFIG_RESUME_ID, CONFIG_WORKER_BRANCH,
    Session, SessionStatus,
};
use crate::io::agent::AgentRun;
use crate::io::forge::NewPullRequest;
use crate::publish::update_session;

/// Characters of stderr carried into `error_message`.
const STDERR_EXCERPT_CHARS: usize = 400;

/// What the reporter knows about the failed run.
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    pub run: AgentRun,
    pub work_branch: Option<String>,
    pub pr_url: Option<String>,
}

/// File a diagnostic report for `session_id` and mark the session failed.
///
/// Idempotent: a terminal session that already links a report is left alone
/// and its existing URL returned. Must be called on the default branch.
#[instrument(skip_all, fields(session_id = %session_id, failure = failure.label()))]
pub fn report_failure(
    ctx: &WorkerContext<'_>,
    session_id: &str,
    failure: &FailureKind,
    context: &FailureContext,
) -> Result<Option<String>> {
    let current = ctx.store.read(session_id)?;
    if current.status.is_terminal()
        && let Some(url) = current.config_str(CONFIG_DIAGNOSTIC_URL)
    {
        info!(url, "diagnostic report already filed");
        return Ok(Some(url.to_string()));
    }

    let facts = DiagnosticFacts {
        exit_code: context.run.exit_code,
        stdout_tail: context.run.stdout_tail.clone(),
        stderr_tail: context.run.stderr_tail.clone(),
        work_branch: context.work_branch.clone(),
        pr_url: context.pr_url.clone(),
        reported_at: timestamp(),
    };
    let diagnostic_url = match open_report(ctx, &current, failure, &facts) {
        Ok(url) => {
            info!(url = %url, "diagnostic change request opened");
            Some(url)
        }
        Err(err) => {
            error!(err = %format!("{err:#}"), "could not open diagnostic change request");
            None
        }
    };
    return_to_default(ctx);

    let error_text = error_text(failure, &context.run.stderr_tail);
    update_session(ctx, session_id, |session| {
        if !session.status.is_terminal() {
            session.transition(SessionStatus::Failed)?;
            session.completed_at = Some(timestamp());
        } else {
            warn!(status = %session.status, "session already terminal, recording report only");
        }
        session.append_error(&error_text);
        session.set_config(CONFIG_EXIT_CODE, context.run.exit_code);
        if let Some(id) = &context.run.resume_id {
            session.set_config(CONFIG_RESUME_ID, id.as_str());
        }
        if let Some(url) = &diagnostic_url {
            session.set_config(CONFIG_DIAGNOSTIC_URL, url.as_str());
        }
        if let Some(url) = &context.pr_url {
            session.set_config(CONFIG_PR_URL, url.as_str());
        }
        if let Some(branch) = &context.work_branch {
            session.set_config(CONFIG_WORKER_BRANCH, branch.as_str());
        }
        Ok(())
    })?;
    Ok(diagnostic_url)
}

fn open_report(
    ctx: &WorkerContext<'_>,
    session: &Session,
    failure: &FailureKind,
    facts: &DiagnosticFacts,
) -> Result<String> {
    let body = render_diagnostic_report(session, failure, facts)?;
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let branch = diagnostic_branch(&session.id, &stamp);

    ctx.git
        .stash_all(&format!("session-worker: leftovers before report for {}", session.id))?;
    ctx.git.checkout_new_branch(&branch)?;

    let rel = PathBuf::from(&ctx.config.diagnostics_dir).join(format!("{}.md", session.id));
    let path = ctx.git.workdir().join(&rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(&path, &body).with_context(|| format!("write report {}", path.display()))?;
    ctx.git.commit_paths(
        &format!("diagnostic report for session {}", session.id),
        &[rel.as_path()],
    )?;
    ctx.git.push_upstream(ctx.remote(), &branch)?;

    ctx.forge.create_pr(&NewPullRequest {
        base: ctx.default_branch().to_string(),
        head: branch,
        title: diagnostic_title(&session.id, failure),
        body,
    })
}

fn return_to_default(ctx: &WorkerContext<'_>) {
    let result = ctx
        .git
        .stash_all("session-worker: leftovers after report")
        .and_then(|_| ctx.git.checkout_branch(ctx.default_branch()));
    if let Err(err) = result {
        warn!(err = %format!("{err:#}"), "could not return to default branch");
    }
}

fn error_text(failure: &FailureKind, stderr_tail: &str) -> String {
    let stderr = stderr_tail.trim();
    if stderr.is_empty() {
        return failure.to_string();
    }
    let skip = stderr.chars().count().saturating_sub(STDERR_EXCERPT_CHARS);
    let excerpt: String = stderr.chars().skip(skip).collect();
    format!("{failure}\nstderr: {excerpt}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_text_keeps_the_end_of_stderr() {
        let stderr = format!("{}END", "x".repeat(1000));
        let text = error_text(&FailureKind::Crashed { exit_code: 2 }, &stderr);
        assert!(text.starts_with("agent crashed with exit code 2\nstderr: "));
        assert!(text.ends_with("END"));
        assert!(text.chars().count() < 500);
    }

    #[test]
    fn error_text_without_stderr_is_the_reason() {
        let text = error_text(&FailureKind::NoWorkProduced, "  \n");
        assert_eq!(text, "agent exited successfully but produced no work");
    }
}
