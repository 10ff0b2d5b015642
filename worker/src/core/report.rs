//! Rendering of diagnostic reports and fallback change-request bodies.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::failure::FailureKind;
use crate::core::types::Session;

const DIAGNOSTIC_TEMPLATE: &str = include_str!("../templates/diagnostic_report.md");
const FALLBACK_PR_TEMPLATE: &str = include_str!("../templates/fallback_pr.md");

/// Everything a diagnostic report shows besides the session itself.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticFacts {
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
    /// Branch the agent worked on, if it left the default branch.
    pub work_branch: Option<String>,
    /// Change request the agent opened, if any.
    pub pr_url: Option<String>,
    pub reported_at: String,
}

/// Branch that carries the report for `session_id`.
///
/// `stamp` keeps repeated reports for the same id from colliding on the remote.
pub fn diagnostic_branch(session_id: &str, stamp: &str) -> String {
    format!("diagnostics/{session_id}-{stamp}")
}

pub fn diagnostic_title(session_id: &str, failure: &FailureKind) -> String {
    format!("Diagnostic: session {session_id} failed ({})", failure.label())
}

pub fn fallback_title(session: &Session) -> String {
    let refs = session.task_refs();
    if refs.is_empty() {
        format!("Session {}", session.id)
    } else {
        format!("Session {}: {}", session.id, refs.join(", "))
    }
}

/// Markdown body of the diagnostic report file (also used as the change-request body).
pub fn render_diagnostic_report(
    session: &Session,
    failure: &FailureKind,
    facts: &DiagnosticFacts,
) -> Result<String> {
    let env = Environment::new();
    let rendered = env.render_str(
        DIAGNOSTIC_TEMPLATE,
        context! {
            session => session,
            task_refs => session.task_refs(),
            reason_label => failure.label(),
            reason => failure.to_string(),
            prompt => &session.prompt,
            exit_code => facts.exit_code,
            stdout_tail => facts.stdout_tail.trim_end(),
            stderr_tail => facts.stderr_tail.trim_end(),
            work_branch => &facts.work_branch,
            pr_url => &facts.pr_url,
            reported_at => &facts.reported_at,
        },
    )?;
    Ok(format!("{}\n", rendered.trim_end()))
}

/// Body of the change request the worker opens when the agent pushed but did not open one.
pub fn render_fallback_body(
    session: &Session,
    branch: &str,
    exit_code: i32,
    worker_id: &str,
) -> Result<String> {
    let env = Environment::new();
    let rendered = env.render_str(
        FALLBACK_PR_TEMPLATE,
        context! {
            session_id => &session.id,
            task_refs => session.task_refs(),
            branch => branch,
            exit_code => exit_code,
            worker_id => worker_id,
        },
    )?;
    Ok(format!("{}\n", rendered.trim_end()))
}
