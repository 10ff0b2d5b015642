//! Single resumed agent run that targets one named delivery gap.

use tracing::{info, instrument, warn};

use crate::context::WorkerContext;
use crate::core::delivery::RecoveryReason;
use crate::core::prompt::recovery_prompt;
use crate::core::types::Session;
use crate::execute::startup_failure;
use crate::io::agent::{AgentRequest, AgentRun};

/// Resume the agent conversation with a `reason`-specific instruction.
///
/// Returns the resumed run, or `None` when nothing was attempted (no resume
/// id). The caller re-checks the repository afterwards.
#[instrument(skip_all, fields(session_id = %session.id, reason = %reason))]
pub fn attempt(
    ctx: &WorkerContext<'_>,
    session: &Session,
    resume_id: Option<&str>,
    reason: RecoveryReason,
    branch: Option<&str>,
) -> Option<AgentRun> {
    let Some(resume_id) = resume_id.filter(|id| !id.trim().is_empty()) else {
        info!("no resume id captured, skipping recovery");
        return None;
    };
    let prompt = match recovery_prompt(reason, &ctx.delivery_target(session), branch) {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "could not render recovery prompt");
            return None;
        }
    };
    let request = AgentRequest {
        session_id: session.id.clone(),
        workdir: ctx.git.workdir().to_path_buf(),
        prompt,
        model: ctx.config.resolve_model(session.model.as_deref()),
        resume_id: Some(resume_id.to_string()),
    };
    info!("resuming agent for recovery");
    let run = match ctx.agent.run(&request) {
        Ok(run) => run,
        Err(err) => startup_failure("run recovery agent", &err),
    };
    info!(
        exit_code = run.exit_code,
        timed_out = run.timed_out,
        "recovery run finished"
    );
    Some(run)
}

/// The run whose result stands after an optional recovery.
///
/// A successful resumed run supersedes the original; a failed one changes nothing.
pub fn settle(original: &AgentRun, resumed: Option<AgentRun>) -> AgentRun {
    match resumed {
        Some(mut resumed) if resumed.success() => {
            if resumed.resume_id.is_none() {
                resumed.resume_id = original.resume_id.clone();
            }
            resumed
        }
        _ => original.clone(),
    }
}
