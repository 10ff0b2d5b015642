//! Execution of a claimed session by the agent.

use tracing::{error, info, instrument};

use crate::claim::ClaimedSession;
use crate::context::WorkerContext;
use crate::core::prompt::build_agent_prompt;
use crate::io::agent::{AgentRequest, AgentRun};

/// Exit code recorded when the agent could not be started at all.
pub const SPAWN_FAILURE_EXIT: i32 = 127;

/// Run the agent once for `claimed`.
///
/// Never fails: a prompt or spawn error is folded into a crashed [`AgentRun`]
/// so the session still flows into verification and reporting.
#[instrument(skip_all, fields(session_id = %claimed.session.id))]
pub fn execute(ctx: &WorkerContext<'_>, claimed: &ClaimedSession) -> AgentRun {
    let session = &claimed.session;
    let target = ctx.delivery_target(session);
    let prompt = match build_agent_prompt(&session.prompt, ctx.config.unattended, &target) {
        Ok(prompt) => prompt,
        Err(err) => return startup_failure("prepare agent prompt", &err),
    };
    let request = AgentRequest {
        session_id: session.id.clone(),
        workdir: ctx.git.workdir().to_path_buf(),
        prompt,
        model: ctx.config.resolve_model(session.model.as_deref()),
        resume_id: None,
    };
    info!(
        model = request.model.as_deref().unwrap_or("default"),
        unattended = ctx.config.unattended,
        "executing session"
    );
    match ctx.agent.run(&request) {
        Ok(run) => run,
        Err(err) => startup_failure("run agent", &err),
    }
}

/// A crashed run standing in for an agent that could not be started.
pub(crate) fn startup_failure(what: &str, err: &anyhow::Error) -> AgentRun {
    error!(err = %format!("{err:#}"), "{what} failed");
    AgentRun {
        exit_code: SPAWN_FAILURE_EXIT,
        stderr_tail: format!("{what} failed: {err:#}"),
        ..AgentRun::default()
    }
}
