//! Agent CLI backends.
//!
//! Each backend is a headless coding-agent CLI that streams line-delimited
//! JSON events. The worker only needs three things from a run: the exit
//! status, bounded output tails, and the conversation id used to resume it.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::Command;

use anyhow::Result;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::events::{StreamRenderer, parse_event};
use crate::io::process::{SuperviseOptions, run_supervised};
use crate::io::shutdown::ShutdownToken;

/// Supported agent CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Claude,
    Codex,
    Cursor,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Claude => "claude",
            Backend::Codex => "codex",
            Backend::Cursor => "cursor",
        }
    }

    pub fn default_program(self) -> &'static str {
        match self {
            Backend::Claude => "claude",
            Backend::Codex => "codex",
            Backend::Cursor => "agent",
        }
    }

    /// Model used when neither the session nor the config names one.
    pub fn default_model(self) -> Option<&'static str> {
        match self {
            Backend::Claude => Some("opus"),
            Backend::Codex => None,
            Backend::Cursor => Some("opus-4.5-thinking"),
        }
    }
}

/// How to invoke the selected backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub backend: Backend,
    /// Overrides the backend's default program.
    pub executable: Option<String>,
    pub skip_permissions: bool,
    pub allowed_tools: Vec<String>,
}

impl AgentSettings {
    pub fn program(&self) -> &str {
        self.executable
            .as_deref()
            .filter(|exe| !exe.trim().is_empty())
            .unwrap_or(self.backend.default_program())
    }
}

/// One agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub session_id: String,
    pub workdir: PathBuf,
    pub prompt: String,
    pub model: Option<String>,
    /// Continue this conversation instead of starting a new one.
    pub resume_id: Option<String>,
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentRun {
    pub exit_code: i32,
    pub timed_out: bool,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub resume_id: Option<String>,
}

impl AgentRun {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Runs the agent. Implemented by [`CliAgent`] and by scripted fakes in tests.
pub trait AgentRunner {
    fn run(&self, request: &AgentRequest) -> Result<AgentRun>;
}

/// Argument vector for `request`; the prompt is always last.
pub fn build_args(settings: &AgentSettings, request: &AgentRequest) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let model = request.model.as_deref().filter(|m| !m.trim().is_empty());
    match settings.backend {
        Backend::Claude => {
            args.push("-p".to_string());
            // --allowedTools is variadic; keep a flag right behind it.
            if !settings.allowed_tools.is_empty() {
                args.push("--allowedTools".to_string());
                args.push(settings.allowed_tools.join(","));
            }
            args.extend(
                ["--output-format", "stream-json", "--verbose", "--include-partial-messages"]
                    .map(String::from),
            );
            if let Some(model) = model {
                args.extend(["--model".to_string(), model.to_string()]);
            }
            if settings.skip_permissions {
                args.push("--dangerously-skip-permissions".to_string());
            }
            if let Some(id) = &request.resume_id {
                args.extend(["--resume".to_string(), id.clone()]);
            }
        }
        Backend::Codex => {
            args.extend(["exec", "--json"].map(String::from));
            if let Some(model) = model {
                args.extend(["--model".to_string(), model.to_string()]);
            }
            if settings.skip_permissions {
                args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
            }
            if let Some(id) = &request.resume_id {
                args.extend(["resume".to_string(), id.clone()]);
            }
        }
        Backend::Cursor => {
            args.extend(
                ["--print", "--output-format", "stream-json", "--stream-partial-output"]
                    .map(String::from),
            );
            if let Some(model) = model {
                args.extend(["--model".to_string(), model.to_string()]);
            }
            if settings.skip_permissions {
                args.extend(["--force", "--sandbox", "disabled"].map(String::from));
            }
            if let Some(id) = &request.resume_id {
                args.extend(["--resume".to_string(), id.clone()]);
            }
        }
    }
    args.push(request.prompt.clone());
    args
}

/// [`AgentRunner`] that spawns the real CLI under supervision.
#[derive(Debug, Clone)]
pub struct CliAgent {
    settings: AgentSettings,
    supervise: SuperviseOptions,
    log_dir: Option<PathBuf>,
    shutdown: ShutdownToken,
}

impl CliAgent {
    pub fn new(
        settings: AgentSettings,
        supervise: SuperviseOptions,
        log_dir: Option<PathBuf>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            settings,
            supervise,
            log_dir,
            shutdown,
        }
    }
}

impl AgentRunner for CliAgent {
    #[instrument(
        skip_all,
        fields(
            session_id = %request.session_id,
            backend = self.settings.backend.as_str(),
            resume = request.resume_id.is_some()
        )
    )]
    fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        let mut cmd = Command::new(self.settings.program());
        cmd.args(build_args(&self.settings, request))
            .current_dir(&request.workdir);

        let mut options = self.supervise.clone();
        options.tee_path = self
            .log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.jsonl", request.session_id)));

        let mut renderer = StreamRenderer::default();
        let mut resume_id: Option<String> = None;
        let mut on_line = |line: &str| -> bool {
            let mut out = io::stdout().lock();
            let Some(event) = parse_event(line) else {
                let _ = writeln!(out, "{line}");
                return false;
            };
            if resume_id.is_none()
                && let Some(id) = event.resume_id()
            {
                info!(resume_id = id, "agent conversation id captured");
                resume_id = Some(id.to_string());
            }
            if let Some(text) = renderer.render(&event) {
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            event.is_result()
        };

        info!(program = self.settings.program(), "starting agent");
        let output = run_supervised(cmd, &options, &mut on_line)?;
        if output.interrupted() {
            warn!("agent interrupted by SIGINT; worker will stop after this session");
            self.shutdown.request();
        }
        info!(
            exit_code = output.exit_code,
            timed_out = output.timed_out,
            "agent exited"
        );
        Ok(AgentRun {
            exit_code: output.exit_code,
            timed_out: output.timed_out,
            stdout_tail: output.stdout_tail,
            stderr_tail: output.stderr_tail,
            resume_id,
        })
    }
}
