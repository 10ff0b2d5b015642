//! Worker configuration stored under `.orchestrator/config.toml`.
//!
//! Layering: built-in defaults, then the file, then CLI overrides. The
//! merged value is validated once and passed down by reference.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::agent::{AgentSettings, Backend};
use crate::io::process::SuperviseOptions;
use crate::io::session_store::DEFAULT_PROVIDER;

/// Repository-relative location of the config file.
pub const CONFIG_PATH: &str = ".orchestrator/config.toml";

/// Worker configuration (TOML).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub backend: Backend,
    /// Model when the session does not name one; empty means the backend default.
    pub model: Option<String>,
    pub poll_interval_secs: u64,
    /// Per-session wall-clock limit; `0` disables it.
    pub session_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL on timeout.
    pub kill_grace_secs: u64,
    /// Force-kill an agent still alive this long after its result event; `0` disables.
    pub result_grace_secs: u64,
    pub unattended: bool,
    /// Stop after this many sessions; `0` means unlimited.
    pub max_sessions: u32,
    pub remote: String,
    pub default_branch: String,
    pub sessions_dir: String,
    pub diagnostics_dir: String,
    /// Provider tag this worker serves.
    pub provider: String,
    /// Recorded as `claimed_by`; defaults to the host name.
    pub worker_id: Option<String>,
    /// Bytes of agent stdout and stderr kept for reports.
    pub tail_bytes: usize,
    /// Rebase-and-push attempts for status publication.
    pub push_retries: u32,
    /// Leftover stashes made by the worker that are kept; older ones are dropped.
    pub stash_keep: usize,
    /// Raw agent event logs go here (outside the repository) when set.
    pub log_dir: Option<PathBuf>,
    pub agent: AgentConfig,
    pub self_update: SelfUpdateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub skip_permissions: bool,
    pub allowed_tools: Vec<String>,
    pub executable: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            skip_permissions: true,
            allowed_tools: Vec::new(),
            executable: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SelfUpdateConfig {
    /// Repository path whose tree hash is watched; unset disables self-update.
    pub watch_path: Option<String>,
    /// Run before re-exec, e.g. `["cargo", "install", "--path", "worker"]`.
    pub rebuild_command: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            model: None,
            poll_interval_secs: 30,
            session_timeout_secs: 60 * 60,
            kill_grace_secs: 10,
            result_grace_secs: 30,
            unattended: false,
            max_sessions: 0,
            remote: "origin".to_string(),
            default_branch: "main".to_string(),
            sessions_dir: ".orchestrator/sessions".to_string(),
            diagnostics_dir: ".orchestrator/diagnostics".to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
            worker_id: None,
            tail_bytes: 4096,
            push_retries: 3,
            stash_keep: 20,
            log_dir: None,
            agent: AgentConfig::default(),
            self_update: SelfUpdateConfig::default(),
        }
    }
}

/// CLI flags that override file values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub backend: Option<Backend>,
    pub model: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub unattended: bool,
    pub max_sessions: Option<u32>,
    pub session_timeout_secs: Option<u64>,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.tail_bytes == 0 {
            return Err(anyhow!("tail_bytes must be > 0"));
        }
        for (name, value) in [
            ("remote", &self.remote),
            ("default_branch", &self.default_branch),
            ("sessions_dir", &self.sessions_dir),
            ("diagnostics_dir", &self.diagnostics_dir),
            ("provider", &self.provider),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{name} must not be empty"));
            }
        }
        for (name, value) in [
            ("sessions_dir", &self.sessions_dir),
            ("diagnostics_dir", &self.diagnostics_dir),
        ] {
            if Path::new(value).is_absolute() {
                return Err(anyhow!("{name} must be relative to the repository"));
            }
        }
        if let Some(first) = self.self_update.rebuild_command.first()
            && first.trim().is_empty()
        {
            return Err(anyhow!("self_update.rebuild_command[0] must not be empty"));
        }
        Ok(())
    }

    /// Apply CLI overrides on top of this config and re-validate.
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Result<Self> {
        if let Some(backend) = overrides.backend {
            if backend != self.backend {
                // A model chosen for another backend rarely means anything here.
                self.model = None;
            }
            self.backend = backend;
        }
        if let Some(model) = &overrides.model {
            self.model = Some(model.clone());
        }
        if let Some(secs) = overrides.poll_interval_secs {
            self.poll_interval_secs = secs;
        }
        if overrides.unattended {
            self.unattended = true;
        }
        if let Some(max) = overrides.max_sessions {
            self.max_sessions = max;
        }
        if let Some(secs) = overrides.session_timeout_secs {
            self.session_timeout_secs = secs;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_secs > 0).then(|| Duration::from_secs(self.session_timeout_secs))
    }

    /// Model for a session: the session's own, then the config's, then the backend default.
    pub fn resolve_model<'a>(&'a self, session_model: Option<&'a str>) -> Option<String> {
        let named = |m: Option<&'a str>| m.map(str::trim).filter(|m| !m.is_empty());
        named(session_model)
            .or(named(self.model.as_deref()))
            .or(self.backend.default_model())
            .map(str::to_string)
    }

    pub fn worker_id(&self) -> String {
        if let Some(id) = self.worker_id.as_deref().map(str::trim)
            && !id.is_empty()
        {
            return id.to_string();
        }
        match nix::unistd::gethostname() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(_) => "unknown-worker".to_string(),
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            backend: self.backend,
            executable: self.agent.executable.clone(),
            skip_permissions: self.agent.skip_permissions,
            allowed_tools: self.agent.allowed_tools.clone(),
        }
    }

    /// Supervision limits for one agent run (no log tee; the agent adds it per session).
    pub fn supervise_options(&self) -> SuperviseOptions {
        SuperviseOptions {
            timeout: self.session_timeout(),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
            result_grace: (self.result_grace_secs > 0)
                .then(|| Duration::from_secs(self.result_grace_secs)),
            tail_bytes: self.tail_bytes,
            tee_path: None,
            attach_terminal: true,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WorkerConfig::default()`.
pub fn load_config(path: &Path) -> Result<WorkerConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config file missing, using defaults");
        let cfg = WorkerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WorkerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, WorkerConfig::default());
        assert_eq!(cfg.session_timeout(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "backend = \"cursor\"\nsession_timeout_secs = 0\n\n\
             [agent]\nallowed_tools = [\"Edit\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.backend, Backend::Cursor);
        assert_eq!(cfg.session_timeout(), None);
        assert_eq!(cfg.agent.allowed_tools, vec!["Edit"]);
        assert!(cfg.agent.skip_permissions);
        assert_eq!(cfg.remote, "origin");
    }

    #[test]
    fn rejects_invalid_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "poll_interval_secs = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("poll_interval_secs"));

        fs::write(&path, "sessions_dir = \"/abs/sessions\"\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn overrides_win_over_file() {
        let base = WorkerConfig {
            model: Some("sonnet".to_string()),
            ..WorkerConfig::default()
        };
        let merged = base
            .with_overrides(&ConfigOverrides {
                max_sessions: Some(2),
                session_timeout_secs: Some(90),
                unattended: true,
                ..ConfigOverrides::default()
            })
            .expect("merge");
        assert_eq!(merged.max_sessions, 2);
        assert_eq!(merged.session_timeout(), Some(Duration::from_secs(90)));
        assert!(merged.unattended);
        assert_eq!(merged.model.as_deref(), Some("sonnet"));
    }

    #[test]
    fn switching_backend_drops_file_model() {
        let base = WorkerConfig {
            model: Some("sonnet".to_string()),
            ..WorkerConfig::default()
        };
        let merged = base
            .with_overrides(&ConfigOverrides {
                backend: Some(Backend::Codex),
                ..ConfigOverrides::default()
            })
            .expect("merge");
        assert_eq!(merged.model, None);
        assert_eq!(merged.resolve_model(None), None);
    }

    #[test]
    fn model_resolution_order() {
        let cfg = WorkerConfig {
            model: Some("sonnet".to_string()),
            ..WorkerConfig::default()
        };
        assert_eq!(cfg.resolve_model(Some("haiku")).as_deref(), Some("haiku"));
        assert_eq!(cfg.resolve_model(None).as_deref(), Some("sonnet"));
        assert_eq!(
            WorkerConfig::default().resolve_model(Some("  ")).as_deref(),
            Some("opus")
        );
    }
}
