//! Everything one worker needs to process sessions, built once in `main`.

use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};

use crate::core::prompt::DeliveryTarget;
use crate::core::types::Session;
use crate::io::agent::AgentRunner;
use crate::io::config::WorkerConfig;
use crate::io::forge::Forge;
use crate::io::git::Git;
use crate::io::session_store::{SessionFilter, SessionStore};
use crate::io::shutdown::ShutdownToken;

pub struct WorkerContext<'a> {
    pub git: Git,
    pub store: SessionStore,
    pub agent: &'a dyn AgentRunner,
    pub forge: &'a dyn Forge,
    pub config: &'a WorkerConfig,
    pub shutdown: ShutdownToken,
    /// Recorded as `claimed_by`.
    pub worker_id: String,
}

impl<'a> WorkerContext<'a> {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        config: &'a WorkerConfig,
        agent: &'a dyn AgentRunner,
        forge: &'a dyn Forge,
        shutdown: ShutdownToken,
    ) -> Self {
        let repo_root = repo_root.into();
        Self {
            git: Git::new(repo_root.clone()),
            store: SessionStore::new(repo_root, &config.sessions_dir),
            agent,
            forge,
            config,
            shutdown,
            worker_id: config.worker_id(),
        }
    }

    pub fn remote(&self) -> &str {
        &self.config.remote
    }

    pub fn default_branch(&self) -> &str {
        &self.config.default_branch
    }

    /// Discovery filter for this worker's provider.
    pub fn filter(&self) -> SessionFilter {
        SessionFilter::queued_for(self.config.provider.clone())
    }

    pub fn delivery_target(&self, session: &Session) -> DeliveryTarget {
        DeliveryTarget {
            session_id: session.id.clone(),
            task_refs: session.task_refs(),
            remote: self.config.remote.clone(),
            default_branch: self.config.default_branch.clone(),
            sessions_dir: self.config.sessions_dir.clone(),
        }
    }
}

/// Current UTC time as stored in session records.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
