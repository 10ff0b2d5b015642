//! Test-only helpers: throwaway git remotes, a scripted agent and an in-memory forge.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::Session;
use crate::io::agent::{AgentRequest, AgentRun, AgentRunner};
use crate::io::config::WorkerConfig;
use crate::io::forge::{ChecksState, Forge, NewPullRequest, PrStatus, PullRequest};

/// Run git in `dir`, panicking with stderr on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {} failed in {}: {}",
        args.join(" "),
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Write `rel` under `dir` and commit it.
pub fn commit_file(dir: &Path, rel: &str, contents: &str, message: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(&path, contents).expect("write file");
    git(dir, &["add", "--", rel]);
    git(dir, &["commit", "-q", "-m", message]);
}

/// A bare "shared" remote plus a seeded working clone.
pub struct TestRepo {
    temp: TempDir,
    pub remote: PathBuf,
    pub work: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let remote = temp.path().join("remote.git");
        git(temp.path(), &["init", "-q", "--bare", "remote.git"]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        let work = temp.path().join("work");
        fs::create_dir_all(&work).expect("create work");
        git(&work, &["init", "-q"]);
        configure_identity(&work);
        git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        let remote_arg = remote.to_string_lossy().to_string();
        git(&work, &["remote", "add", "origin", &remote_arg]);
        commit_file(&work, "README.md", "# fixture\n", "init");
        commit_file(&work, ".orchestrator/sessions/.gitkeep", "", "sessions dir");
        git(&work, &["push", "-q", "-u", "origin", "main"]);

        Self { temp, remote, work }
    }

    /// Another independent clone of the remote (a second worker machine).
    pub fn clone_worker(&self, name: &str) -> PathBuf {
        let remote_arg = self.remote.to_string_lossy().to_string();
        git(self.temp.path(), &["clone", "-q", &remote_arg, name]);
        let dir = self.temp.path().join(name);
        configure_identity(&dir);
        dir
    }

    /// Commit `session` from the seed clone and push it.
    pub fn seed_session(&self, session: &Session) {
        git(&self.work, &["pull", "-q", "--rebase", "origin", "main"]);
        let rel = format!(".orchestrator/sessions/{}.json", session.id);
        let mut json = serde_json::to_string_pretty(session).expect("serialize session");
        json.push('\n');
        commit_file(&self.work, &rel, &json, &format!("queue session {}", session.id));
        git(&self.work, &["push", "-q", "origin", "main"]);
    }

    /// The session record as it is on the remote's default branch.
    pub fn remote_session(&self, id: &str) -> Session {
        let object = format!("main:.orchestrator/sessions/{id}.json");
        let raw = git(&self.remote, &["show", &object]);
        serde_json::from_str(&raw).expect("parse remote session")
    }

    /// True if `branch` exists on the remote.
    pub fn remote_has_branch(&self, branch: &str) -> bool {
        let refname = format!("refs/heads/{branch}");
        !git(&self.remote, &["for-each-ref", &refname]).is_empty()
    }

    /// Fast test config: short polls and no self-update.
    pub fn config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: Some("test-worker".to_string()),
            poll_interval_secs: 1,
            session_timeout_secs: 30,
            kill_grace_secs: 1,
            result_grace_secs: 0,
            ..WorkerConfig::default()
        }
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn configure_identity(dir: &Path) {
    git(dir, &["config", "user.email", "worker@example.test"]);
    git(dir, &["config", "user.name", "Session Worker Tests"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

type Step = Box<dyn FnOnce(&AgentRequest) -> AgentRun + Send>;

/// [`AgentRunner`] that plays back closures in order and records every request.
#[derive(Default)]
pub struct ScriptedAgent {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the behaviour of the next run.
    pub fn then(self, step: impl FnOnce(&AgentRequest) -> AgentRun + Send + 'static) -> Self {
        self.steps
            .lock()
            .expect("steps lock")
            .push_back(Box::new(step));
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl AgentRunner for ScriptedAgent {
    fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests lock poisoned"))?
            .push(request.clone());
        let step = self
            .steps
            .lock()
            .map_err(|_| anyhow!("steps lock poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no step left"))?;
        Ok(step(request))
    }
}

/// Successful run that reported `resume_id`.
pub fn finished(resume_id: &str) -> AgentRun {
    AgentRun {
        resume_id: Some(resume_id.to_string()),
        stdout_tail: "done\n".to_string(),
        ..AgentRun::default()
    }
}

#[derive(Debug, Default)]
struct ForgeState {
    open: Vec<(String, String)>,
    created: Vec<NewPullRequest>,
}

/// In-memory [`Forge`].
#[derive(Debug, Default)]
pub struct FakeForge {
    state: Mutex<ForgeState>,
}

impl FakeForge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a change request from `head` is already open.
    pub fn add_open_pr(&self, head: &str, url: &str) {
        self.state
            .lock()
            .expect("forge lock")
            .open
            .push((head.to_string(), url.to_string()));
    }

    /// Change requests opened through [`Forge::create_pr`].
    pub fn created(&self) -> Vec<NewPullRequest> {
        self.state.lock().expect("forge lock").created.clone()
    }
}

impl Forge for FakeForge {
    fn find_open_pr(&self, head: &str) -> Result<Option<PullRequest>> {
        let state = self.state.lock().map_err(|_| anyhow!("forge lock poisoned"))?;
        Ok(state
            .open
            .iter()
            .find(|(h, _)| h == head)
            .map(|(h, url)| PullRequest {
                number: None,
                url: url.clone(),
                state: Some("OPEN".to_string()),
                head: Some(h.clone()),
            }))
    }

    fn view_pr(&self, _url: &str) -> Result<PrStatus> {
        Ok(PrStatus {
            state: "OPEN".to_string(),
            merge_state: Some("CLEAN".to_string()),
            checks: ChecksState::None,
        })
    }

    fn create_pr(&self, request: &NewPullRequest) -> Result<String> {
        let mut state = self.state.lock().map_err(|_| anyhow!("forge lock poisoned"))?;
        if state.open.iter().any(|(head, _)| head == &request.head) {
            return Err(anyhow!("a pull request for {} already exists", request.head));
        }
        let url = format!(
            "https://forge.example.test/acme/repo/pull/{}",
            state.created.len() + 1
        );
        state.created.push(request.clone());
        state.open.push((request.head.clone(), url.clone()));
        Ok(url)
    }
}
