//! Change-request (pull request) access through the `gh` CLI.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

static PR_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://\S+/pull/\d+").expect("valid pull request url regex")
});

/// Fields requested from `gh pr list`.
const PR_LIST_FIELDS: &str = "number,url,state,headRefName";

/// An open change request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub number: Option<u64>,
    pub url: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(rename = "headRefName", default)]
    pub head: Option<String>,
}

/// Aggregate state of the checks attached to a change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksState {
    None,
    Pending,
    Passing,
    Failing,
}

impl ChecksState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksState::None => "none",
            ChecksState::Pending => "pending",
            ChecksState::Passing => "passing",
            ChecksState::Failing => "failing",
        }
    }
}

/// Summary of `gh pr view` state, merge state and checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrStatus {
    pub state: String,
    pub merge_state: Option<String>,
    pub checks: ChecksState,
}

impl PrStatus {
    /// One-line form stored in the session's `config`.
    pub fn summary(&self) -> String {
        format!(
            "{} merge={} checks={}",
            self.state.to_ascii_lowercase(),
            self.merge_state
                .as_deref()
                .map(str::to_ascii_lowercase)
                .unwrap_or_else(|| "unknown".to_string()),
            self.checks.as_str()
        )
    }
}

/// Parameters for opening a change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub base: String,
    pub head: String,
    pub title: String,
    pub body: String,
}

/// Forge operations the worker needs.
pub trait Forge {
    /// The open change request whose head is `head`, if any.
    fn find_open_pr(&self, head: &str) -> Result<Option<PullRequest>>;
    fn view_pr(&self, url: &str) -> Result<PrStatus>;
    /// Open a change request and return its URL.
    fn create_pr(&self, request: &NewPullRequest) -> Result<String>;
}

/// [`Forge`] backed by the GitHub CLI.
#[derive(Debug, Clone)]
pub struct GhForge {
    program: String,
    workdir: PathBuf,
}

impl GhForge {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: "gh".to_string(),
            workdir: workdir.into(),
        }
    }

    fn run_checked(&self, args: &[&str], stdin: Option<&str>) -> Result<Output> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {} {}", self.program, args.join(" ")))?;
        if let Some(input) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            pipe.write_all(input.as_bytes()).context("write gh stdin")?;
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("wait for {} {}", self.program, args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                stderr.trim()
            ));
        }
        Ok(output)
    }
}

impl Forge for GhForge {
    #[instrument(skip_all, fields(head = %head))]
    fn find_open_pr(&self, head: &str) -> Result<Option<PullRequest>> {
        let output = self.run_checked(
            &[
                "pr",
                "list",
                "--state",
                "open",
                "--head",
                head,
                "--json",
                PR_LIST_FIELDS,
                "--limit",
                "1",
            ],
            None,
        )?;
        parse_pr_list(&output.stdout, head)
    }

    #[instrument(skip_all, fields(url = %url))]
    fn view_pr(&self, url: &str) -> Result<PrStatus> {
        let output = self.run_checked(
            &[
                "pr",
                "view",
                url,
                "--json",
                "state,mergeStateStatus,statusCheckRollup",
            ],
            None,
        )?;
        parse_pr_view(&output.stdout)
    }

    #[instrument(skip_all, fields(base = %request.base, head = %request.head))]
    fn create_pr(&self, request: &NewPullRequest) -> Result<String> {
        let output = self.run_checked(
            &[
                "pr",
                "create",
                "--base",
                &request.base,
                "--head",
                &request.head,
                "--title",
                &request.title,
                "--body-file",
                "-",
            ],
            Some(&request.body),
        )?;
        let text = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let url = extract_pr_url(&text)
            .ok_or_else(|| anyhow!("gh pr create printed no pull request url: {}", text.trim()))?;
        debug!(%url, "change request created");
        Ok(url)
    }
}

/// The open change request for `head` in `gh pr list --json` output.
fn parse_pr_list(raw: &[u8], head: &str) -> Result<Option<PullRequest>> {
    let listed: Vec<PullRequest> =
        serde_json::from_slice(raw).context("parse gh pr list output")?;
    debug!(listed = listed.len(), "open change requests for branch");
    Ok(listed.into_iter().find(|pr| {
        pr.head.as_deref().is_none_or(|h| h == head)
            && pr
                .state
                .as_deref()
                .is_none_or(|state| state.eq_ignore_ascii_case("open"))
    }))
}

/// First pull request URL in `text`.
pub fn extract_pr_url(text: &str) -> Option<String> {
    PR_URL_RE.find(text).map(|m| m.as_str().to_string())
}

#[derive(Debug, Deserialize)]
struct GhPrView {
    #[serde(default)]
    state: Option<String>,
    #[serde(rename = "mergeStateStatus", default)]
    merge_state_status: Option<String>,
    #[serde(rename = "statusCheckRollup", default)]
    status_check_rollup: Option<Vec<Value>>,
}

fn parse_pr_view(raw: &[u8]) -> Result<PrStatus> {
    let view: GhPrView = serde_json::from_slice(raw).context("parse gh pr view output")?;
    Ok(PrStatus {
        state: view
            .state
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        merge_state: view
            .merge_state_status
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        checks: summarize_checks(view.status_check_rollup.as_deref().unwrap_or_default()),
    })
}

/// Check runs report `status`/`conclusion`; commit statuses report `state`.
fn summarize_checks(rollup: &[Value]) -> ChecksState {
    if rollup.is_empty() {
        return ChecksState::None;
    }
    let field = |check: &Value, key: &str| {
        check
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_ascii_uppercase)
    };
    let mut pending = false;
    for check in rollup {
        let conclusion = field(check, "conclusion").or_else(|| field(check, "state"));
        match conclusion.as_deref() {
            Some(
                "FAILURE" | "ERROR" | "CANCELLED" | "TIMED_OUT" | "ACTION_REQUIRED"
                | "STARTUP_FAILURE",
            ) => {
                return ChecksState::Failing;
            }
            Some("SUCCESS" | "NEUTRAL" | "SKIPPED") => {}
            _ => pending = true,
        }
    }
    if pending {
        ChecksState::Pending
    } else {
        ChecksState::Passing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_url_from_create_output() {
        let out = "Creating pull request for feature/abc123 into main in acme/repo\n\n\
                   https://github.com/acme/repo/pull/42\n";
        assert_eq!(
            extract_pr_url(out).as_deref(),
            Some("https://github.com/acme/repo/pull/42")
        );
        assert_eq!(extract_pr_url("no url here"), None);
    }

    #[test]
    fn pr_list_matches_open_head_only() {
        let raw = br#"[{
            "number": 7,
            "url": "https://github.com/acme/repo/pull/7",
            "state": "OPEN",
            "headRefName": "feature/abc123"
        }]"#;
        let found = parse_pr_list(raw, "feature/abc123").expect("parse");
        assert_eq!(found.as_ref().and_then(|pr| pr.number), Some(7));
        assert_eq!(
            found.map(|pr| pr.url).as_deref(),
            Some("https://github.com/acme/repo/pull/7")
        );

        assert_eq!(parse_pr_list(raw, "feature/other").expect("parse"), None);
        let merged = br#"[{
            "url": "https://github.com/acme/repo/pull/8",
            "state": "MERGED",
            "headRefName": "feature/abc123"
        }]"#;
        assert_eq!(parse_pr_list(merged, "feature/abc123").expect("parse"), None);
        assert_eq!(parse_pr_list(b"[]", "feature/abc123").expect("parse"), None);
    }

    #[test]
    fn summarizes_pr_view() {
        let raw = br#"{"state":"OPEN","mergeStateStatus":"BLOCKED","statusCheckRollup":[
            {"__typename":"CheckRun","status":"COMPLETED","conclusion":"SUCCESS"},
            {"__typename":"StatusContext","state":"PENDING"}
        ]}"#;
        let status = parse_pr_view(raw).expect("parse");
        assert_eq!(status.state, "OPEN");
        assert_eq!(status.merge_state.as_deref(), Some("BLOCKED"));
        assert_eq!(status.checks, ChecksState::Pending);
        assert_eq!(status.summary(), "open merge=blocked checks=pending");
    }

    #[test]
    fn any_failed_check_fails_the_rollup() {
        let rollup: Vec<Value> = serde_json::from_str(
            r#"[
                {"status":"COMPLETED","conclusion":"SUCCESS"},
                {"status":"COMPLETED","conclusion":"FAILURE"}
            ]"#,
        )
        .expect("json");
        assert_eq!(summarize_checks(&rollup), ChecksState::Failing);
        assert_eq!(summarize_checks(&[]), ChecksState::None);
    }

    #[test]
    fn in_progress_check_run_is_pending() {
        let rollup: Vec<Value> =
            serde_json::from_str(r#"[{"status":"IN_PROGRESS","conclusion":""}]"#).expect("json");
        assert_eq!(summarize_checks(&rollup), ChecksState::Pending);
    }

    #[test]
    fn empty_view_defaults() {
        let status = parse_pr_view(b"{}").expect("parse");
        assert_eq!(status.summary(), "unknown merge=unknown checks=none");
    }
}
