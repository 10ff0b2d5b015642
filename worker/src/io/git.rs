//! Git adapter for worker commands.
//!
//! The remote is the only cross-worker synchronization primitive, so every
//! operation here is an explicit `git` subprocess call with its stderr folded
//! into the error on failure.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD in {}", self.workdir.display()));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Tree object id of `path` at HEAD, or `None` if the path is not tracked.
    pub fn tree_hash(&self, path: &str) -> Result<Option<String>> {
        let spec = format!("HEAD:{path}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True if there are uncommitted or untracked changes.
    pub fn has_local_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    /// True if `path` differs from HEAD (modified, staged or untracked).
    pub fn path_has_changes(&self, path: &Path) -> Result<bool> {
        let path = path.to_string_lossy();
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall", "--", &path])?;
        Ok(!out.trim().is_empty())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Stage and commit exactly `paths`, leaving anything else in the index alone.
    #[instrument(skip_all, fields(message = %message))]
    pub fn commit_paths(&self, message: &str, paths: &[&Path]) -> Result<()> {
        let mut add = vec!["add".to_string(), "--".to_string()];
        let mut commit = vec![
            "commit".to_string(),
            "-m".to_string(),
            message.to_string(),
            "--".to_string(),
        ];
        for path in paths {
            let path = path.to_string_lossy().to_string();
            add.push(path.clone());
            commit.push(path);
        }
        self.run_checked_owned(&add)?;
        self.run_checked_owned(&commit)?;
        debug!(message, "committed");
        Ok(())
    }

    /// Push `branch` to `remote`. A rejection is returned as an error.
    #[instrument(skip_all, fields(remote = %remote, branch = %branch))]
    pub fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["push", remote, branch])?;
        debug!(remote, branch, "pushed");
        Ok(())
    }

    /// Push `branch` and set its upstream.
    #[instrument(skip_all, fields(remote = %remote, branch = %branch))]
    pub fn push_upstream(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["push", "-u", remote, branch])?;
        debug!(remote, branch, "pushed with upstream");
        Ok(())
    }

    /// `git pull --rebase`; an interrupted rebase is aborted before the error is returned.
    #[instrument(skip_all, fields(remote = %remote, branch = %branch))]
    pub fn pull_rebase(&self, remote: &str, branch: &str) -> Result<()> {
        if let Err(err) = self.run_checked(&["pull", "--rebase", remote, branch]) {
            self.rebase_abort();
            return Err(err);
        }
        Ok(())
    }

    /// Abort an in-progress rebase; a no-op when none is running.
    pub fn rebase_abort(&self) {
        if let Ok(out) = self.run(&["rebase", "--abort"])
            && out.status.success()
        {
            warn!("aborted in-progress rebase");
        }
    }

    /// Hard reset the current branch to `rev`.
    #[instrument(skip_all, fields(rev = %rev))]
    pub fn reset_hard(&self, rev: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", rev])?;
        debug!(rev, "reset");
        Ok(())
    }

    /// Stash everything including untracked files. Returns `false` if the tree was clean.
    #[instrument(skip_all)]
    pub fn stash_all(&self, message: &str) -> Result<bool> {
        if !self.has_local_changes()? {
            return Ok(false);
        }
        self.run_checked(&["stash", "push", "--include-untracked", "-m", message])?;
        let stash = self.run_capture(&["rev-parse", "refs/stash"])?;
        warn!(message, stash = %stash.trim(), "stashed leftover changes");
        Ok(true)
    }

    /// Drop all but the newest `keep` stash entries whose message contains `marker`.
    ///
    /// Other stashes are never touched. Returns the number of entries dropped.
    #[instrument(skip_all, fields(marker = %marker, keep = keep))]
    pub fn prune_stashes(&self, marker: &str, keep: usize) -> Result<usize> {
        let out = self.run_capture(&["stash", "list", "--format=%gd %gs"])?;
        let stale: Vec<&str> = out
            .lines()
            .filter(|line| line.contains(marker))
            .skip(keep)
            .filter_map(|line| line.split_whitespace().next())
            .collect();
        // Highest index first so the remaining references stay valid.
        for reference in stale.iter().rev() {
            self.run_checked(&["stash", "drop", "--quiet", reference])?;
        }
        if !stale.is_empty() {
            debug!(dropped = stale.len(), "pruned old stashes");
        }
        Ok(stale.len())
    }

    /// SHA of `branch` on `remote`, or `None` if the remote has no such branch.
    pub fn remote_branch_sha(&self, remote: &str, branch: &str) -> Result<Option<String>> {
        let refname = format!("refs/heads/{branch}");
        let out = self.run_capture(&["ls-remote", "--heads", remote, &refname])?;
        Ok(out
            .lines()
            .find_map(|line| line.split_whitespace().next())
            .map(str::to_string))
    }

    /// True if `remote` already has the local tip of `branch`.
    pub fn is_pushed(&self, remote: &str, branch: &str) -> Result<bool> {
        let local = self.run_capture(&["rev-parse", &format!("refs/heads/{branch}")])?;
        let remote_sha = self.remote_branch_sha(remote, branch)?;
        Ok(remote_sha.as_deref() == Some(local.trim()))
    }

    pub(crate) fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub(crate) fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run_checked_owned(&self, args: &[String]) -> Result<Output> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&args)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
