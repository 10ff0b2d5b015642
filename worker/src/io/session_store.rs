//! Session records persisted as `<sessions_dir>/<id>.json` inside the repository.
//!
//! Discovery is lenient (a bad file is skipped with a warning); a direct read
//! is strict. Writes go through a temp file and a rename so a crash never
//! leaves a half-written record behind.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, FixedOffset};
use tracing::{debug, warn};

use crate::core::types::{Session, SessionStatus};

/// Provider tag selected by the default discovery filter.
pub const DEFAULT_PROVIDER: &str = "self-hosted";

/// Directory-backed session store.
#[derive(Debug, Clone)]
pub struct SessionStore {
    repo_root: PathBuf,
    rel_dir: PathBuf,
}

/// Consumer-side filter over listed sessions.
#[derive(Debug, Clone)]
pub struct SessionFilter {
    /// Disable filtering entirely.
    pub all: bool,
    pub provider: String,
}

impl SessionFilter {
    pub fn queued_for(provider: impl Into<String>) -> Self {
        Self {
            all: false,
            provider: provider.into(),
        }
    }

    pub fn matches(&self, session: &Session) -> bool {
        self.all
            || (session.status == SessionStatus::Queued
                && session.provider.as_deref() == Some(self.provider.as_str()))
    }
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self::queued_for(DEFAULT_PROVIDER)
    }
}

impl SessionStore {
    /// `rel_dir` is relative to `repo_root` and is what gets committed.
    pub fn new(repo_root: impl Into<PathBuf>, rel_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            rel_dir: rel_dir.into(),
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.repo_root.join(&self.rel_dir)
    }

    /// Repository-relative path of a session file, for staging and committing.
    pub fn rel_path(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.rel_dir.join(format!("{id}.json")))
    }

    pub fn path_for(&self, id: &str) -> Result<PathBuf> {
        Ok(self.repo_root.join(self.rel_path(id)?))
    }

    /// Every parseable record, oldest `started_at` first.
    pub fn list(&self) -> Result<Vec<Session>> {
        let dir = self.dir();
        if !dir.exists() {
            debug!(dir = %dir.display(), "sessions directory missing");
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read dir entry in {}", dir.display()))?;
            let path = entry.path();
            if !is_record_file(&path) {
                continue;
            }
            match load_listed(&path) {
                Ok(session) => sessions.push(session),
                Err(err) => warn!(
                    path = %path.display(),
                    err = %format!("{err:#}"),
                    "skipping malformed session"
                ),
            }
        }
        sort_sessions(&mut sessions);
        Ok(sessions)
    }

    /// Listed sessions that pass `filter`, in queue order.
    pub fn list_filtered(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|session| filter.matches(session))
            .collect())
    }

    /// The single oldest session matching `filter`.
    pub fn oldest_queued(&self, filter: &SessionFilter) -> Result<Option<Session>> {
        Ok(self.list_filtered(filter)?.into_iter().next())
    }

    /// Strict read: missing or malformed records are errors.
    pub fn read(&self, id: &str) -> Result<Session> {
        let path = self.path_for(id)?;
        if !path.exists() {
            bail!("session {id} not found at {}", path.display());
        }
        let session = load(&path)?;
        if session.id != id {
            bail!(
                "session file {} carries id {:?}, expected {id:?}",
                path.display(),
                session.id
            );
        }
        Ok(session)
    }

    /// Atomically replace the record (temp file + rename).
    pub fn write(&self, session: &Session) -> Result<PathBuf> {
        let path = self.path_for(&session.id)?;
        let parent = path
            .parent()
            .with_context(|| format!("session path missing parent {}", path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let mut buf = serde_json::to_string_pretty(session).context("serialize session")?;
        buf.push('\n');
        let tmp_path = parent.join(format!(".{}.json.tmp", session.id));
        fs::write(&tmp_path, buf)
            .with_context(|| format!("write temp session {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("replace session {}", path.display()))?;
        debug!(session_id = %session.id, status = %session.status, "session written");
        Ok(path)
    }
}

/// Ids double as file names, so keep them to a safe charset.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("session id must not be empty"));
    }
    if id.starts_with('.') {
        return Err(anyhow!("session id {id:?} must not start with '.'"));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(anyhow!("session id {id:?} contains invalid character {bad:?}"));
    }
    Ok(())
}

fn is_record_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.') && name.ends_with(".json") && path.is_file()
}

fn load(path: &Path) -> Result<Session> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read session {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse session {}", path.display()))
}

/// A listed record must be claimable later: its id has to be valid and match the file stem.
fn load_listed(path: &Path) -> Result<Session> {
    let session = load(path)?;
    validate_id(&session.id)?;
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    if session.id != stem {
        bail!("session file carries id {:?}, expected {stem:?}", session.id);
    }
    Ok(session)
}

fn started_at(session: &Session) -> Option<DateTime<FixedOffset>> {
    session
        .started_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
}

/// Oldest first; undated records last, by id.
pub fn sort_sessions(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| match (started_at(a), started_at(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path(), ".orchestrator/sessions");
        (temp, store)
    }

    fn dated(id: &str, started_at: Option<&str>) -> Session {
        let mut session = Session::queued(id, DEFAULT_PROVIDER, "p");
        session.started_at = started_at.map(str::to_string);
        session
    }

    #[test]
    fn list_orders_by_started_at_regardless_of_names() {
        let (_temp, store) = store();
        store.write(&dated("a-newest", Some("2026-03-01T00:00:00Z"))).expect("write");
        store.write(&dated("z-oldest", Some("2026-01-01T00:00:00Z"))).expect("write");
        store.write(&dated("m-offset", Some("2026-02-01T05:00:00+05:00"))).expect("write");
        store.write(&dated("b-undated", None)).expect("write");
        store.write(&dated("a-undated", Some("not a date"))).expect("write");

        let ids: Vec<String> = store.list().expect("list").into_iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            vec!["z-oldest", "m-offset", "a-newest", "a-undated", "b-undated"]
        );
    }

    #[test]
    fn list_skips_malformed_and_temp_files() {
        let (_temp, store) = store();
        store.write(&dated("good", None)).expect("write");
        fs::write(store.dir().join("broken.json"), "{not json").expect("write broken");
        fs::write(store.dir().join(".good.json.tmp"), "{}").expect("write tmp");
        fs::write(store.dir().join("notes.txt"), "hello").expect("write txt");

        let sessions = store.list().expect("list");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "good");
    }

    #[test]
    fn list_skips_records_that_cannot_be_claimed() {
        let (_temp, store) = store();
        store
            .write(&dated("good01", Some("2026-02-01T00:00:00Z")))
            .expect("write");
        let stray = dated("other", Some("2026-01-01T00:00:00Z"));
        let bad_id = dated("bad id", Some("2026-01-02T00:00:00Z"));
        for (name, session) in [("stray.json", &stray), ("bad id.json", &bad_id)] {
            let json = serde_json::to_string(session).expect("serialize");
            fs::write(store.dir().join(name), json).expect("write record");
        }

        let next = store
            .oldest_queued(&SessionFilter::default())
            .expect("oldest");
        assert_eq!(next.map(|s| s.id).as_deref(), Some("good01"));
        assert_eq!(store.list().expect("list").len(), 1);
    }

    #[test]
    fn read_is_strict() {
        let (_temp, store) = store();
        fs::create_dir_all(store.dir()).expect("mkdir");
        fs::write(store.dir().join("broken.json"), "{not json").expect("write broken");
        let err = store.read("broken").unwrap_err();
        assert!(format!("{err:#}").contains("parse session"));
        let err = store.read("missing").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn write_leaves_no_temp_file() {
        let (_temp, store) = store();
        let path = store.write(&dated("s1", None)).expect("write");
        assert!(path.ends_with(".orchestrator/sessions/s1.json"));
        assert!(!store.dir().join(".s1.json.tmp").exists());
        assert_eq!(store.read("s1").expect("read").id, "s1");
    }

    #[test]
    fn default_filter_selects_queued_self_hosted() {
        let (_temp, store) = store();
        let mut active = dated("active", Some("2026-01-01T00:00:00Z"));
        active.status = SessionStatus::Active;
        let mut cloud = dated("cloud", Some("2026-01-02T00:00:00Z"));
        cloud.provider = Some("cloud".to_string());
        store.write(&active).expect("write");
        store.write(&cloud).expect("write");
        store.write(&dated("mine", Some("2026-01-03T00:00:00Z"))).expect("write");

        let next = store.oldest_queued(&SessionFilter::default()).expect("oldest");
        assert_eq!(next.map(|s| s.id).as_deref(), Some("mine"));

        let all = SessionFilter {
            all: true,
            provider: DEFAULT_PROVIDER.to_string(),
        };
        assert_eq!(store.list_filtered(&all).expect("list").len(), 3);
    }

    #[test]
    fn rejects_unsafe_ids() {
        assert!(validate_id("abc-123_x.y").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id(".hidden").is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("a b").is_err());
    }
}
