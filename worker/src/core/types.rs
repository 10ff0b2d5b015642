//! Session record model and its lifecycle rules.
//!
//! A session is one unit of queued agent work persisted as a JSON file in the
//! shared store. Records are created by other tools, so unknown fields are
//! carried through untouched via [`Session::extra`].

use std::fmt;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `config` key holding the resumable agent conversation id.
pub const CONFIG_RESUME_ID: &str = "resume_session_id";
/// `config` key holding the delivered change-request URL.
pub const CONFIG_PR_URL: &str = "pr_url";
/// `config` key holding a short summary of the change request state.
pub const CONFIG_PR_STATE: &str = "pr_state";
/// `config` key holding the diagnostic change-request URL.
pub const CONFIG_DIAGNOSTIC_URL: &str = "diagnostic_pr_url";
/// `config` key holding the agent's final exit code.
pub const CONFIG_EXIT_CODE: &str = "exit_code";
/// `config` key holding the branch the agent delivered on.
pub const CONFIG_WORKER_BRANCH: &str = "worker_branch";

/// Maximum stored length of `error_message`, in characters.
pub const ERROR_MESSAGE_LIMIT: usize = 1000;

/// Lifecycle status of a session.
///
/// Transitions only move forward: `queued -> active -> {completed, failed, stopped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Queued,
    Active,
    Completed,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Queued => "queued",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Stopped
        )
    }

    /// True if moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        match (self, next) {
            (SessionStatus::Queued, SessionStatus::Active) => true,
            (SessionStatus::Active, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted session record (`<sessions_dir>/<id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    /// Worker-pool selector used by the default discovery filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Open map for derived/linked state (resume id, change-request URLs).
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Fields this worker does not know about, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Session {
    /// Create a minimal queued session (mostly useful for tests and tooling).
    pub fn queued(
        id: impl Into<String>,
        provider: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            status: SessionStatus::Queued,
            provider: Some(provider.into()),
            task_ids: Vec::new(),
            task_id: None,
            prompt: prompt.into(),
            model: None,
            claimed_by: None,
            claimed_at: None,
            started_at: None,
            completed_at: None,
            updated_at: None,
            error_message: None,
            config: Map::new(),
            extra: Map::new(),
        }
    }

    /// Move to `next`, refusing backward or sideways transitions.
    pub fn transition(&mut self, next: SessionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(anyhow!(
                "session {}: illegal status transition {} -> {}",
                self.id,
                self.status,
                next
            ));
        }
        self.status = next;
        Ok(())
    }

    /// All referenced task ids, `task_ids` first, then `task_id` if not already listed.
    pub fn task_refs(&self) -> Vec<String> {
        let mut refs = self.task_ids.clone();
        if let Some(id) = &self.task_id
            && !refs.iter().any(|r| r == id)
        {
            refs.push(id.clone());
        }
        refs
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    pub fn set_config(&mut self, key: &str, value: impl Into<Value>) {
        self.config.insert(key.to_string(), value.into());
    }

    /// Append `context` to `error_message`, keeping the stored text bounded.
    pub fn append_error(&mut self, context: &str) {
        let combined = match self.error_message.take() {
            Some(existing) if !existing.trim().is_empty() => format!("{existing}\n{context}"),
            _ => context.to_string(),
        };
        self.error_message = Some(truncate_chars(&combined, ERROR_MESSAGE_LIMIT));
    }
}

/// Truncate to at most `limit` characters, marking the cut.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}…", &text[..cut]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        assert!(SessionStatus::Queued.can_transition_to(SessionStatus::Active));
        assert!(SessionStatus::Active.can_transition_to(SessionStatus::Completed));
        assert!(SessionStatus::Active.can_transition_to(SessionStatus::Failed));
        assert!(SessionStatus::Active.can_transition_to(SessionStatus::Stopped));
        assert!(!SessionStatus::Queued.can_transition_to(SessionStatus::Completed));
        assert!(!SessionStatus::Active.can_transition_to(SessionStatus::Queued));
        assert!(!SessionStatus::Completed.can_transition_to(SessionStatus::Failed));
        assert!(!SessionStatus::Failed.can_transition_to(SessionStatus::Active));
    }

    #[test]
    fn transition_rejects_terminal_mutation() {
        let mut session = Session::queued("s1", "self-hosted", "do it");
        session.transition(SessionStatus::Active).expect("claim");
        session.transition(SessionStatus::Completed).expect("complete");
        let err = session.transition(SessionStatus::Failed).unwrap_err();
        assert!(err.to_string().contains("completed -> failed"));
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = r#"{
            "id": "a",
            "status": "queued",
            "provider": "self-hosted",
            "prompt": "p",
            "board": {"lane": 3},
            "priority": "high"
        }"#;
        let session: Session = serde_json::from_str(raw).expect("parse");
        assert_eq!(session.extra.get("priority"), Some(&Value::from("high")));
        let back = serde_json::to_value(&session).expect("serialize");
        assert_eq!(back["board"]["lane"], Value::from(3));
        assert_eq!(back["priority"], Value::from("high"));
    }

    #[test]
    fn task_refs_merges_singular_and_plural() {
        let mut session = Session::queued("s1", "self-hosted", "p");
        session.task_ids = vec!["T-1".to_string(), "T-2".to_string()];
        session.task_id = Some("T-2".to_string());
        assert_eq!(session.task_refs(), vec!["T-1", "T-2"]);
        session.task_id = Some("T-3".to_string());
        assert_eq!(session.task_refs(), vec!["T-1", "T-2", "T-3"]);
    }

    #[test]
    fn append_error_is_bounded() {
        let mut session = Session::queued("s1", "self-hosted", "p");
        session.append_error("first");
        session.append_error(&"x".repeat(2 * ERROR_MESSAGE_LIMIT));
        let msg = session.error_message.expect("error message");
        assert!(msg.starts_with("first\n"));
        assert_eq!(msg.chars().count(), ERROR_MESSAGE_LIMIT + 1);
    }
}
