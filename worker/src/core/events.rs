//! Parsing of line-delimited JSON events emitted by streaming agent CLIs.
//!
//! Only the handful of fields the worker acts on are modelled: the event
//! `type`, the resumable conversation id, and text content for live output.
//! Lines that are not JSON objects are passed through untouched by callers.

use serde::Deserialize;
use serde_json::Value;

/// One decoded stream event.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub subtype: Option<String>,
    /// Conversation id (claude, cursor).
    #[serde(default)]
    pub session_id: Option<String>,
    /// Conversation id (codex `thread.started`).
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Raw API event wrapped by `stream_event`.
    #[serde(default)]
    pub event: Option<Value>,
    #[serde(default)]
    pub message: Option<Value>,
    /// Codex item payload.
    #[serde(default)]
    pub item: Option<Value>,
}

/// Decode a stdout line, returning `None` for anything that is not an event object.
pub fn parse_event(line: &str) -> Option<AgentEvent> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

impl AgentEvent {
    /// Resumable conversation id carried by this event, if any.
    pub fn resume_id(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .or(self.thread_id.as_deref())
            .filter(|id| !id.trim().is_empty())
    }

    /// True for the event that closes the agent's conversation turn.
    pub fn is_result(&self) -> bool {
        self.kind == "result" || self.kind == "turn.completed"
    }

    /// Incremental text from a partial-output `stream_event`.
    pub fn text_delta(&self) -> Option<&str> {
        if self.kind != "stream_event" {
            return None;
        }
        let delta = self.event.as_ref()?.get("delta")?;
        if delta.get("type")?.as_str()? != "text_delta" {
            return None;
        }
        delta.get("text")?.as_str()
    }

    /// Full text of an assistant message (claude/cursor) or agent message item (codex).
    pub fn message_text(&self) -> Option<String> {
        match self.kind.as_str() {
            "assistant" => {
                let content = self.message.as_ref()?.get("content")?.as_array()?;
                let text: Vec<&str> = content
                    .iter()
                    .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect();
                if text.is_empty() {
                    None
                } else {
                    Some(text.join(""))
                }
            }
            "item.completed" => {
                let item = self.item.as_ref()?;
                if item.get("type")?.as_str()? != "agent_message" {
                    return None;
                }
                item.get("text")?.as_str().map(str::to_string)
            }
            _ => None,
        }
    }
}

/// Turns a stream of events into human-readable text.
///
/// When the backend emits partial deltas it also emits the complete message
/// afterwards; once any delta has been seen, complete messages are skipped.
#[derive(Debug, Default)]
pub struct StreamRenderer {
    seen_delta: bool,
}

impl StreamRenderer {
    pub fn render(&mut self, event: &AgentEvent) -> Option<String> {
        if let Some(delta) = event.text_delta() {
            self.seen_delta = true;
            return Some(delta.to_string());
        }
        if event.is_result() {
            return Some("\n".to_string());
        }
        if self.seen_delta {
            return None;
        }
        event.message_text().map(|text| format!("{text}\n"))
    }
}
