//! Agent prompt preparation.
//!
//! Session prompts may start with a fenced metadata block (template front
//! matter). That block is for tooling, not the agent, and is removed before
//! the prompt is handed over.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::delivery::RecoveryReason;

/// Line that opens and closes a metadata block.
pub const METADATA_FENCE: &str = "---";

const UNATTENDED_TEMPLATE: &str = include_str!("../templates/unattended.md");
const RECOVERY_INCOMPLETE_TEMPLATE: &str =
    include_str!("../templates/recovery_incomplete_delivery.md");
const RECOVERY_NO_PR_TEMPLATE: &str = include_str!("../templates/recovery_no_pr.md");
const RECOVERY_GENERIC_TEMPLATE: &str = include_str!("../templates/recovery_generic.md");

/// Repository facts the directive and recovery templates refer to.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryTarget {
    pub session_id: String,
    pub task_refs: Vec<String>,
    pub remote: String,
    pub default_branch: String,
    pub sessions_dir: String,
}

/// Remove a leading `---` delimited metadata block.
///
/// A prompt without an opening fence, or whose block is never closed, is
/// returned unchanged (minus surrounding whitespace).
pub fn strip_metadata_block(prompt: &str) -> &str {
    let trimmed = prompt.trim_start();
    let mut lines = trimmed.split_inclusive('\n');
    let mut offset = match lines.next() {
        Some(first) if first.trim_end() == METADATA_FENCE => first.len(),
        _ => return prompt.trim(),
    };

    for line in lines {
        offset += line.len();
        if line.trim_end() == METADATA_FENCE {
            return trimmed[offset..].trim();
        }
    }
    prompt.trim()
}

/// Build the exact text handed to the agent for a fresh session run.
pub fn build_agent_prompt(
    prompt: &str,
    unattended: bool,
    target: &DeliveryTarget,
) -> Result<String> {
    let body = strip_metadata_block(prompt);
    if !unattended {
        return Ok(body.to_string());
    }
    let directive = render(UNATTENDED_TEMPLATE, target, None)?;
    Ok(format!("{body}\n\n{directive}\n"))
}

/// Follow-up instruction sent when resuming the agent for `reason`.
pub fn recovery_prompt(
    reason: RecoveryReason,
    target: &DeliveryTarget,
    branch: Option<&str>,
) -> Result<String> {
    let template = match reason {
        RecoveryReason::IncompleteDelivery => RECOVERY_INCOMPLETE_TEMPLATE,
        RecoveryReason::NoPr => RECOVERY_NO_PR_TEMPLATE,
        RecoveryReason::Generic => RECOVERY_GENERIC_TEMPLATE,
    };
    render(template, target, branch)
}

fn render(source: &str, target: &DeliveryTarget, branch: Option<&str>) -> Result<String> {
    let env = Environment::new();
    let rendered = env.render_str(
        source,
        context! {
            session_id => &target.session_id,
            task_refs => &target.task_refs,
            remote => &target.remote,
            default_branch => &target.default_branch,
            sessions_dir => &target.sessions_dir,
            branch => branch.unwrap_or(""),
        },
    )?;
    Ok(rendered.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> DeliveryTarget {
        DeliveryTarget {
            session_id: "abc123".to_string(),
            task_refs: vec!["T-0007".to_string()],
            remote: "origin".to_string(),
            default_branch: "main".to_string(),
            sessions_dir: ".orchestrator/sessions".to_string(),
        }
    }

    #[test]
    fn strips_leading_metadata_block() {
        assert_eq!(
            strip_metadata_block("---\nkey: val\n---\nBody text"),
            "Body text"
        );
    }

    #[test]
    fn strips_block_with_crlf_and_blank_lines() {
        let prompt = "---\r\ntemplate: fix-bug\r\nowner: ops\r\n---\r\n\r\nFix the bug.\r\n";
        assert_eq!(strip_metadata_block(prompt), "Fix the bug.");
    }

    #[test]
    fn keeps_prompt_without_fence() {
        assert_eq!(strip_metadata_block("  Just do it\n"), "Just do it");
    }

    #[test]
    fn keeps_prompt_with_unclosed_fence() {
        let prompt = "---\nkey: val\nno closing fence";
        assert_eq!(strip_metadata_block(prompt), prompt);
    }

    #[test]
    fn fence_later_in_prompt_is_body() {
        let prompt = "Intro\n---\nkey: val\n---\nrest";
        assert_eq!(strip_metadata_block(prompt), prompt);
    }

    #[test]
    fn attended_prompt_has_no_directive() {
        let out = build_agent_prompt("---\na: b\n---\nBody", false, &target()).expect("build");
        assert_eq!(out, "Body");
    }

    #[test]
    fn unattended_prompt_appends_directive() {
        let out = build_agent_prompt("---\na: b\n---\nBody", true, &target()).expect("build");
        assert!(out.starts_with("Body\n\n## Unattended mode"));
        assert!(out.contains("Do not ask clarifying questions"));
        assert!(out.contains("`feature/abc123`"));
        assert!(out.contains("references T-0007"));
        assert!(!out.contains("a: b"));
    }

    #[test]
    fn recovery_prompts_are_reason_specific() {
        let incomplete =
            recovery_prompt(RecoveryReason::IncompleteDelivery, &target(), None).expect("render");
        assert!(incomplete.contains("uncommitted changes on `main`"));

        let no_pr = recovery_prompt(RecoveryReason::NoPr, &target(), Some("feature/abc123"))
            .expect("render");
        assert!(no_pr.contains("Open a pull request from `feature/abc123` into `main`"));

        let generic = recovery_prompt(RecoveryReason::Generic, &target(), None).expect("render");
        assert!(generic.contains("did not finish delivering"));
    }
}
