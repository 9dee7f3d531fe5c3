//! Auto-approve policy for tool permissions
//!
//! Decides, before any client round trip, whether a tool run is allowed
//! outright, denied outright, or needs the user. The decision combines the
//! built-in safe tool set, the session's permission mode, and the tools the
//! user previously chose "always allow" for.

use dashmap::DashSet;

use crate::types::PermissionMode;

use super::rendezvous::PermissionOutcome;

/// Tools that never need a prompt: read-only inspection, listing, search,
/// todo management and subagent dispatch.
const SAFE_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "LS",
    "NotebookRead",
    "TodoRead",
    "TodoWrite",
    "Task",
];

/// Tools that modify files; auto-approved in acceptEdits mode.
const EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

/// Tools denied outright in plan mode.
const PLAN_BLOCKED_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit", "Bash"];

/// Check a tool against the built-in safe set
///
/// Language-server tools are safe regardless of the specific operation.
pub fn is_safe_tool(name: &str) -> bool {
    SAFE_TOOLS.contains(&name) || name.starts_with("mcp__language-server__")
}

/// Check a tool against the edit-kind set
pub fn is_edit_tool(name: &str) -> bool {
    EDIT_TOOLS.contains(&name)
}

/// Result of the local policy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Tool may run without asking
    Allow,
    /// Tool must not run; carries the reason reported to the child
    Deny { reason: String },
    /// No auto-decision; forward to the client
    Ask,
}

/// Per-session permission policy state
///
/// The always-allow set is bounded by the tool-name vocabulary of the child
/// agents; entries are added when the user answers `allow_always` and live
/// for the session (persistence is the settings module's concern).
#[derive(Debug, Default)]
pub struct PermissionPolicy {
    always_allow: DashSet<String>,
}

impl PermissionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the always-allow set (from persisted settings)
    pub fn seed_always_allow<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.always_allow.insert(name.into());
        }
    }

    /// Remember an `allow_always` answer for a tool
    pub fn remember_always_allow(&self, tool_name: &str) {
        self.always_allow.insert(tool_name.to_string());
    }

    /// Check whether a tool was previously always-allowed
    pub fn is_always_allowed(&self, tool_name: &str) -> bool {
        self.always_allow.contains(tool_name)
    }

    /// Apply the auto-approve policy
    pub fn evaluate(&self, mode: PermissionMode, tool_name: &str) -> PolicyDecision {
        if is_safe_tool(tool_name) {
            return PolicyDecision::Allow;
        }
        if self.is_always_allowed(tool_name) {
            return PolicyDecision::Allow;
        }

        match mode {
            PermissionMode::BypassPermissions => PolicyDecision::Allow,
            PermissionMode::AcceptEdits if is_edit_tool(tool_name) => PolicyDecision::Allow,
            PermissionMode::DontAsk => PolicyDecision::Deny {
                reason: format!("Tool {tool_name} is not pre-approved in dontAsk mode"),
            },
            PermissionMode::Plan if PLAN_BLOCKED_TOOLS.contains(&tool_name) => {
                PolicyDecision::Deny {
                    reason: format!("Tool {tool_name} is blocked in plan mode"),
                }
            }
            _ => PolicyDecision::Ask,
        }
    }
}

/// Map a rendezvous outcome to the Codex approval decision vocabulary
///
/// The current app-server protocol uses camelCase decisions; the legacy
/// `execCommandApproval`/`applyPatchApproval` generation uses snake_case.
pub fn codex_decision(outcome: PermissionOutcome, legacy: bool) -> &'static str {
    if legacy {
        match outcome {
            PermissionOutcome::Allow => "approved",
            PermissionOutcome::AllowAlways => "approved_for_session",
            PermissionOutcome::Deny | PermissionOutcome::TimedOut => "denied",
            PermissionOutcome::Cancelled => "abort",
        }
    } else {
        match outcome {
            PermissionOutcome::Allow => "accept",
            PermissionOutcome::AllowAlways => "acceptForSession",
            PermissionOutcome::Deny | PermissionOutcome::TimedOut => "decline",
            PermissionOutcome::Cancelled => "cancel",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_safe_tools_always_allowed() {
        let policy = PermissionPolicy::new();
        for tool in ["Read", "Glob", "Grep", "LS", "TodoWrite", "Task"] {
            assert_eq!(
                policy.evaluate(PermissionMode::Default, tool),
                PolicyDecision::Allow,
                "{tool} should be auto-approved"
            );
        }
        assert_eq!(
            policy.evaluate(PermissionMode::Default, "mcp__language-server__hover"),
            PolicyDecision::Allow
        );
    }

    #[test]
    fn test_default_mode_asks_for_bash() {
        let policy = PermissionPolicy::new();
        assert_eq!(
            policy.evaluate(PermissionMode::Default, "Bash"),
            PolicyDecision::Ask
        );
    }

    #[test]
    fn test_bypass_allows_everything() {
        let policy = PermissionPolicy::new();
        assert_eq!(
            policy.evaluate(PermissionMode::BypassPermissions, "Bash"),
            PolicyDecision::Allow
        );
    }

    #[test]
    fn test_accept_edits_allows_edit_tools_only() {
        let policy = PermissionPolicy::new();
        assert_eq!(
            policy.evaluate(PermissionMode::AcceptEdits, "Edit"),
            PolicyDecision::Allow
        );
        assert_eq!(
            policy.evaluate(PermissionMode::AcceptEdits, "Write"),
            PolicyDecision::Allow
        );
        assert_eq!(
            policy.evaluate(PermissionMode::AcceptEdits, "Bash"),
            PolicyDecision::Ask
        );
    }

    #[test]
    fn test_dont_ask_denies_unapproved() {
        let policy = PermissionPolicy::new();
        assert!(matches!(
            policy.evaluate(PermissionMode::DontAsk, "Bash"),
            PolicyDecision::Deny { .. }
        ));
        // Safe tools still pass.
        assert_eq!(
            policy.evaluate(PermissionMode::DontAsk, "Read"),
            PolicyDecision::Allow
        );
    }

    #[test]
    fn test_plan_mode_blocks_writes() {
        let policy = PermissionPolicy::new();
        assert!(matches!(
            policy.evaluate(PermissionMode::Plan, "Edit"),
            PolicyDecision::Deny { .. }
        ));
        assert!(matches!(
            policy.evaluate(PermissionMode::Plan, "Bash"),
            PolicyDecision::Deny { .. }
        ));
        assert_eq!(
            policy.evaluate(PermissionMode::Plan, "WebFetch"),
            PolicyDecision::Ask
        );
    }

    #[test]
    fn test_always_allow_wins_in_any_mode() {
        let policy = PermissionPolicy::new();
        policy.remember_always_allow("Bash");
        assert_eq!(
            policy.evaluate(PermissionMode::Default, "Bash"),
            PolicyDecision::Allow
        );
        assert_eq!(
            policy.evaluate(PermissionMode::DontAsk, "Bash"),
            PolicyDecision::Allow
        );
    }

    #[test]
    fn test_seed_always_allow() {
        let policy = PermissionPolicy::new();
        policy.seed_always_allow(["WebFetch".to_string(), "Bash".to_string()]);
        assert!(policy.is_always_allowed("WebFetch"));
        assert!(policy.is_always_allowed("Bash"));
        assert!(!policy.is_always_allowed("Edit"));
    }

    #[test]
    fn test_codex_decision_vocabulary() {
        assert_eq!(codex_decision(PermissionOutcome::Allow, false), "accept");
        assert_eq!(
            codex_decision(PermissionOutcome::AllowAlways, false),
            "acceptForSession"
        );
        assert_eq!(codex_decision(PermissionOutcome::Deny, false), "decline");
        assert_eq!(codex_decision(PermissionOutcome::Cancelled, false), "cancel");

        assert_eq!(codex_decision(PermissionOutcome::Allow, true), "approved");
        assert_eq!(
            codex_decision(PermissionOutcome::AllowAlways, true),
            "approved_for_session"
        );
        assert_eq!(codex_decision(PermissionOutcome::TimedOut, true), "denied");
        assert_eq!(codex_decision(PermissionOutcome::Cancelled, true), "abort");
    }
}
