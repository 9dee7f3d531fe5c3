//! Engine selection and permission modes
//!
//! An engine is one of the child agent CLIs the adapter can drive. Engine
//! choice happens at `session/new` (or via `session/set_config_option`) and
//! may change only between prompts.

use serde::{Deserialize, Serialize};

/// The child agent CLI hosted by a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Claude Code (`claude` executable, stream-json protocol)
    #[default]
    Claude,
    /// Codex (`codex app-server`, JSON-RPC over JSONL)
    Codex,
}

impl Engine {
    /// Parse from the wire string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            _ => None,
        }
    }

    /// Wire string for this engine
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }

    /// Models selectable for this engine via `session/set_model`
    pub fn models(self) -> &'static [&'static str] {
        match self {
            Self::Claude => &["sonnet", "opus", "haiku"],
            Self::Codex => &["o3", "o4-mini", "gpt-4.1"],
        }
    }

    /// Check a model id against this engine's model set
    pub fn supports_model(self, model: &str) -> bool {
        self.models().contains(&model)
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission mode for tool execution
///
/// Controls how tool permission requests are resolved during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Default mode - prompt for dangerous operations
    #[default]
    Default,
    /// Auto-approve file edit operations
    AcceptEdits,
    /// Bypass all permission checks (dangerous)
    BypassPermissions,
    /// Never prompt - deny anything not pre-approved
    DontAsk,
    /// Planning mode - read-only operations
    Plan,
}

impl PermissionMode {
    /// Parse from string (ACP `session/set_mode` request)
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Self::Default),
            "acceptEdits" => Some(Self::AcceptEdits),
            "bypassPermissions" => Some(Self::BypassPermissions),
            "dontAsk" => Some(Self::DontAsk),
            "plan" => Some(Self::Plan),
            _ => None,
        }
    }

    /// Wire string for this mode
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::DontAsk => "dontAsk",
            Self::Plan => "plan",
        }
    }

    /// All modes, in the order they are advertised to the client
    pub fn all() -> &'static [PermissionMode] {
        &[
            Self::Default,
            Self::AcceptEdits,
            Self::BypassPermissions,
            Self::DontAsk,
            Self::Plan,
        ]
    }

    /// Human-readable name for mode listings
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::AcceptEdits => "Accept Edits",
            Self::BypassPermissions => "Bypass Permissions",
            Self::DontAsk => "Don't Ask",
            Self::Plan => "Plan Mode",
        }
    }

    /// Description shown next to the mode in clients
    pub fn description(self) -> &'static str {
        match self {
            Self::Default => "Standard behavior, prompts for dangerous operations",
            Self::AcceptEdits => "Auto-accept file edit operations",
            Self::BypassPermissions => "Bypass all permission checks",
            Self::DontAsk => "Don't prompt for permissions, deny if not pre-approved",
            Self::Plan => "Planning mode, no actual tool execution",
        }
    }
}
