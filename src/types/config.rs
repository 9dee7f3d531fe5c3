//! Adapter configuration from environment variables

use crate::types::Engine;

/// Environment variable naming the default engine (`claude` or `codex`).
pub const ENV_ENGINE: &str = "BANJO_ENGINE";
/// Environment variable naming the task-oracle command for auto-continue.
pub const ENV_TASK_ORACLE: &str = "BANJO_TASK_ORACLE";
/// Environment variable that disables resuming the last child session.
pub const ENV_NO_AUTO_RESUME: &str = "BANJO_NO_AUTO_RESUME";

/// Adapter configuration loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct AdapterConfig {
    /// Default engine for new sessions when the client does not pick one.
    /// Environment variable: `BANJO_ENGINE`
    pub default_engine: Option<Engine>,

    /// Command to run as the task oracle when a turn stops on max-turns.
    /// Environment variable: `BANJO_TASK_ORACLE`
    pub task_oracle: Option<String>,

    /// Disable resuming the last recorded child session on `session/new`.
    /// Environment variable: `BANJO_NO_AUTO_RESUME` (any non-empty value)
    pub no_auto_resume: bool,
}

impl AdapterConfig {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default_engine = std::env::var(ENV_ENGINE)
            .ok()
            .as_deref()
            .and_then(Engine::parse);

        let task_oracle = std::env::var(ENV_TASK_ORACLE)
            .ok()
            .filter(|s| !s.is_empty());

        let no_auto_resume = std::env::var(ENV_NO_AUTO_RESUME)
            .map(|v| !v.is_empty())
            .unwrap_or(false);

        Self {
            default_engine,
            task_oracle,
            no_auto_resume,
        }
    }

    /// The engine used when neither the client nor the environment picked one
    pub fn effective_default_engine(&self) -> Engine {
        self.default_engine.unwrap_or(Engine::Claude)
    }

    /// Check whether auto-continue can ever trigger
    pub fn auto_continue_available(&self) -> bool {
        self.task_oracle.is_some()
    }
}
