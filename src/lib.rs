//! banjo - ACP adapter for Claude Code and Codex
//!
//! A broker between an editor speaking the Agent Client Protocol (JSON-RPC
//! 2.0 over stdio or WebSocket) and one or two AI coding CLIs run as child
//! processes. It translates the editor's streaming conversation into each
//! child's line-delimited dialect while multiplexing tool calls, permission
//! prompts, session lifecycle, cancellation, and automatic continuation.
//!
//! ## Run modes
//!
//! - `banjo` / `banjo --mode agent`: ACP on stdio
//! - `banjo --mode daemon --port N`: ACP inside WebSocket text frames on
//!   `ws://127.0.0.1:N/acp`, with a discovery lockfile under
//!   `~/.claude/ide/`
//!
//! ## Environment variables
//!
//! - `BANJO_ENGINE`: default engine (`claude` or `codex`)
//! - `BANJO_TASK_ORACLE`: command queried for pending tasks when a turn
//!   stops on max-turns (enables auto-continue)
//! - `BANJO_NO_AUTO_RESUME`: disable resuming the last child session

pub mod agent;
pub mod autocontinue;
pub mod bridge;
pub mod cli;
pub mod permissions;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod transport;
pub mod types;

pub use agent::{run, run_with_cli, AcpAgent};
pub use cli::{Cli, RunMode};
pub use settings::{Settings, SettingsManager};
pub use types::{AdapterConfig, AgentError, Engine, ErrorCode, PermissionMode, Result};
