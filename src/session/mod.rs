//! Session management
//!
//! This module handles:
//! - Session lifecycle (create, get, remove, shutdown)
//! - The per-session prompt state machine and cancellation
//! - The engine dispatcher that drives one turn to its stop reason
//! - Translation of bridge events into `session/update` notifications

pub mod dispatcher;
mod emitter;
mod manager;
#[allow(clippy::module_inception)]
mod session;

pub use emitter::{extract_tool_info, ToolCallRecord, ToolInfo, UpdateEmitter};
pub use manager::SessionManager;
pub use session::{BridgeConfig, Continuation, Session, SessionState};
