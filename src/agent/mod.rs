//! ACP adapter implementation
//!
//! This module provides the top-level request router that handles:
//! - ACP protocol requests (initialize, session/new, session/prompt, etc.)
//! - Session lifecycle management
//! - Continuation turns queued by the auto-continue controller
//! - Logging initialization and run-mode selection

mod core;
mod handlers;
mod runner;

pub use core::AcpAgent;
pub use handlers::route_line;
pub use runner::{run, run_with_cli};
