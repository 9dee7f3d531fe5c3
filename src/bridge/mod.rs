//! Bridges to the child agent processes
//!
//! A bridge owns one spawned agent CLI: it feeds prompts onto the child's
//! stdin, parses the child's streaming stdout into normalized
//! [`BridgeEvent`]s pulled by the dispatcher, keeps the last stderr lines for
//! diagnostics, and supervises the process (interrupt, stop, reap). Engine
//! polymorphism is the [`AgentBridge`] trait plus the [`Engine`] tag.

mod child;
pub mod claude;
pub mod codex;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

pub use child::{BridgeChild, SpawnedChild, INTERRUPT_GRACE, SHUTDOWN_GRACE};
pub use claude::ClaudeBridge;
pub use codex::{ApprovalResponder, CodexBridge};

use crate::protocol::ContentBlock;
use crate::types::{Engine, PermissionMode, Result};

/// Options frozen at bridge launch
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Working directory the child runs in
    pub cwd: PathBuf,
    /// Permission mode at launch
    pub permission_mode: PermissionMode,
    /// Optional model override
    pub model: Option<String>,
    /// Optional child session/thread id to resume
    pub resume: Option<String>,
    /// Optional permission hook socket path (Claude only)
    pub hook_socket: Option<PathBuf>,
}

/// Why a turn ended, as reported by the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    EndTurn,
    Cancelled,
    MaxTokens,
    MaxTurnRequests,
}

/// One normalized event parsed from the child's output stream
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// The child announced itself (session id, model, tool list)
    Init {
        child_session_id: String,
        model: Option<String>,
        tools: Vec<String>,
    },
    /// A chunk of assistant text
    AgentText(String),
    /// A chunk of assistant thinking
    AgentThought(String),
    /// The child is invoking a tool
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    /// A tool invocation finished
    ToolResult {
        id: String,
        content: Option<Value>,
        failed: bool,
    },
    /// The child asked for an approval decision mid-turn (Codex)
    ApprovalRequest {
        rpc_id: Value,
        method: String,
        params: Value,
    },
    /// The child needs interactive login
    AuthRequired { message: String },
    /// Terminal event for the turn
    Turn {
        signal: StopSignal,
        error: Option<String>,
    },
    /// The child closed stdout without a terminal event
    Closed,
}

/// Common surface of the Claude and Codex bridges
#[async_trait]
pub trait AgentBridge: Send {
    /// The engine this bridge hosts
    fn engine(&self) -> Engine;

    /// Write one prompt onto the child's stdin
    async fn send_prompt(&mut self, blocks: &[ContentBlock]) -> Result<()>;

    /// Pull the next parsed child event; `None` after the stream is exhausted
    async fn next_event(&mut self) -> Option<BridgeEvent>;

    /// Deliver a graceful interrupt to the child
    async fn interrupt(&mut self) -> Result<()>;

    /// Tear the child down and reap it
    async fn stop(&mut self) -> Result<()>;

    /// Whether the child process is still running
    fn is_alive(&self) -> bool;

    /// The child's own session/thread id, once announced
    fn child_session_id(&self) -> Option<String>;

    /// Last stderr lines, for diagnostics only
    fn stderr_tail(&self) -> Vec<String>;

    /// Handle for answering in-band approval requests (Codex only)
    fn approval_responder(&self) -> Option<ApprovalResponder> {
        None
    }
}

/// Start a bridge for the given engine
pub async fn start_bridge(engine: Engine, options: StartOptions) -> Result<Box<dyn AgentBridge>> {
    match engine {
        Engine::Claude => Ok(Box::new(ClaudeBridge::start(options)?)),
        Engine::Codex => Ok(Box::new(CodexBridge::start(options).await?)),
    }
}

// === Stderr ring buffer ===

const STDERR_RING_CAPACITY: usize = 200;

/// Bounded ring of the child's most recent stderr lines
#[derive(Debug, Clone, Default)]
pub struct StderrRing {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line, evicting the oldest past capacity
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == STDERR_RING_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Snapshot of the buffered lines, oldest first
    pub fn tail(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }
}

/// Drain child stderr into the ring until EOF
pub(crate) fn spawn_stderr_reader(
    stderr: tokio::process::ChildStderr,
    ring: StderrRing,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::trace!(line = %line, "child stderr");
            ring.push(line);
        }
    })
}
