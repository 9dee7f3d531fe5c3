//! Claude Code bridge
//!
//! Drives the `claude` CLI in non-interactive print mode with stream-json
//! input and output: one JSON object per line in each direction. Prompts go
//! in as `{type:"user",message:{...}}` lines; the child's typed output lines
//! are parsed into normalized bridge events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::permissions::hook_socket::HOOK_SOCKET_ENV;
use crate::protocol::ContentBlock;
use crate::types::{AgentError, Engine, Result};

use super::child::{BridgeChild, INTERRUPT_GRACE, SHUTDOWN_GRACE};
use super::{spawn_stderr_reader, AgentBridge, BridgeEvent, StartOptions, StderrRing, StopSignal};

/// Executable name of the Claude Code CLI
const CLAUDE_EXECUTABLE: &str = "claude";

/// Bridge to one `claude` child process
pub struct ClaudeBridge {
    child: Arc<Mutex<BridgeChild>>,
    stdin: Option<ChildStdin>,
    events: mpsc::UnboundedReceiver<BridgeEvent>,
    alive: Arc<AtomicBool>,
    child_session_id: Arc<RwLock<Option<String>>>,
    stderr: StderrRing,
    reader_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

impl std::fmt::Debug for ClaudeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeBridge")
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ClaudeBridge {
    /// Spawn the Claude CLI with the given start options
    pub fn start(options: StartOptions) -> Result<Self> {
        let mut command = Command::new(CLAUDE_EXECUTABLE);
        command
            .arg("--print")
            .arg("--verbose")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--permission-mode")
            .arg(options.permission_mode.as_str())
            .current_dir(&options.cwd)
            .kill_on_drop(true);

        if let Some(ref model) = options.model {
            command.arg("--model").arg(model);
        }
        if let Some(ref resume) = options.resume {
            command.arg("--resume").arg(resume);
        }
        if let Some(ref socket) = options.hook_socket {
            command.env(HOOK_SOCKET_ENV, socket);
        }

        let spawned = BridgeChild::spawn(command)
            .map_err(|e| AgentError::engine_unavailable(format!("claude: {e}")))?;

        debug!(
            pid = spawned.child.id(),
            cwd = %options.cwd.display(),
            mode = %options.permission_mode.as_str(),
            model = ?options.model,
            resume = ?options.resume,
            "Claude bridge started"
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let child_session_id = Arc::new(RwLock::new(None));
        let stderr = StderrRing::new();
        let alive = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(read_loop(
            spawned.stdout,
            event_tx,
            Arc::clone(&child_session_id),
        ));
        let stderr_task = spawn_stderr_reader(spawned.stderr, stderr.clone());

        Ok(Self {
            child: Arc::new(Mutex::new(spawned.child)),
            stdin: Some(spawned.stdin),
            events: event_rx,
            alive,
            child_session_id,
            stderr,
            reader_task,
            stderr_task,
        })
    }
}

/// Parse stdout lines into events until EOF
async fn read_loop(
    stdout: tokio::process::ChildStdout,
    events: mpsc::UnboundedSender<BridgeEvent>,
    child_session_id: Arc<RwLock<Option<String>>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "Skipping corrupt claude output line");
                        continue;
                    }
                };
                for event in parse_event(&value) {
                    if let BridgeEvent::Init {
                        child_session_id: ref sid,
                        ..
                    } = event
                    {
                        if let Ok(mut slot) = child_session_id.write() {
                            *slot = Some(sid.clone());
                        }
                    }
                    if events.send(event).is_err() {
                        return;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Error reading claude stdout");
                break;
            }
        }
    }
    let _ = events.send(BridgeEvent::Closed);
}

/// Translate one parsed output object into zero or more events
fn parse_event(value: &Value) -> Vec<BridgeEvent> {
    match value.get("type").and_then(Value::as_str) {
        Some("system") => parse_system(value),
        Some("assistant") => parse_assistant(value),
        Some("user") => parse_tool_results(value),
        Some("stream_event") => parse_stream_event(value),
        Some("result") => vec![parse_result(value)],
        other => {
            debug!(message_type = ?other, "Ignoring unknown claude message type");
            Vec::new()
        }
    }
}

fn parse_system(value: &Value) -> Vec<BridgeEvent> {
    match value.get("subtype").and_then(Value::as_str) {
        Some("init") => {
            let child_session_id = value
                .get("session_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let model = value
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let tools = value
                .get("tools")
                .and_then(Value::as_array)
                .map(|tools| {
                    tools
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default();
            vec![BridgeEvent::Init {
                child_session_id,
                model,
                tools,
            }]
        }
        Some("auth_required") => {
            let message = value
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or("Authentication required")
                .to_string();
            vec![BridgeEvent::AuthRequired { message }]
        }
        // hook_response and other system chatter stay off the update stream.
        _ => Vec::new(),
    }
}

fn parse_assistant(value: &Value) -> Vec<BridgeEvent> {
    let Some(blocks) = value
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut events = Vec::new();
    let mut text_run = String::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    // Adjacent text blocks coalesce into one chunk.
                    text_run.push_str(text);
                }
            }
            Some("thinking") => {
                flush_text(&mut text_run, &mut events);
                if let Some(thinking) = block.get("thinking").and_then(Value::as_str) {
                    events.push(BridgeEvent::AgentThought(thinking.to_string()));
                }
            }
            Some("tool_use") => {
                flush_text(&mut text_run, &mut events);
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                events.push(BridgeEvent::ToolCall { id, name, input });
            }
            _ => {}
        }
    }
    flush_text(&mut text_run, &mut events);
    events
}

fn flush_text(run: &mut String, events: &mut Vec<BridgeEvent>) {
    if !run.is_empty() {
        events.push(BridgeEvent::AgentText(std::mem::take(run)));
    }
}

fn parse_tool_results(value: &Value) -> Vec<BridgeEvent> {
    let Some(blocks) = value
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
        .map(|block| BridgeEvent::ToolResult {
            id: block
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            content: block.get("content").cloned(),
            failed: block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
        .collect()
}

fn parse_stream_event(value: &Value) -> Vec<BridgeEvent> {
    let Some(event) = value.get("event") else {
        return Vec::new();
    };
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return Vec::new();
    }
    let Some(delta) = event.get("delta") else {
        return Vec::new();
    };
    match delta.get("type").and_then(Value::as_str) {
        Some("text_delta") => delta
            .get("text")
            .and_then(Value::as_str)
            .map(|text| vec![BridgeEvent::AgentText(text.to_string())])
            .unwrap_or_default(),
        Some("thinking_delta") => delta
            .get("thinking")
            .and_then(Value::as_str)
            .map(|thinking| vec![BridgeEvent::AgentThought(thinking.to_string())])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn parse_result(value: &Value) -> BridgeEvent {
    let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or("");
    let error = value
        .get("result")
        .and_then(Value::as_str)
        .map(str::to_owned);

    let signal = match subtype {
        "success" => StopSignal::EndTurn,
        "cancelled" => StopSignal::Cancelled,
        "max_tokens" => StopSignal::MaxTokens,
        "error_max_turns" | "error_max_budget_usd" => StopSignal::MaxTurnRequests,
        other => {
            warn!(subtype = %other, "Unknown result subtype, treating as end of turn");
            StopSignal::EndTurn
        }
    };
    BridgeEvent::Turn { signal, error }
}

/// Build the stream-json input line for a prompt
fn prompt_line(blocks: &[ContentBlock]) -> Result<String> {
    let content: Value = if blocks.len() == 1 {
        if let ContentBlock::Text { text } = &blocks[0] {
            Value::String(text.clone())
        } else {
            Value::Array(blocks.iter().map(input_block).collect())
        }
    } else {
        Value::Array(blocks.iter().map(input_block).collect())
    };

    let message = json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": content,
        },
    });
    Ok(serde_json::to_string(&message)?)
}

/// Map one content block to the child's input block shape
fn input_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::Image { data, mime_type } => json!({
            "type": "image",
            "source": {"type": "base64", "media_type": mime_type, "data": data},
        }),
        // Media the child has no schema for is forwarded opaquely.
        other => serde_json::to_value(other).unwrap_or(Value::Null),
    }
}

#[async_trait::async_trait]
impl AgentBridge for ClaudeBridge {
    fn engine(&self) -> Engine {
        Engine::Claude
    }

    async fn send_prompt(&mut self, blocks: &[ContentBlock]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AgentError::bridge_failed("claude stdin closed"))?;
        let mut line = prompt_line(blocks)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<BridgeEvent> {
        self.events.recv().await
    }

    async fn interrupt(&mut self) -> Result<()> {
        let mut child = self.child.lock().await;
        child.interrupt(INTERRUPT_GRACE).await?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // Close stdin first so a well-behaved child exits on its own.
        self.stdin.take();
        {
            let mut child = self.child.lock().await;
            child.shutdown(SHUTDOWN_GRACE).await?;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.reader_task.abort();
        self.stderr_task.abort();
        Ok(())
    }

    fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        match self.child.try_lock() {
            Ok(mut child) => child.is_running(),
            // Someone is interrupting or stopping; report the last known state.
            Err(_) => true,
        }
    }

    fn child_session_id(&self) -> Option<String> {
        self.child_session_id.read().ok().and_then(|s| s.clone())
    }

    fn stderr_tail(&self) -> Vec<String> {
        self.stderr.tail()
    }
}

impl Drop for ClaudeBridge {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.stderr_task.abort();
    }
}
