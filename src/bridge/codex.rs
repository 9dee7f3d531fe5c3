//! Codex bridge
//!
//! Drives `codex app-server`: JSON-RPC 2.0 over newline-delimited JSON on the
//! child's stdio, camelCase method names, and no `jsonrpc` member on messages
//! the child emits. The conversation is `initialize` → `initialized` →
//! `thread/start` (or `thread/resume`) → `turn/start`, after which turn
//! progress arrives as notifications. The child may issue approval requests
//! mid-turn; those surface as [`BridgeEvent::ApprovalRequest`] and are
//! answered through the [`ApprovalResponder`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::ContentBlock;
use crate::types::{AgentError, Engine, Result};

use super::child::{BridgeChild, INTERRUPT_GRACE, SHUTDOWN_GRACE};
use super::{spawn_stderr_reader, AgentBridge, BridgeEvent, StartOptions, StderrRing, StopSignal};

/// Executable name of the Codex CLI
const CODEX_EXECUTABLE: &str = "codex";

/// Deadline for the startup handshake requests
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Approval request methods of the current app-server protocol
const APPROVAL_METHODS: &[&str] = &[
    "item/commandExecution/requestApproval",
    "item/fileChange/requestApproval",
];

/// Approval request methods of the legacy protocol generation
const LEGACY_APPROVAL_METHODS: &[&str] = &["execCommandApproval", "applyPatchApproval"];

/// Check whether a child request method is an approval request
pub fn is_approval_method(method: &str) -> bool {
    APPROVAL_METHODS.contains(&method) || LEGACY_APPROVAL_METHODS.contains(&method)
}

/// Check whether an approval method uses the legacy snake_case decisions
pub fn is_legacy_approval_method(method: &str) -> bool {
    LEGACY_APPROVAL_METHODS.contains(&method)
}

/// Clone-cheap handle for answering the child's approval requests
#[derive(Clone)]
pub struct ApprovalResponder {
    stdin: Arc<Mutex<ChildStdin>>,
}

impl std::fmt::Debug for ApprovalResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalResponder").finish_non_exhaustive()
    }
}

impl ApprovalResponder {
    /// Answer one approval request with the given decision string
    pub async fn respond(&self, rpc_id: &Value, decision: &str) -> Result<()> {
        let response = json!({
            "id": rpc_id,
            "result": {"decision": decision},
        });
        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Bridge to one `codex app-server` child process
pub struct CodexBridge {
    child: Arc<Mutex<BridgeChild>>,
    stdin: Arc<Mutex<ChildStdin>>,
    events: mpsc::UnboundedReceiver<BridgeEvent>,
    alive: Arc<AtomicBool>,
    thread_id: Arc<RwLock<Option<String>>>,
    stderr: StderrRing,
    request_id: AtomicU64,
    pending: Arc<DashMap<u64, oneshot::Sender<Value>>>,
    reader_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

impl std::fmt::Debug for CodexBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodexBridge")
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl CodexBridge {
    /// Spawn `codex app-server` and run the startup handshake
    pub async fn start(options: StartOptions) -> Result<Self> {
        let mut command = Command::new(CODEX_EXECUTABLE);
        command
            .arg("app-server")
            .current_dir(&options.cwd)
            .kill_on_drop(true);

        let spawned = BridgeChild::spawn(command)
            .map_err(|e| AgentError::engine_unavailable(format!("codex: {e}")))?;

        debug!(
            pid = spawned.child.id(),
            cwd = %options.cwd.display(),
            model = ?options.model,
            resume = ?options.resume,
            "Codex bridge started"
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let thread_id = Arc::new(RwLock::new(None));
        let stderr = StderrRing::new();
        let pending: Arc<DashMap<u64, oneshot::Sender<Value>>> = Arc::new(DashMap::new());
        let stdin = Arc::new(Mutex::new(spawned.stdin));

        let reader_task = tokio::spawn(read_loop(
            spawned.stdout,
            event_tx,
            Arc::clone(&thread_id),
            Arc::clone(&pending),
        ));
        let stderr_task = spawn_stderr_reader(spawned.stderr, stderr.clone());

        let bridge = Self {
            child: Arc::new(Mutex::new(spawned.child)),
            stdin,
            events: event_rx,
            alive: Arc::new(AtomicBool::new(true)),
            thread_id,
            stderr,
            request_id: AtomicU64::new(1),
            pending,
            reader_task,
            stderr_task,
        };

        bridge.handshake(&options).await?;
        Ok(bridge)
    }

    /// `initialize` → thread start/resume; records the thread id
    async fn handshake(&self, options: &StartOptions) -> Result<()> {
        self.send_request(
            "initialize",
            json!({
                "clientInfo": {"name": "banjo", "version": env!("CARGO_PKG_VERSION")},
            }),
        )
        .await?;

        let thread_result = match options.resume {
            Some(ref thread_id) => {
                self.send_request("thread/resume", json!({"threadId": thread_id}))
                    .await?
            }
            None => {
                let mut params = json!({"cwd": options.cwd});
                if let Some(ref model) = options.model {
                    params["model"] = Value::String(model.clone());
                }
                self.send_request("thread/start", params).await?
            }
        };

        // The id usually arrives in the response; thread/started also sets it.
        if let Some(tid) = thread_result
            .get("threadId")
            .or_else(|| thread_result.get("thread_id"))
            .and_then(Value::as_str)
        {
            if let Ok(mut slot) = self.thread_id.write() {
                slot.get_or_insert_with(|| tid.to_string());
            }
        }
        Ok(())
    }

    /// Send one request and await its response line
    async fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let request = json!({"id": id, "method": method, "params": params});
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await?;
        }

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(AgentError::bridge_failed(format!(
                "codex closed before answering {method}"
            ))),
            Err(_) => {
                self.pending.remove(&id);
                Err(AgentError::bridge_failed(format!(
                    "codex did not answer {method} in time"
                )))
            }
        }
    }

    fn current_thread_id(&self) -> Option<String> {
        self.thread_id.read().ok().and_then(|s| s.clone())
    }
}

/// Parse stdout lines and route them until EOF
async fn read_loop(
    stdout: tokio::process::ChildStdout,
    events: mpsc::UnboundedSender<BridgeEvent>,
    thread_id: Arc<RwLock<Option<String>>>,
    pending: Arc<DashMap<u64, oneshot::Sender<Value>>>,
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
                        warn!(error = %e, "Skipping corrupt codex output line");
                        continue;
                    }
                };

                // Response to one of our requests.
                if value.get("method").is_none() {
                    if let Some(id) = value.get("id").and_then(Value::as_u64) {
                        if let Some((_, tx)) = pending.remove(&id) {
                            if let Some(error) = value.get("error") {
                                warn!(error = %error, "codex request failed");
                            }
                            let _ =
                                tx.send(value.get("result").cloned().unwrap_or(Value::Null));
                        }
                    }
                    continue;
                }

                for event in classify_child_message(&value) {
                    if let BridgeEvent::Init {
                        child_session_id: ref tid,
                        ..
                    } = event
                    {
                        if let Ok(mut slot) = thread_id.write() {
                            slot.get_or_insert_with(|| tid.clone());
                        }
                    }
                    if events.send(event).is_err() {
                        return;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Error reading codex stdout");
                break;
            }
        }
    }
    let _ = events.send(BridgeEvent::Closed);
}

/// Translate one child message (request or notification) into events
fn classify_child_message(value: &Value) -> Vec<BridgeEvent> {
    let Some(method) = value.get("method").and_then(Value::as_str) else {
        return Vec::new();
    };
    let params = value.get("params").cloned().unwrap_or(Value::Null);

    // Requests carry an id; the only ones the child sends are approvals.
    if let Some(id) = value.get("id").filter(|id| !id.is_null()) {
        if is_approval_method(method) {
            return vec![BridgeEvent::ApprovalRequest {
                rpc_id: id.clone(),
                method: method.to_string(),
                params,
            }];
        }
        warn!(method = %method, "Unexpected request from codex child");
        return Vec::new();
    }

    match method {
        "thread/started" => {
            let tid = params
                .get("threadId")
                .or_else(|| params.get("thread_id"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            vec![BridgeEvent::Init {
                child_session_id: tid,
                model: None,
                tools: Vec::new(),
            }]
        }
        "item/agentMessage/delta" => params
            .get("delta")
            .and_then(Value::as_str)
            .map(|delta| vec![BridgeEvent::AgentText(delta.to_string())])
            .unwrap_or_default(),
        "item/started" => parse_item_started(&params),
        "item/completed" => parse_item_completed(&params),
        "turn/completed" => vec![parse_turn_completed(&params)],
        // initialized, turn/started and other chatter carry no update.
        _ => Vec::new(),
    }
}

fn item_field<'a>(params: &'a Value, field: &str) -> Option<&'a Value> {
    params.get("item").and_then(|item| item.get(field))
}

fn parse_item_started(params: &Value) -> Vec<BridgeEvent> {
    let item_type = item_field(params, "type").and_then(Value::as_str);
    match item_type {
        Some(kind @ ("commandExecution" | "fileChange")) => {
            let id = item_field(params, "id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let input = params.get("item").cloned().unwrap_or(Value::Null);
            vec![BridgeEvent::ToolCall {
                id,
                name: kind.to_string(),
                input,
            }]
        }
        // agentMessage items stream through delta notifications.
        _ => Vec::new(),
    }
}

fn parse_item_completed(params: &Value) -> Vec<BridgeEvent> {
    let item_type = item_field(params, "type").and_then(Value::as_str);
    match item_type {
        Some("commandExecution" | "fileChange") => {
            let id = item_field(params, "id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let failed = item_field(params, "status").and_then(Value::as_str) == Some("failed");
            let content = item_field(params, "output")
                .or_else(|| item_field(params, "aggregatedOutput"))
                .cloned();
            vec![BridgeEvent::ToolResult {
                id,
                content,
                failed,
            }]
        }
        _ => Vec::new(),
    }
}

fn parse_turn_completed(params: &Value) -> BridgeEvent {
    let error = params.pointer("/turn/error");
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    let signal = match code {
        "max_turns" => StopSignal::MaxTurnRequests,
        "cancelled" | "interrupted" | "turn_aborted" => StopSignal::Cancelled,
        "" => StopSignal::EndTurn,
        other => {
            warn!(code = %other, "Unknown turn error code, treating as end of turn");
            StopSignal::EndTurn
        }
    };
    BridgeEvent::Turn {
        signal,
        error: message,
    }
}

/// Build the `turn/start` input array from prompt blocks
fn turn_input(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            ContentBlock::Image { data, mime_type } => json!({
                "type": "image",
                "data": data,
                "mimeType": mime_type,
            }),
            other => serde_json::to_value(other).unwrap_or(Value::Null),
        })
        .collect()
}

#[async_trait::async_trait]
impl AgentBridge for CodexBridge {
    fn engine(&self) -> Engine {
        Engine::Codex
    }

    async fn send_prompt(&mut self, blocks: &[ContentBlock]) -> Result<()> {
        let thread_id = self
            .current_thread_id()
            .ok_or_else(|| AgentError::bridge_failed("codex thread not started"))?;
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "id": id,
            "method": "turn/start",
            "params": {
                "threadId": thread_id,
                "input": turn_input(blocks),
            },
        });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
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
            Err(_) => true,
        }
    }

    fn child_session_id(&self) -> Option<String> {
        self.current_thread_id()
    }

    fn stderr_tail(&self) -> Vec<String> {
        self.stderr.tail()
    }

    fn approval_responder(&self) -> Option<ApprovalResponder> {
        Some(ApprovalResponder {
            stdin: Arc::clone(&self.stdin),
        })
    }
}

impl Drop for CodexBridge {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.stderr_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn classify(line: &str) -> Vec<BridgeEvent> {
        classify_child_message(&serde_json::from_str(line).unwrap())
    }

    #[test]
    fn test_thread_started_records_id() {
        let events = classify(r#"{"method":"thread/started","params":{"threadId":"t-9"}}"#);
        assert_eq!(
            events,
            vec![BridgeEvent::Init {
                child_session_id: "t-9".to_string(),
                model: None,
                tools: Vec::new(),
            }]
        );
    }

    #[test]
    fn test_agent_message_delta() {
        let events =
            classify(r#"{"method":"item/agentMessage/delta","params":{"delta":"hello"}}"#);
        assert_eq!(events, vec![BridgeEvent::AgentText("hello".to_string())]);
    }

    #[test]
    fn test_item_started_command_execution() {
        let events = classify(
            r#"{"method":"item/started","params":{"item":{"id":"item-1","type":"commandExecution","command":"ls -la"}}}"#,
        );
        match &events[0] {
            BridgeEvent::ToolCall { id, name, input } => {
                assert_eq!(id, "item-1");
                assert_eq!(name, "commandExecution");
                assert_eq!(input["command"], "ls -la");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_agent_message_item_start_is_silent() {
        let events = classify(
            r#"{"method":"item/started","params":{"item":{"id":"item-2","type":"agentMessage"}}}"#,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_item_completed_maps_to_tool_result() {
        let events = classify(
            r#"{"method":"item/completed","params":{"item":{"id":"item-1","type":"commandExecution","status":"completed","output":"ok"}}}"#,
        );
        assert_eq!(
            events,
            vec![BridgeEvent::ToolResult {
                id: "item-1".to_string(),
                content: Some(Value::String("ok".to_string())),
                failed: false,
            }]
        );

        let events = classify(
            r#"{"method":"item/completed","params":{"item":{"id":"item-3","type":"fileChange","status":"failed"}}}"#,
        );
        assert!(matches!(
            events[0],
            BridgeEvent::ToolResult { failed: true, .. }
        ));
    }

    #[test]
    fn test_turn_completed_mapping() {
        let events = classify(r#"{"method":"turn/completed","params":{"turn":{"id":"t"}}}"#);
        assert_eq!(
            events,
            vec![BridgeEvent::Turn {
                signal: StopSignal::EndTurn,
                error: None
            }]
        );

        let events = classify(
            r#"{"method":"turn/completed","params":{"turn":{"error":{"code":"max_turns","message":"turn limit"}}}}"#,
        );
        assert_eq!(
            events,
            vec![BridgeEvent::Turn {
                signal: StopSignal::MaxTurnRequests,
                error: Some("turn limit".to_string()),
            }]
        );

        let events = classify(
            r#"{"method":"turn/completed","params":{"turn":{"error":{"code":"interrupted"}}}}"#,
        );
        assert_eq!(
            events,
            vec![BridgeEvent::Turn {
                signal: StopSignal::Cancelled,
                error: None
            }]
        );
    }

    #[test]
    fn test_approval_request_classification() {
        let events = classify(
            r#"{"id":41,"method":"item/commandExecution/requestApproval","params":{"itemId":"item-1","command":"rm -rf target"}}"#,
        );
        match &events[0] {
            BridgeEvent::ApprovalRequest {
                rpc_id,
                method,
                params,
            } => {
                assert_eq!(rpc_id, &Value::from(41));
                assert_eq!(method, "item/commandExecution/requestApproval");
                assert_eq!(params["command"], "rm -rf target");
            }
            other => panic!("expected approval request, got {other:?}"),
        }

        let events =
            classify(r#"{"id":42,"method":"execCommandApproval","params":{"command":"ls"}}"#);
        assert!(matches!(events[0], BridgeEvent::ApprovalRequest { .. }));
    }

    #[test]
    fn test_approval_method_generations() {
        assert!(is_approval_method("item/fileChange/requestApproval"));
        assert!(is_approval_method("applyPatchApproval"));
        assert!(!is_approval_method("turn/start"));

        assert!(is_legacy_approval_method("execCommandApproval"));
        assert!(!is_legacy_approval_method(
            "item/commandExecution/requestApproval"
        ));
    }

    #[test]
    fn test_turn_input_shapes() {
        let input = turn_input(&[
            ContentBlock::text("run the tests"),
            ContentBlock::Image {
                data: "aGk=".to_string(),
                mime_type: "image/png".to_string(),
            },
        ]);
        assert_eq!(input[0]["type"], "text");
        assert_eq!(input[0]["text"], "run the tests");
        assert_eq!(input[1]["type"], "image");
        assert_eq!(input[1]["mimeType"], "image/png");
    }
}
