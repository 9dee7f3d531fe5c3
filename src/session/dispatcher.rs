//! Engine dispatcher
//!
//! Binds one prompt to the session's bridge and drives it to a stop reason:
//! ensure a bridge matching the session's current configuration, write the
//! prompt, pull events until a terminal signal, translate them through the
//! emitter, and observe cancellation at every await point. One turn runs at
//! a time per session; the caller already claimed the session via
//! `begin_prompt`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::autocontinue::AutoContinue;
use crate::bridge::{
    self, codex, AgentBridge, ApprovalResponder, BridgeEvent, StartOptions, StopSignal,
};
use crate::permissions::policy::codex_decision;
use crate::protocol::acp::{ContentBlock, EmbeddedResource, ReadTextFileParams, StopReason};
use crate::types::{AgentError, Engine, Result};

use super::session::Session;

/// How long the dispatcher keeps draining events after an interrupt
const CANCEL_DRAIN: Duration = Duration::from_secs(2);

/// Phrases that mean the child needs interactive login
const AUTH_MARKERS: &[&str] = &[
    "please run /login",
    "api login failure",
    "invalid api key",
    "authentication_error",
    "oauth token has expired",
    "not logged in",
    "login required",
];

/// Case-insensitive scan for authentication markers
pub fn contains_auth_marker(text: &str) -> bool {
    let lowered = text.to_lowercase();
    AUTH_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Scan a tool-result payload for authentication markers
fn value_contains_auth_marker(value: &Value) -> bool {
    match value {
        Value::String(s) => contains_auth_marker(s),
        Value::Array(items) => items.iter().any(value_contains_auth_marker),
        Value::Object(map) => map.values().any(value_contains_auth_marker),
        _ => false,
    }
}

/// Merge text blocks and resolve resource links into inline context
///
/// Embedded resources become `<context>` tags; `resource_link` blocks are
/// read through the client when it advertises `fs.readTextFile`, otherwise
/// they degrade to a reference. Adjacent text runs merge into one block.
pub async fn resolve_prompt(
    session: &Arc<Session>,
    blocks: Vec<ContentBlock>,
) -> Result<Vec<ContentBlock>> {
    if blocks.is_empty() {
        return Err(AgentError::EmptyPrompt);
    }
    let caps = session.client().capabilities();

    let mut resolved: Vec<ContentBlock> = Vec::new();
    let mut push_text = |resolved: &mut Vec<ContentBlock>, text: String| {
        if let Some(ContentBlock::Text { text: last }) = resolved.last_mut() {
            last.push('\n');
            last.push_str(&text);
        } else {
            resolved.push(ContentBlock::Text { text });
        }
    };

    for block in blocks {
        match block {
            ContentBlock::Text { text } => push_text(&mut resolved, text),
            ContentBlock::Resource { resource } => match resource {
                EmbeddedResource::Text { uri, text, .. } => {
                    push_text(&mut resolved, format!("<context uri=\"{uri}\">\n{text}\n</context>"));
                }
                EmbeddedResource::Blob { uri, .. } => {
                    push_text(&mut resolved, format!("<context uri=\"{uri}\" />"));
                }
            },
            ContentBlock::ResourceLink {
                uri,
                name,
                description: _,
                size: _,
            } => {
                let path = uri.strip_prefix("file://").map(str::to_owned);
                let read = match (caps.fs.read_text_file, path) {
                    (true, Some(path)) => session
                        .client()
                        .fs_read_text_file(ReadTextFileParams {
                            session_id: session.session_id.clone(),
                            path,
                            line: None,
                            limit: None,
                        })
                        .await
                        .ok(),
                    _ => None,
                };
                match read {
                    Some(contents) => push_text(
                        &mut resolved,
                        format!("<context uri=\"{uri}\">\n{}\n</context>", contents.content),
                    ),
                    None => {
                        let label = name.unwrap_or_else(|| uri.clone());
                        push_text(&mut resolved, format!("[{label}]({uri})"));
                    }
                }
            }
            other => resolved.push(other),
        }
    }
    Ok(resolved)
}

/// Make sure a bridge matching the session's configuration is running
///
/// Returns the bridge, taken out of the session slot for the duration of the
/// turn. A configuration change or a dead child restarts the bridge.
async fn ensure_bridge(session: &Arc<Session>) -> Result<Box<dyn AgentBridge>> {
    let mut desired = session.desired_bridge_config();
    let mut slot = session.bridge().lock().await;

    if let Some(bridge) = slot.take() {
        let cached = session.bridge_config();
        if bridge.is_alive() && cached.as_ref() == Some(&desired) {
            return Ok(bridge);
        }
        debug!(
            session_id = %session.session_id,
            alive = bridge.is_alive(),
            "Bridge configuration changed, restarting"
        );
        let mut old = bridge;
        if let Err(e) = old.stop().await {
            warn!(session_id = %session.session_id, error = %e, "Error stopping stale bridge");
        }
    }
    drop(slot);
    session.set_bridge_config(None);

    let hook_socket = match desired.engine {
        Engine::Claude => Some(session.ensure_hook_listener()?),
        Engine::Codex => None,
    };
    // Resume may have been recorded by a previous bridge of this engine.
    desired.resume = session.resume_for(desired.engine);

    let options = StartOptions {
        cwd: desired.cwd.clone(),
        permission_mode: desired.permission_mode,
        model: desired.model.clone(),
        resume: desired.resume.clone(),
        hook_socket,
    };

    let bridge = bridge::start_bridge(desired.engine, options).await?;
    info!(
        session_id = %session.session_id,
        engine = %desired.engine,
        "Bridge ready"
    );
    session.set_bridge_config(Some(desired));
    Ok(bridge)
}

/// Outcome of the streaming loop before it is mapped to a response
enum TurnEnd {
    Stop(StopReason),
    Failed(AgentError),
}

/// Run one prompt turn to completion
///
/// The session must already be claimed (`begin_prompt`). The caller sends
/// the `session/prompt` response and returns the session to Idle.
pub async fn run_turn(
    session: &Arc<Session>,
    auto_continue: &AutoContinue,
    blocks: Vec<ContentBlock>,
) -> Result<StopReason> {
    let resolved = resolve_prompt(session, blocks).await?;

    let mut bridge = ensure_bridge(session).await?;
    let responder = bridge.approval_responder();

    if let Err(e) = bridge.send_prompt(&resolved).await {
        // The child died between start and write; next prompt restarts it.
        let _ = bridge.stop().await;
        session.set_bridge_config(None);
        return Err(e);
    }

    session.set_streaming();
    let end = stream_events(session, bridge.as_mut(), responder.as_ref()).await;
    session.set_completing();

    let bridge_dead = !bridge.is_alive();
    if bridge_dead {
        session.set_bridge_config(None);
        let _ = bridge.stop().await;
    } else {
        *session.bridge().lock().await = Some(bridge);
    }

    match end {
        TurnEnd::Stop(stop_reason) => {
            if stop_reason == StopReason::MaxTurnRequests {
                auto_continue.maybe_queue(session).await;
            }
            Ok(stop_reason)
        }
        TurnEnd::Failed(error) => Err(error),
    }
}

/// Pull events until a terminal signal, cancellation, or stream end
async fn stream_events(
    session: &Arc<Session>,
    bridge: &mut dyn AgentBridge,
    responder: Option<&ApprovalResponder>,
) -> TurnEnd {
    loop {
        if session.is_cancelled() {
            return cancel_turn(session, bridge).await;
        }

        let event = tokio::select! {
            biased;
            () = session.wait_cancelled() => return cancel_turn(session, bridge).await,
            event = bridge.next_event() => event,
        };

        let Some(event) = event else {
            return closed_turn(session, bridge);
        };

        match event {
            BridgeEvent::Init {
                child_session_id,
                model,
                tools,
            } => {
                debug!(
                    session_id = %session.session_id,
                    child_session_id = %child_session_id,
                    tool_count = tools.len(),
                    "Child agent initialized"
                );
                session.record_child_session(session.engine(), &child_session_id);
                if let Some(child_model) = model {
                    let differs = session
                        .model()
                        .map_or(false, |alias| !child_model.contains(alias.as_str()));
                    if differs {
                        let _ = session.emitter().current_model(&child_model);
                    }
                }
            }
            BridgeEvent::AgentText(text) => {
                if contains_auth_marker(&text) {
                    return auth_required_turn(session, bridge, &text).await;
                }
                if let Err(e) = session.emitter().agent_text(&text) {
                    return TurnEnd::Failed(e);
                }
            }
            BridgeEvent::AgentThought(text) => {
                if let Err(e) = session.emitter().agent_thought(&text) {
                    return TurnEnd::Failed(e);
                }
            }
            BridgeEvent::ToolCall { id, name, input } => {
                if let Err(e) = session.emitter().tool_call(&id, &name, &input) {
                    return TurnEnd::Failed(e);
                }
            }
            BridgeEvent::ToolResult {
                id,
                content,
                failed,
            } => {
                if let Some(ref value) = content {
                    if value_contains_auth_marker(value) {
                        let _ = session.emitter().tool_result(&id, content.as_ref(), failed);
                        return auth_required_turn(session, bridge, "Authentication required")
                            .await;
                    }
                }
                if let Err(e) = session.emitter().tool_result(&id, content.as_ref(), failed) {
                    return TurnEnd::Failed(e);
                }
            }
            BridgeEvent::ApprovalRequest {
                rpc_id,
                method,
                params,
            } => {
                spawn_approval(session, responder.cloned(), rpc_id, method, params);
            }
            BridgeEvent::AuthRequired { message } => {
                return auth_required_turn(session, bridge, &message).await;
            }
            BridgeEvent::Turn { signal, error } => {
                if let Some(ref error) = error {
                    debug!(session_id = %session.session_id, error = %error, "Turn ended with error detail");
                }
                let stop_reason = match signal {
                    StopSignal::EndTurn if session.is_cancelled() => StopReason::Cancelled,
                    StopSignal::EndTurn => StopReason::EndTurn,
                    StopSignal::Cancelled => StopReason::Cancelled,
                    StopSignal::MaxTokens => StopReason::MaxTokens,
                    StopSignal::MaxTurnRequests => StopReason::MaxTurnRequests,
                };
                return TurnEnd::Stop(stop_reason);
            }
            BridgeEvent::Closed => return closed_turn(session, bridge),
        }
    }
}

/// Interrupt the child, drain its remaining output, answer `cancelled`
async fn cancel_turn(session: &Arc<Session>, bridge: &mut dyn AgentBridge) -> TurnEnd {
    session.set_cancelling();
    info!(session_id = %session.session_id, "Cancelling in-flight turn");

    if let Err(e) = bridge.interrupt().await {
        warn!(session_id = %session.session_id, error = %e, "Failed to interrupt bridge");
    }

    // Drain whatever the child still writes, bounded by the deadline; the
    // drained events are not forwarded, the turn is already over.
    let deadline = tokio::time::Instant::now() + CANCEL_DRAIN;
    loop {
        match tokio::time::timeout_at(deadline, bridge.next_event()).await {
            Ok(Some(BridgeEvent::Turn { .. } | BridgeEvent::Closed)) | Ok(None) | Err(_) => break,
            Ok(Some(_)) => {}
        }
    }

    let _ = session.emitter().fail_open_tool_calls("cancelled");
    TurnEnd::Stop(StopReason::Cancelled)
}

/// Handle stdout EOF without a terminal event
fn closed_turn(session: &Arc<Session>, bridge: &mut dyn AgentBridge) -> TurnEnd {
    if session.is_cancelled() {
        let _ = session.emitter().fail_open_tool_calls("cancelled");
        return TurnEnd::Stop(StopReason::Cancelled);
    }
    if session.emitter().agent_chunks_emitted() > 0 {
        warn!(
            session_id = %session.session_id,
            "Child closed stdout without a terminal event; content was produced"
        );
        return TurnEnd::Stop(StopReason::EndTurn);
    }
    let stderr_tail = bridge.stderr_tail().join("\n");
    TurnEnd::Failed(AgentError::bridge_failed(format!(
        "child exited without output; stderr: {}",
        if stderr_tail.is_empty() {
            "<empty>"
        } else {
            stderr_tail.as_str()
        }
    )))
}

/// Short-circuit the turn because the child needs interactive login
async fn auth_required_turn(
    session: &Arc<Session>,
    bridge: &mut dyn AgentBridge,
    message: &str,
) -> TurnEnd {
    warn!(session_id = %session.session_id, "Child requires authentication");
    let _ = session.emitter().agent_text(message);
    let _ = bridge.interrupt().await;
    let _ = session.emitter().fail_open_tool_calls("authentication required");
    TurnEnd::Stop(StopReason::AuthRequired)
}

/// Resolve one Codex approval request off the event loop
fn spawn_approval(
    session: &Arc<Session>,
    responder: Option<ApprovalResponder>,
    rpc_id: Value,
    method: String,
    params: Value,
) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        let legacy = codex::is_legacy_approval_method(&method);
        let tool_name = if method.contains("fileChange") || method == "applyPatchApproval" {
            "fileChange"
        } else {
            "commandExecution"
        };
        let correlation_id = format!("approval-{rpc_id}");

        let (outcome, _) = session
            .decide_permission(&correlation_id, tool_name, &params)
            .await;
        let decision = codex_decision(outcome, legacy);

        match responder {
            Some(responder) => {
                if let Err(e) = responder.respond(&rpc_id, decision).await {
                    warn!(
                        session_id = %session.session_id,
                        error = %e,
                        "Failed to answer approval request"
                    );
                }
            }
            None => warn!(
                session_id = %session.session_id,
                method = %method,
                "Approval request without a responder"
            ),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsManager;
    use crate::transport::ClientHandle;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    fn test_session() -> (Arc<Session>, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (client, rx) = ClientHandle::new();
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsManager::with_path(dir.path().join("settings.json")));
        std::mem::forget(dir);
        let session = Session::new(
            "s-disp".to_string(),
            PathBuf::from("/tmp/proj"),
            Engine::Claude,
            None,
            client,
            settings,
        );
        (session, rx)
    }

    #[test]
    fn test_auth_marker_scan() {
        assert!(contains_auth_marker("Please run /login to continue"));
        assert!(contains_auth_marker("Error: Invalid API key provided"));
        assert!(contains_auth_marker("your OAuth token has expired"));
        assert!(!contains_auth_marker("reading the login page HTML"));
        assert!(!contains_auth_marker("all good"));
    }

    #[test]
    fn test_value_auth_marker_scan() {
        let value = serde_json::json!([{"type": "text", "text": "API Login Failure"}]);
        assert!(value_contains_auth_marker(&value));
        let value = serde_json::json!({"output": "done"});
        assert!(!value_contains_auth_marker(&value));
    }

    #[tokio::test]
    async fn test_resolve_prompt_rejects_empty() {
        let (session, _rx) = test_session();
        let result = resolve_prompt(&session, Vec::new()).await;
        assert!(matches!(result, Err(AgentError::EmptyPrompt)));
    }

    #[tokio::test]
    async fn test_resolve_prompt_merges_text() {
        let (session, _rx) = test_session();
        let resolved = resolve_prompt(
            &session,
            vec![
                ContentBlock::text("first"),
                ContentBlock::text("second"),
                ContentBlock::Image {
                    data: "aGk=".to_string(),
                    mime_type: "image/png".to_string(),
                },
                ContentBlock::text("third"),
            ],
        )
        .await
        .unwrap();

        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0], ContentBlock::text("first\nsecond"));
        assert!(matches!(resolved[1], ContentBlock::Image { .. }));
        assert_eq!(resolved[2], ContentBlock::text("third"));
    }

    #[tokio::test]
    async fn test_resolve_prompt_inlines_embedded_resource() {
        let (session, _rx) = test_session();
        let resolved = resolve_prompt(
            &session,
            vec![ContentBlock::Resource {
                resource: EmbeddedResource::Text {
                    uri: "file:///tmp/a.rs".to_string(),
                    text: "fn main() {}".to_string(),
                    mime_type: None,
                },
            }],
        )
        .await
        .unwrap();

        match &resolved[0] {
            ContentBlock::Text { text } => {
                assert!(text.contains("<context uri=\"file:///tmp/a.rs\">"));
                assert!(text.contains("fn main() {}"));
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resource_link_without_capability_degrades_to_reference() {
        let (session, _rx) = test_session();
        let resolved = resolve_prompt(
            &session,
            vec![ContentBlock::ResourceLink {
                uri: "file:///tmp/b.rs".to_string(),
                name: Some("b.rs".to_string()),
                description: None,
                size: None,
            }],
        )
        .await
        .unwrap();

        assert_eq!(resolved[0], ContentBlock::text("[b.rs](file:///tmp/b.rs)"));
    }

    /// Bridge driven by a scripted event list; pends once the script is
    /// exhausted so cancellation paths can win the race.
    struct ScriptedBridge {
        events: StdMutex<VecDeque<BridgeEvent>>,
        prompts: StdMutex<Vec<Vec<ContentBlock>>>,
        alive: AtomicBool,
        interrupted: Arc<AtomicBool>,
    }

    impl ScriptedBridge {
        fn new(events: Vec<BridgeEvent>) -> (Box<Self>, Arc<AtomicBool>) {
            let interrupted = Arc::new(AtomicBool::new(false));
            let bridge = Box::new(Self {
                events: StdMutex::new(events.into()),
                prompts: StdMutex::new(Vec::new()),
                alive: AtomicBool::new(true),
                interrupted: Arc::clone(&interrupted),
            });
            (bridge, interrupted)
        }
    }

    #[async_trait::async_trait]
    impl crate::bridge::AgentBridge for ScriptedBridge {
        fn engine(&self) -> Engine {
            Engine::Claude
        }

        async fn send_prompt(&mut self, blocks: &[ContentBlock]) -> crate::types::Result<()> {
            self.prompts.lock().unwrap().push(blocks.to_vec());
            Ok(())
        }

        async fn next_event(&mut self) -> Option<BridgeEvent> {
            let next = self.events.lock().unwrap().pop_front();
            match next {
                Some(event) => Some(event),
                None => std::future::pending().await,
            }
        }

        async fn interrupt(&mut self) -> crate::types::Result<()> {
            self.interrupted.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&mut self) -> crate::types::Result<()> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn child_session_id(&self) -> Option<String> {
            None
        }

        fn stderr_tail(&self) -> Vec<String> {
            Vec::new()
        }
    }

    /// Install a scripted bridge so `ensure_bridge` reuses it
    async fn install_bridge(session: &Arc<Session>, bridge: Box<ScriptedBridge>) {
        session.set_bridge_config(Some(session.desired_bridge_config()));
        *session.bridge().lock().await = Some(bridge);
    }

    fn no_auto_continue() -> AutoContinue {
        AutoContinue::with_oracle(None, Duration::ZERO)
    }

    fn update_frames(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let value: Value = serde_json::from_str(&frame).unwrap();
            if value["method"] == "session/update" {
                frames.push(value["params"]["update"].clone());
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_trivial_turn_streams_text_and_ends() {
        let (session, mut rx) = test_session();
        let (bridge, _) = ScriptedBridge::new(vec![
            BridgeEvent::AgentText("hello".to_string()),
            BridgeEvent::Turn {
                signal: crate::bridge::StopSignal::EndTurn,
                error: None,
            },
        ]);
        install_bridge(&session, bridge).await;
        session.begin_prompt().unwrap();

        let stop = run_turn(&session, &no_auto_continue(), vec![ContentBlock::text("hi")])
            .await
            .unwrap();
        session.finish_turn();

        assert_eq!(stop, StopReason::EndTurn);
        let updates = update_frames(&mut rx);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["sessionUpdate"], "agent_message_chunk");
        assert_eq!(updates[0]["content"]["text"], "hello");
        // The bridge survives for the next prompt.
        assert!(session.bridge().lock().await.is_some());
    }

    #[tokio::test]
    async fn test_tool_call_precedes_terminal_update() {
        let (session, mut rx) = test_session();
        let (bridge, _) = ScriptedBridge::new(vec![
            BridgeEvent::ToolCall {
                id: "toolu_1".to_string(),
                name: "Read".to_string(),
                input: serde_json::json!({"file_path": "/tmp/x"}),
            },
            BridgeEvent::ToolResult {
                id: "toolu_1".to_string(),
                content: Some(Value::String("body".to_string())),
                failed: false,
            },
            BridgeEvent::Turn {
                signal: crate::bridge::StopSignal::EndTurn,
                error: None,
            },
        ]);
        install_bridge(&session, bridge).await;
        session.begin_prompt().unwrap();

        let stop = run_turn(&session, &no_auto_continue(), vec![ContentBlock::text("read")])
            .await
            .unwrap();
        assert_eq!(stop, StopReason::EndTurn);

        let updates = update_frames(&mut rx);
        assert_eq!(updates[0]["sessionUpdate"], "tool_call");
        assert_eq!(updates[0]["toolCallId"], "toolu_1");
        assert_eq!(updates[1]["sessionUpdate"], "tool_call_update");
        assert_eq!(updates[1]["status"], "completed");
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_and_reports_cancelled() {
        let (session, mut rx) = test_session();
        let (bridge, interrupted) =
            ScriptedBridge::new(vec![BridgeEvent::AgentText("partial".to_string())]);
        install_bridge(&session, bridge).await;
        session.begin_prompt().unwrap();

        let turn = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                run_turn(&session, &no_auto_continue(), vec![ContentBlock::text("go")]).await
            })
        };

        // Let the first chunk stream, then cancel mid-turn.
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("agent_message_chunk"));
        session.cancel();

        let stop = turn.await.unwrap().unwrap();
        assert_eq!(stop, StopReason::Cancelled);
        assert!(interrupted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_eof_with_content_is_end_turn() {
        let (session, _rx) = test_session();
        let (bridge, _) = ScriptedBridge::new(vec![
            BridgeEvent::AgentText("some output".to_string()),
            BridgeEvent::Closed,
        ]);
        install_bridge(&session, bridge).await;
        session.begin_prompt().unwrap();

        let stop = run_turn(&session, &no_auto_continue(), vec![ContentBlock::text("hi")])
            .await
            .unwrap();
        assert_eq!(stop, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn test_eof_without_content_is_failure() {
        let (session, _rx) = test_session();
        let (bridge, _) = ScriptedBridge::new(vec![BridgeEvent::Closed]);
        install_bridge(&session, bridge).await;
        session.begin_prompt().unwrap();

        let result = run_turn(&session, &no_auto_continue(), vec![ContentBlock::text("hi")])
            .await;
        assert!(matches!(result, Err(AgentError::BridgeFailed(_))));
    }

    #[tokio::test]
    async fn test_auth_marker_short_circuits_turn() {
        let (session, mut rx) = test_session();
        let (bridge, _) = ScriptedBridge::new(vec![BridgeEvent::AgentText(
            "Please run /login to authenticate".to_string(),
        )]);
        install_bridge(&session, bridge).await;
        session.begin_prompt().unwrap();

        let stop = run_turn(&session, &no_auto_continue(), vec![ContentBlock::text("hi")])
            .await
            .unwrap();
        assert_eq!(stop, StopReason::AuthRequired);

        let updates = update_frames(&mut rx);
        assert_eq!(updates[0]["sessionUpdate"], "agent_message_chunk");
    }

    #[tokio::test]
    async fn test_max_turns_queues_continuation_with_oracle() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let oracle_path = dir.path().join("oracle.sh");
        let mut file = std::fs::File::create(&oracle_path).unwrap();
        writeln!(file, "#!/bin/sh\nprintf '[{{}}]'").unwrap();
        drop(file);
        let mut perms = std::fs::metadata(&oracle_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&oracle_path, perms).unwrap();

        let (session, _rx) = test_session();
        session.set_auto_continue(true);
        let (bridge, _) = ScriptedBridge::new(vec![BridgeEvent::Turn {
            signal: crate::bridge::StopSignal::MaxTurnRequests,
            error: Some("turn limit".to_string()),
        }]);
        install_bridge(&session, bridge).await;
        session.begin_prompt().unwrap();

        let controller = AutoContinue::with_oracle(
            Some(oracle_path.to_string_lossy().into_owned()),
            Duration::ZERO,
        );
        let stop = run_turn(&session, &controller, vec![ContentBlock::text("go")])
            .await
            .unwrap();

        assert_eq!(stop, StopReason::MaxTurnRequests);
        let continuation = session.take_continuation().unwrap();
        assert_eq!(continuation.engine, Engine::Claude);
    }

    #[tokio::test]
    async fn test_resource_link_resolved_through_client() {
        let (session, mut rx) = test_session();
        session.client().set_capabilities(
            serde_json::from_str(r#"{"fs":{"readTextFile":true}}"#).unwrap(),
        );

        let resolving = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                resolve_prompt(
                    &session,
                    vec![ContentBlock::ResourceLink {
                        uri: "file:///tmp/c.rs".to_string(),
                        name: None,
                        description: None,
                        size: None,
                    }],
                )
                .await
            })
        };

        let frame = rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["method"], "fs/read_text_file");
        assert_eq!(value["params"]["path"], "/tmp/c.rs");
        session.client().handle_response(
            &value["id"],
            Some(serde_json::json!({"content": "let c = 3;"})),
            None,
        );

        let resolved = resolving.await.unwrap().unwrap();
        match &resolved[0] {
            ContentBlock::Text { text } => {
                assert!(text.contains("let c = 3;"));
            }
            other => panic!("expected text, got {other:?}"),
        }
    }
}
