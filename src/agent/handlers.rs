//! ACP request handlers
//!
//! The top-level router: classifies inbound frames, dispatches requests to
//! typed handlers, forwards client responses to their waiting tasks, and
//! runs continuation turns after a `session/prompt` response goes out.
//! Exactly one response is emitted per inbound request; notifications never
//! get one.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::protocol::acp::{
    method, CancelParams, ContentBlock, InitializeParams, InitializeResponse, NewSessionParams,
    NewSessionResponse, PromptParams, PromptResponse, SessionMode, SessionModeState, SessionModel,
    SessionModelState, SetConfigOptionParams, SetModeParams, SetModelParams, PROTOCOL_VERSION,
};
use crate::protocol::jsonrpc::{self, Inbound, RpcError};
use crate::protocol::update::AvailableCommand;
use crate::session::{dispatcher, Session};
use crate::types::{AgentError, Engine, PermissionMode, Result};

use super::core::AcpAgent;

/// Route one inbound line or text frame
///
/// Requests run in their own task so the read loop stays responsive (a
/// `session/cancel` must get through while a prompt is streaming).
pub async fn route_line(agent: &Arc<AcpAgent>, raw: &str) {
    match jsonrpc::parse_message(raw) {
        Ok(Inbound::Request { id, method, params }) => {
            let agent = Arc::clone(agent);
            tokio::spawn(async move {
                handle_request(&agent, id, &method, params).await;
            });
        }
        Ok(Inbound::Notification { method, params }) => {
            handle_notification(agent, &method, params).await;
        }
        Ok(Inbound::Response { id, result, error }) => {
            agent.client().handle_response(&id, result, error);
        }
        Err(rpc_error) => {
            debug!(code = rpc_error.code, "Rejecting malformed frame");
            let _ = agent.client().send_error(&Value::Null, &rpc_error);
        }
    }
}

/// Dispatch one request and emit exactly one response for it
async fn handle_request(agent: &Arc<AcpAgent>, id: Value, method: &str, params: Value) {
    let outcome: Result<Value> = match method {
        method::INITIALIZE => handle_initialize(agent, params),
        method::SESSION_NEW => {
            match handle_new_session(agent, params).await {
                Ok((response, session)) => {
                    // The response goes out first; the slash-command
                    // advertisement follows it on the same writer.
                    send_outcome(agent, &id, Ok(response));
                    let commands = available_commands(session.engine());
                    if let Err(e) = session.emitter().available_commands(commands) {
                        warn!(
                            session_id = %session.session_id,
                            error = %e,
                            "Failed to send available commands update"
                        );
                    }
                    return;
                }
                Err(e) => Err(e),
            }
        }
        method::SESSION_PROMPT => {
            // The prompt path sends its own response so continuation turns
            // can start strictly after it.
            handle_prompt(agent, &id, params).await;
            return;
        }
        method::SESSION_SET_MODE => handle_set_mode(agent, params),
        method::SESSION_SET_MODEL => handle_set_model(agent, params),
        method::SESSION_SET_CONFIG_OPTION => handle_set_config_option(agent, params),
        other => Err(AgentError::MethodNotFound(other.to_string())),
    };

    send_outcome(agent, &id, outcome);
}

fn send_outcome(agent: &Arc<AcpAgent>, id: &Value, outcome: Result<Value>) {
    let send_result = match outcome {
        Ok(result) => agent.client().send_response(id, result),
        Err(error) => {
            let rpc_error = RpcError::new(error.error_code(), error.to_string());
            agent.client().send_error(id, &rpc_error)
        }
    };
    if let Err(e) = send_result {
        warn!(error = %e, "Failed to send response");
    }
}

/// Handle a notification; never emits a response
async fn handle_notification(agent: &Arc<AcpAgent>, method: &str, params: Value) {
    match method {
        method::SESSION_CANCEL => {
            let Ok(params) = serde_json::from_value::<CancelParams>(params) else {
                warn!("session/cancel with malformed params");
                return;
            };
            match agent.sessions().get_session(&params.session_id) {
                Some(session) => {
                    info!(session_id = %params.session_id, "Cancellation requested");
                    session.cancel();
                }
                None => warn!(session_id = %params.session_id, "Cancel for unknown session"),
            }
        }
        other => debug!(method = %other, "Ignoring unknown notification"),
    }
}

/// Handle initialize: version negotiation and capability exchange
#[instrument(name = "acp_initialize", skip(agent, params))]
fn handle_initialize(agent: &Arc<AcpAgent>, params: Value) -> Result<Value> {
    let params: InitializeParams = parse_params(params)?;

    if params.protocol_version < PROTOCOL_VERSION {
        return Err(AgentError::UnsupportedVersion(params.protocol_version));
    }

    info!(
        protocol_version = params.protocol_version,
        fs_read = params.client_capabilities.fs.read_text_file,
        fs_write = params.client_capabilities.fs.write_text_file,
        terminal = params.client_capabilities.terminal,
        resume_session = params.client_capabilities.resume_session,
        "Handling initialize request"
    );

    agent.client().set_capabilities(params.client_capabilities);
    Ok(serde_json::to_value(InitializeResponse::current())?)
}

/// Handle session/new: allocate a session and seed modes/models
///
/// Returns the response payload plus the session so the caller can push the
/// `available_commands_update` after the response frame.
#[instrument(name = "acp_new_session", skip(agent, params))]
async fn handle_new_session(
    agent: &Arc<AcpAgent>,
    params: Value,
) -> Result<(Value, Arc<Session>)> {
    let params: NewSessionParams = parse_params(params)?;

    let engine = match params.config_options.get("engine").and_then(Value::as_str) {
        Some(name) => {
            Engine::parse(name).ok_or_else(|| AgentError::InvalidEngine(name.to_string()))?
        }
        None => agent.config().effective_default_engine(),
    };

    let model = match params.config_options.get("model").and_then(Value::as_str) {
        Some(model) if engine.supports_model(model) => Some(model.to_string()),
        Some(model) => return Err(AgentError::InvalidModel(model.to_string())),
        None => None,
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    info!(
        session_id = %session_id,
        cwd = %params.cwd.display(),
        engine = %engine,
        "Creating new session"
    );

    let session = agent.sessions().create_session(
        session_id.clone(),
        params.cwd.clone(),
        engine,
        model.clone(),
        agent.client().clone(),
        Arc::clone(agent.settings()),
    )?;

    // Resume: within-session restarts when the client asked for it, and the
    // last recorded child session unless disabled by environment.
    if agent.client().capabilities().resume_session {
        session.enable_resume();
    }
    if !agent.config().no_auto_resume {
        if let Some(token) = agent.settings().resume_token(engine, &params.cwd) {
            debug!(session_id = %session_id, "Seeding resume token from settings");
            session.enable_resume();
            session.seed_resume(engine, token);
        }
    }

    let auto_continue = params
        .config_options
        .get("autoContinue")
        .and_then(Value::as_bool)
        .unwrap_or_else(|| agent.config().auto_continue_available());
    session.set_auto_continue(auto_continue);

    let response = NewSessionResponse {
        session_id,
        modes: build_mode_state(PermissionMode::default()),
        models: build_model_state(engine, model.as_deref()),
    };
    Ok((serde_json::to_value(response)?, session))
}

/// Handle session/prompt, emit its response, then run continuations
async fn handle_prompt(agent: &Arc<AcpAgent>, id: &Value, params: Value) {
    let params: PromptParams = match parse_params(params) {
        Ok(params) => params,
        Err(e) => return send_outcome(agent, id, Err(e)),
    };

    let session = match agent.sessions().get_session_or_error(&params.session_id) {
        Ok(session) => session,
        Err(e) => return send_outcome(agent, id, Err(e)),
    };

    if let Err(e) = session.begin_prompt() {
        return send_outcome(agent, id, Err(e));
    }

    info!(
        session_id = %session.session_id,
        prompt_blocks = params.prompt.len(),
        "Starting prompt turn"
    );

    let result = dispatcher::run_turn(&session, agent.auto_continue(), params.prompt).await;
    session.finish_turn();

    match result {
        Ok(stop_reason) => {
            info!(
                session_id = %session.session_id,
                stop_reason = ?stop_reason,
                "Prompt turn completed"
            );
            let response = PromptResponse { stop_reason };
            match serde_json::to_value(response) {
                Ok(value) => send_outcome(agent, id, Ok(value)),
                Err(e) => send_outcome(agent, id, Err(e.into())),
            }
            run_continuations(agent, &session).await;
        }
        Err(e) => {
            warn!(
                session_id = %session.session_id,
                error = %e,
                "Prompt turn failed"
            );
            send_outcome(agent, id, Err(e));
        }
    }
}

/// Consume queued continuation turns until the slot is empty
///
/// Continuations are internal turns: no originating request, no response
/// frame. Each begins with a `user_message_chunk` carrying the prompt and is
/// pinned to the engine of the turn that queued it.
async fn run_continuations(agent: &Arc<AcpAgent>, session: &Arc<Session>) {
    while let Some(continuation) = session.take_continuation() {
        if session.is_cancelled() {
            debug!(session_id = %session.session_id, "Dropping continuation after cancel");
            break;
        }
        if let Err(e) = session.set_engine(continuation.engine) {
            warn!(session_id = %session.session_id, error = %e, "Continuation engine pin failed");
            break;
        }
        if session.begin_prompt().is_err() {
            // Another prompt won the slot; the continuation yields to it.
            break;
        }

        info!(
            session_id = %session.session_id,
            engine = %continuation.engine,
            "Starting continuation turn"
        );
        if let Err(e) = session.emitter().user_text(&continuation.prompt) {
            warn!(session_id = %session.session_id, error = %e, "Failed to emit continuation prompt");
            session.finish_turn();
            break;
        }

        let blocks = vec![ContentBlock::text(continuation.prompt)];
        let result = dispatcher::run_turn(session, agent.auto_continue(), blocks).await;
        session.finish_turn();

        match result {
            Ok(stop_reason) => debug!(
                session_id = %session.session_id,
                stop_reason = ?stop_reason,
                "Continuation turn completed"
            ),
            Err(e) => {
                warn!(
                    session_id = %session.session_id,
                    error = %e,
                    "Continuation turn failed"
                );
                break;
            }
        }
    }
}

/// Handle session/set_mode
#[instrument(name = "acp_set_mode", skip(agent, params))]
fn handle_set_mode(agent: &Arc<AcpAgent>, params: Value) -> Result<Value> {
    let params: SetModeParams = parse_params(params)?;
    let session = agent.sessions().get_session_or_error(&params.session_id)?;

    let mode = PermissionMode::parse(&params.mode_id)
        .ok_or_else(|| AgentError::InvalidMode(params.mode_id.clone()))?;

    let previous = session.permission_mode();
    session.set_permission_mode(mode);
    if let Err(e) = session.emitter().current_mode(mode.as_str()) {
        warn!(session_id = %session.session_id, error = %e, "Failed to send mode update");
    }

    info!(
        session_id = %session.session_id,
        previous_mode = %previous.as_str(),
        new_mode = %mode.as_str(),
        "Session mode changed"
    );
    Ok(json!({}))
}

/// Handle session/set_model
#[instrument(name = "acp_set_model", skip(agent, params))]
fn handle_set_model(agent: &Arc<AcpAgent>, params: Value) -> Result<Value> {
    let params: SetModelParams = parse_params(params)?;
    let session = agent.sessions().get_session_or_error(&params.session_id)?;

    let engine = session.engine();
    if !engine.supports_model(&params.model_id) {
        return Err(AgentError::InvalidModel(format!(
            "{} (engine {engine})",
            params.model_id
        )));
    }

    session.set_model(Some(params.model_id.clone()));
    if let Err(e) = session.emitter().current_model(&params.model_id) {
        warn!(session_id = %session.session_id, error = %e, "Failed to send model update");
    }

    info!(
        session_id = %session.session_id,
        model = %params.model_id,
        "Session model changed"
    );
    Ok(json!({}))
}

/// Handle session/set_config_option
///
/// Recognized options: `engine` (between prompts only) and `autoContinue`.
/// Unknown options are ignored for forward compatibility.
#[instrument(name = "acp_set_config_option", skip(agent, params))]
fn handle_set_config_option(agent: &Arc<AcpAgent>, params: Value) -> Result<Value> {
    let params: SetConfigOptionParams = parse_params(params)?;
    let session = agent.sessions().get_session_or_error(&params.session_id)?;

    match params.option_id.as_str() {
        "engine" => {
            let name = params
                .value
                .as_str()
                .ok_or_else(|| AgentError::invalid_params("engine must be a string"))?;
            let engine = Engine::parse(name)
                .ok_or_else(|| AgentError::InvalidEngine(name.to_string()))?;
            session.set_engine(engine)?;
            info!(session_id = %session.session_id, engine = %engine, "Session engine set");
        }
        "autoContinue" => {
            let enabled = params
                .value
                .as_bool()
                .ok_or_else(|| AgentError::invalid_params("autoContinue must be a boolean"))?;
            session.set_auto_continue(enabled);
            info!(session_id = %session.session_id, enabled, "Auto-continue toggled");
        }
        other => debug!(option = %other, "Ignoring unknown config option"),
    }
    Ok(json!({}))
}

// === Helpers ===

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| AgentError::invalid_params(e.to_string()))
}

/// Available permission modes with the given current selection
fn build_mode_state(current: PermissionMode) -> SessionModeState {
    SessionModeState {
        current_mode_id: current.as_str().to_string(),
        available_modes: PermissionMode::all()
            .iter()
            .map(|mode| SessionMode {
                id: mode.as_str().to_string(),
                name: mode.display_name().to_string(),
                description: mode.description().to_string(),
            })
            .collect(),
    }
}

/// The engine's model set with the given current selection
fn build_model_state(engine: Engine, current: Option<&str>) -> SessionModelState {
    let models = engine.models();
    SessionModelState {
        current_model_id: current.unwrap_or(models[0]).to_string(),
        available_models: models
            .iter()
            .map(|model| SessionModel {
                model_id: (*model).to_string(),
                name: (*model).to_string(),
            })
            .collect(),
    }
}

/// Slash commands registered for a new session
fn available_commands(engine: Engine) -> Vec<AvailableCommand> {
    let mut commands = vec![
        AvailableCommand {
            name: "init".to_string(),
            description: "Set up project instructions for the agent".to_string(),
        },
        AvailableCommand {
            name: "compact".to_string(),
            description: "Compact the conversation to free context".to_string(),
        },
    ];
    if engine == Engine::Claude {
        commands.push(AvailableCommand {
            name: "review".to_string(),
            description: "Review the current changes".to_string(),
        });
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsManager;
    use crate::transport::ClientHandle;
    use crate::types::AdapterConfig;
    use pretty_assertions::assert_eq;

    fn test_agent() -> (Arc<AcpAgent>, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (client, rx) = ClientHandle::new();
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsManager::with_path(dir.path().join("settings.json")));
        std::mem::forget(dir);
        let agent = AcpAgent::with_settings(AdapterConfig::default(), client, settings);
        (agent, rx)
    }

    async fn recv_json_async(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> Value {
        serde_json::from_str(&rx.recv().await.expect("expected a frame")).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_roundtrip() {
        let (agent, mut rx) = test_agent();
        route_line(
            &agent,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":1,"clientCapabilities":{"fs":{"readTextFile":true,"writeTextFile":true}}}}"#,
        )
        .await;

        let response = recv_json_async(&mut rx).await;
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["protocolVersion"], 1);
        assert_eq!(
            response["result"]["agentCapabilities"]["promptCapabilities"]["image"],
            true
        );
        assert!(agent.client().capabilities().fs.read_text_file);
    }

    #[tokio::test]
    async fn test_initialize_version_zero_rejected() {
        let (agent, mut rx) = test_agent();
        route_line(
            &agent,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":0}}"#,
        )
        .await;

        let response = recv_json_async(&mut rx).await;
        assert_eq!(response["error"]["code"], -32001);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (agent, mut rx) = test_agent();
        route_line(
            &agent,
            r#"{"jsonrpc":"2.0","id":9,"method":"bogus/method","params":{}}"#,
        )
        .await;

        let response = recv_json_async(&mut rx).await;
        assert_eq!(response["id"], 9);
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_parse_error_frame() {
        let (agent, mut rx) = test_agent();
        route_line(&agent, "{this is not json").await;
        let response = recv_json_async(&mut rx).await;
        assert_eq!(response["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_new_session_response_shape() {
        let (agent, mut rx) = test_agent();
        route_line(
            &agent,
            r#"{"jsonrpc":"2.0","id":2,"method":"session/new","params":{"cwd":"/tmp/proj"}}"#,
        )
        .await;

        let response = recv_json_async(&mut rx).await;
        let result = &response["result"];
        assert!(result["sessionId"].is_string());
        assert_eq!(result["modes"]["currentModeId"], "default");
        assert_eq!(result["modes"]["availableModes"].as_array().unwrap().len(), 5);
        assert_eq!(result["models"]["currentModelId"], "sonnet");

        // The commands update follows the response.
        let update = recv_json_async(&mut rx).await;
        assert_eq!(update["method"], "session/update");
        assert_eq!(
            update["params"]["update"]["sessionUpdate"],
            "available_commands_update"
        );
        assert_eq!(agent.sessions().session_count(), 1);
    }

    #[tokio::test]
    async fn test_new_session_with_engine_and_model() {
        let (agent, mut rx) = test_agent();
        route_line(
            &agent,
            r#"{"jsonrpc":"2.0","id":3,"method":"session/new","params":{"cwd":"/tmp","configOptions":{"engine":"codex","model":"o3"}}}"#,
        )
        .await;

        let response = recv_json_async(&mut rx).await;
        assert_eq!(response["result"]["models"]["currentModelId"], "o3");
        let session_id = response["result"]["sessionId"].as_str().unwrap();
        let session = agent.sessions().get_session(session_id).unwrap();
        assert_eq!(session.engine(), Engine::Codex);
    }

    #[tokio::test]
    async fn test_new_session_rejects_wrong_model() {
        let (agent, mut rx) = test_agent();
        route_line(
            &agent,
            r#"{"jsonrpc":"2.0","id":4,"method":"session/new","params":{"cwd":"/tmp","configOptions":{"engine":"codex","model":"haiku"}}}"#,
        )
        .await;

        let response = recv_json_async(&mut rx).await;
        assert_eq!(response["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_set_mode_updates_and_notifies() {
        let (agent, mut rx) = test_agent();
        route_line(
            &agent,
            r#"{"jsonrpc":"2.0","id":5,"method":"session/new","params":{"cwd":"/tmp"}}"#,
        )
        .await;
        let response = recv_json_async(&mut rx).await;
        let session_id = response["result"]["sessionId"].as_str().unwrap().to_string();
        let _commands = recv_json_async(&mut rx).await;

        route_line(
            &agent,
            &format!(
                r#"{{"jsonrpc":"2.0","id":6,"method":"session/set_mode","params":{{"sessionId":"{session_id}","modeId":"acceptEdits"}}}}"#
            ),
        )
        .await;

        // Mode update notification and response, in emitted order.
        let first = recv_json_async(&mut rx).await;
        let second = recv_json_async(&mut rx).await;
        let (update, response) = if first["method"] == "session/update" {
            (first, second)
        } else {
            (second, first)
        };
        assert_eq!(update["params"]["update"]["currentModeId"], "acceptEdits");
        assert!(response["result"].is_object());

        let session = agent.sessions().get_session(&session_id).unwrap();
        assert_eq!(session.permission_mode(), PermissionMode::AcceptEdits);
    }

    #[tokio::test]
    async fn test_set_model_validates_engine_set() {
        let (agent, mut rx) = test_agent();
        route_line(
            &agent,
            r#"{"jsonrpc":"2.0","id":7,"method":"session/new","params":{"cwd":"/tmp"}}"#,
        )
        .await;
        let response = recv_json_async(&mut rx).await;
        let session_id = response["result"]["sessionId"].as_str().unwrap().to_string();
        let _commands = recv_json_async(&mut rx).await;

        route_line(
            &agent,
            &format!(
                r#"{{"jsonrpc":"2.0","id":8,"method":"session/set_model","params":{{"sessionId":"{session_id}","modelId":"o3"}}}}"#
            ),
        )
        .await;
        let response = recv_json_async(&mut rx).await;
        assert_eq!(response["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_cancel_notification_no_response() {
        let (agent, mut rx) = test_agent();
        route_line(
            &agent,
            r#"{"jsonrpc":"2.0","method":"session/cancel","params":{"sessionId":"missing"}}"#,
        )
        .await;
        // Notifications never produce a response frame.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_set_config_option_engine_and_auto_continue() {
        let (agent, mut rx) = test_agent();
        route_line(
            &agent,
            r#"{"jsonrpc":"2.0","id":10,"method":"session/new","params":{"cwd":"/tmp"}}"#,
        )
        .await;
        let response = recv_json_async(&mut rx).await;
        let session_id = response["result"]["sessionId"].as_str().unwrap().to_string();
        let _commands = recv_json_async(&mut rx).await;

        route_line(
            &agent,
            &format!(
                r#"{{"jsonrpc":"2.0","id":11,"method":"session/set_config_option","params":{{"sessionId":"{session_id}","optionId":"engine","value":"codex"}}}}"#
            ),
        )
        .await;
        let response = recv_json_async(&mut rx).await;
        assert!(response["result"].is_object());

        let session = agent.sessions().get_session(&session_id).unwrap();
        assert_eq!(session.engine(), Engine::Codex);

        route_line(
            &agent,
            &format!(
                r#"{{"jsonrpc":"2.0","id":12,"method":"session/set_config_option","params":{{"sessionId":"{session_id}","optionId":"autoContinue","value":true}}}}"#
            ),
        )
        .await;
        let _response = recv_json_async(&mut rx).await;
        assert!(session.auto_continue_enabled());
    }

    #[tokio::test]
    async fn test_prompt_on_unknown_session() {
        let (agent, mut rx) = test_agent();
        route_line(
            &agent,
            r#"{"jsonrpc":"2.0","id":13,"method":"session/prompt","params":{"sessionId":"ghost","prompt":[{"type":"text","text":"hi"}]}}"#,
        )
        .await;
        let response = recv_json_async(&mut rx).await;
        assert_eq!(response["id"], 13);
        assert_eq!(response["error"]["code"], -32600);
    }

    #[test]
    fn test_mode_and_model_states() {
        let modes = build_mode_state(PermissionMode::Plan);
        assert_eq!(modes.current_mode_id, "plan");
        assert_eq!(modes.available_modes.len(), 5);

        let models = build_model_state(Engine::Codex, None);
        assert_eq!(models.current_model_id, "o3");
        assert_eq!(models.available_models.len(), 3);

        let models = build_model_state(Engine::Claude, Some("opus"));
        assert_eq!(models.current_model_id, "opus");
    }
}
