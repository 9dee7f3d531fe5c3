//! Session state
//!
//! A session is one durable conversation with one engine. It owns its
//! bridge, its update emitter (with the tool-call table), its permission
//! policy and rendezvous, its continuation slot, and the hook socket
//! listener. At most one prompt is in flight per session, enforced by the
//! Idle → Prompting transition.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::bridge::AgentBridge;
use crate::permissions::hook_socket::{hook_socket_path, HookListener, HookRequest, HookResponse};
use crate::permissions::policy::PolicyDecision;
use crate::permissions::{PermissionOutcome, PermissionPolicy, PermissionRendezvous};
use crate::protocol::acp::{
    PermissionOption, PermissionOutcomePayload, PermissionToolCall, RequestPermissionParams,
};
use crate::settings::SettingsManager;
use crate::transport::ClientHandle;
use crate::types::{AgentError, Engine, PermissionMode, Result};

use super::emitter::{extract_tool_info, UpdateEmitter};

/// Position in the per-session prompt state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Prompting,
    Streaming,
    Completing,
    Cancelling,
}

/// Bridge launch configuration, cached for restart comparison
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub engine: Engine,
    pub cwd: PathBuf,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    pub resume: Option<String>,
}

/// A queued follow-up prompt, engine pinned to the source turn
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    pub prompt: String,
    pub engine: Engine,
}

/// An active session
pub struct Session {
    pub session_id: String,
    pub cwd: PathBuf,
    client: ClientHandle,
    emitter: UpdateEmitter,
    policy: PermissionPolicy,
    rendezvous: PermissionRendezvous,
    settings: Arc<SettingsManager>,

    engine: RwLock<Engine>,
    model: RwLock<Option<String>>,
    permission_mode: RwLock<PermissionMode>,
    state: StdMutex<SessionState>,

    cancelled: AtomicBool,
    cancel_notify: Notify,

    bridge: Mutex<Option<Box<dyn AgentBridge>>>,
    bridge_config: StdMutex<Option<BridgeConfig>>,
    hook_listener: StdMutex<Option<HookListener>>,

    continuation: StdMutex<Option<Continuation>>,
    auto_continue: AtomicBool,
    last_auto_continue: StdMutex<Option<Instant>>,

    /// Child session ids observed this session, per engine
    child_session_ids: DashMap<Engine, String>,
    /// Resume seeds from the settings file, per engine
    initial_resume: DashMap<Engine, String>,
    /// Whether bridge restarts carry the child session id forward
    resume_enabled: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("cwd", &self.cwd)
            .field("engine", &self.engine())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session
    ///
    /// Returns `Arc<Self>` because the hook handler and approval tasks hold
    /// clones back into the session.
    pub fn new(
        session_id: String,
        cwd: PathBuf,
        engine: Engine,
        model: Option<String>,
        client: ClientHandle,
        settings: Arc<SettingsManager>,
    ) -> Arc<Self> {
        let emitter = UpdateEmitter::new(session_id.clone(), client.clone());
        let policy = PermissionPolicy::new();
        policy.seed_always_allow(settings.always_allowed(engine));

        Arc::new(Self {
            session_id,
            cwd,
            client,
            emitter,
            policy,
            rendezvous: PermissionRendezvous::new(),
            settings,
            engine: RwLock::new(engine),
            model: RwLock::new(model),
            permission_mode: RwLock::new(PermissionMode::default()),
            state: StdMutex::new(SessionState::Idle),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            bridge: Mutex::new(None),
            bridge_config: StdMutex::new(None),
            hook_listener: StdMutex::new(None),
            continuation: StdMutex::new(None),
            auto_continue: AtomicBool::new(false),
            last_auto_continue: StdMutex::new(None),
            child_session_ids: DashMap::new(),
            initial_resume: DashMap::new(),
            resume_enabled: AtomicBool::new(false),
        })
    }

    // === Accessors ===

    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    pub fn emitter(&self) -> &UpdateEmitter {
        &self.emitter
    }

    pub fn rendezvous(&self) -> &PermissionRendezvous {
        &self.rendezvous
    }

    pub fn engine(&self) -> Engine {
        self.engine.read().map(|e| *e).unwrap_or_default()
    }

    pub fn model(&self) -> Option<String> {
        self.model.read().ok().and_then(|m| m.clone())
    }

    pub fn permission_mode(&self) -> PermissionMode {
        self.permission_mode
            .read()
            .map(|m| *m)
            .unwrap_or_default()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    // === State machine ===

    /// Atomically claim the session for a new prompt (Idle → Prompting)
    pub fn begin_prompt(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != SessionState::Idle {
            return Err(AgentError::session_busy(self.session_id.clone()));
        }
        *state = SessionState::Prompting;
        drop(state);
        self.cancelled.store(false, Ordering::SeqCst);
        self.emitter.begin_turn();
        Ok(())
    }

    pub fn set_streaming(&self) {
        self.set_state(SessionState::Streaming);
    }

    pub fn set_completing(&self) {
        self.set_state(SessionState::Completing);
    }

    pub fn set_cancelling(&self) {
        self.set_state(SessionState::Cancelling);
    }

    /// Return the session to Idle after a turn
    pub fn finish_turn(&self) {
        self.set_state(SessionState::Idle);
    }

    // === Cancellation ===

    /// Mark the session cancelled and wake everything parked on it
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.rendezvous.cancel_all();
        self.cancel_notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until the session is cancelled
    pub async fn wait_cancelled(&self) {
        while !self.is_cancelled() {
            self.cancel_notify.notified().await;
        }
    }

    // === Engine / model / mode ===

    /// Change the engine; only legal between prompts
    pub fn set_engine(&self, engine: Engine) -> Result<()> {
        if self.state() != SessionState::Idle {
            return Err(AgentError::session_busy(self.session_id.clone()));
        }
        if let Ok(mut slot) = self.engine.write() {
            if *slot != engine {
                info!(
                    session_id = %self.session_id,
                    from = %*slot,
                    to = %engine,
                    "Switching session engine"
                );
                *slot = engine;
                // Model sets are per-engine; a stale model must not leak over.
                if let Ok(mut model) = self.model.write() {
                    *model = None;
                }
                self.policy
                    .seed_always_allow(self.settings.always_allowed(engine));
            }
        }
        Ok(())
    }

    pub fn set_model(&self, model: Option<String>) {
        if let Ok(mut slot) = self.model.write() {
            *slot = model;
        }
    }

    pub fn set_permission_mode(&self, mode: PermissionMode) {
        if let Ok(mut slot) = self.permission_mode.write() {
            *slot = mode;
        }
    }

    // === Bridge ownership ===

    pub fn bridge(&self) -> &Mutex<Option<Box<dyn AgentBridge>>> {
        &self.bridge
    }

    pub fn bridge_config(&self) -> Option<BridgeConfig> {
        self.bridge_config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_bridge_config(&self, config: Option<BridgeConfig>) {
        *self
            .bridge_config
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = config;
    }

    /// The launch configuration a bridge would need right now
    pub fn desired_bridge_config(&self) -> BridgeConfig {
        let engine = self.engine();
        BridgeConfig {
            engine,
            cwd: self.cwd.clone(),
            permission_mode: self.permission_mode(),
            model: self.model(),
            resume: self.resume_for(engine),
        }
    }

    // === Resume tokens ===

    /// Enable carrying child session ids across bridge restarts
    pub fn enable_resume(&self) {
        self.resume_enabled.store(true, Ordering::SeqCst);
    }

    /// Seed a resume token from persisted settings
    pub fn seed_resume(&self, engine: Engine, token: String) {
        self.initial_resume.insert(engine, token);
    }

    /// Record the child's announced session/thread id
    pub fn record_child_session(&self, engine: Engine, child_session_id: &str) {
        if child_session_id.is_empty() {
            return;
        }
        self.child_session_ids
            .insert(engine, child_session_id.to_string());
        if let Err(e) = self
            .settings
            .record_last_session(engine, child_session_id, &self.cwd)
        {
            warn!(
                session_id = %self.session_id,
                error = %e,
                "Failed to persist last session id"
            );
        }
    }

    /// Resume token for the next bridge launch, if resume is enabled
    pub fn resume_for(&self, engine: Engine) -> Option<String> {
        if !self.resume_enabled.load(Ordering::SeqCst) {
            return None;
        }
        self.child_session_ids
            .get(&engine)
            .map(|id| id.clone())
            .or_else(|| self.initial_resume.get(&engine).map(|id| id.clone()))
    }

    /// Child session id observed for an engine this session
    pub fn child_session_id(&self, engine: Engine) -> Option<String> {
        self.child_session_ids.get(&engine).map(|id| id.clone())
    }

    // === Continuation slot ===

    pub fn queue_continuation(&self, prompt: String, engine: Engine) {
        let mut slot = self
            .continuation
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(Continuation { prompt, engine });
    }

    pub fn take_continuation(&self) -> Option<Continuation> {
        self.continuation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    // === Auto-continue bookkeeping ===

    pub fn set_auto_continue(&self, enabled: bool) {
        self.auto_continue.store(enabled, Ordering::SeqCst);
    }

    pub fn auto_continue_enabled(&self) -> bool {
        self.auto_continue.load(Ordering::SeqCst)
    }

    /// Check the time budget and stamp the attempt when it passes
    pub fn claim_auto_continue_budget(&self, min_interval: std::time::Duration) -> bool {
        let mut last = self
            .last_auto_continue
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match *last {
            Some(previous) if now.duration_since(previous) < min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    // === Permission rendezvous ===

    /// Start the hook socket listener if it is not running yet
    ///
    /// Returns the socket path the Claude bridge exports to its child.
    pub fn ensure_hook_listener(self: &Arc<Self>) -> Result<PathBuf> {
        let mut slot = self
            .hook_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(ref listener) = *slot {
            return Ok(listener.path().clone());
        }

        let path = hook_socket_path(&self.session_id);
        let session = Arc::clone(self);
        let handler: crate::permissions::hook_socket::HookHandler =
            Arc::new(move |request: HookRequest| {
                let session = Arc::clone(&session);
                Box::pin(async move { session.handle_hook_request(request).await })
            });

        let listener = HookListener::bind(path.clone(), handler)?;
        *slot = Some(listener);
        Ok(path)
    }

    /// Answer one hook permission request
    async fn handle_hook_request(self: Arc<Self>, request: HookRequest) -> HookResponse {
        let (outcome, reason) = self
            .decide_permission(&request.tool_use_id, &request.tool_name, &request.tool_input)
            .await;
        if outcome.is_allowed() {
            HookResponse::allow()
        } else {
            HookResponse::deny(
                reason
                    .or_else(|| outcome.deny_reason().map(str::to_owned))
                    .unwrap_or_else(|| "rejected".to_string()),
            )
        }
    }

    /// Decide a tool permission: auto policy first, then the client
    ///
    /// Returns the outcome plus an optional deny reason from the policy.
    pub async fn decide_permission(
        self: &Arc<Self>,
        correlation_id: &str,
        tool_name: &str,
        tool_input: &Value,
    ) -> (PermissionOutcome, Option<String>) {
        match self.policy.evaluate(self.permission_mode(), tool_name) {
            PolicyDecision::Allow => {
                debug!(
                    session_id = %self.session_id,
                    tool_name = %tool_name,
                    "Tool auto-approved"
                );
                return (PermissionOutcome::Allow, None);
            }
            PolicyDecision::Deny { reason } => {
                debug!(
                    session_id = %self.session_id,
                    tool_name = %tool_name,
                    reason = %reason,
                    "Tool auto-denied"
                );
                return (PermissionOutcome::Deny, Some(reason));
            }
            PolicyDecision::Ask => {}
        }

        if self.is_cancelled() {
            return (PermissionOutcome::Cancelled, None);
        }

        // Reuse the display info recorded when the tool call was announced;
        // the hook can arrive before the announcement, so fall back to
        // deriving it from the request itself.
        let (title, kind) = self
            .emitter
            .tool_record(correlation_id)
            .map(|record| (record.title, record.kind))
            .unwrap_or_else(|| {
                let info = extract_tool_info(tool_name, tool_input);
                (info.title, info.kind)
            });

        let params = RequestPermissionParams {
            session_id: self.session_id.clone(),
            tool_call: PermissionToolCall {
                tool_call_id: correlation_id.to_string(),
                title,
                kind: Some(kind),
                raw_input: Some(tool_input.clone()),
            },
            options: PermissionOption::standard_set(),
        };

        let rx = self.rendezvous.register(correlation_id, tool_name);

        // Forward to the client off the waiting path; the rendezvous entry
        // is resolved exactly once, by whichever of answer / cancel /
        // timeout gets there first.
        let session = Arc::clone(self);
        let forward_id = correlation_id.to_string();
        let forward_tool = tool_name.to_string();
        tokio::spawn(async move {
            let outcome = match session.client.request_permission(params).await {
                Ok(response) => match response.outcome {
                    PermissionOutcomePayload::Selected { option_id } => {
                        match option_id.as_str() {
                            "allow_once" => PermissionOutcome::Allow,
                            "allow_always" => PermissionOutcome::AllowAlways,
                            _ => PermissionOutcome::Deny,
                        }
                    }
                    PermissionOutcomePayload::Cancelled => PermissionOutcome::Cancelled,
                },
                Err(e) => {
                    warn!(
                        session_id = %session.session_id,
                        error = %e,
                        "Permission request to client failed"
                    );
                    PermissionOutcome::Deny
                }
            };

            if outcome == PermissionOutcome::AllowAlways {
                session.policy.remember_always_allow(&forward_tool);
                if let Err(e) = session
                    .settings
                    .add_always_allow(session.engine(), &forward_tool)
                {
                    warn!(error = %e, "Failed to persist always-allow entry");
                }
            }
            session.rendezvous.resolve(&forward_id, outcome);
        });

        (self.rendezvous.wait(correlation_id, rx).await, None)
    }

    // === Teardown ===

    /// Stop the bridge, the hook listener, and everything parked on the session
    pub async fn shutdown(&self) {
        self.cancel();
        if let Some(mut bridge) = self.bridge.lock().await.take() {
            if let Err(e) = bridge.stop().await {
                warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "Error stopping bridge during shutdown"
                );
            }
        }
        self.set_bridge_config(None);
        if let Some(listener) = self
            .hook_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.stop();
        }
        self.finish_turn();
    }
}
