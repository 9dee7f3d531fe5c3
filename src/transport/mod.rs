//! Transports carrying the ACP conversation
//!
//! Both run-modes funnel through [`ClientHandle`]: a clone-cheap handle
//! holding the outbound frame channel (one writer task per transport
//! serializes frames onto the wire) and the correlation table for requests
//! the adapter sends to the client. Sessions and bridges never touch the
//! wire directly.

pub mod lockfile;
pub mod stdio;
pub mod ws;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::acp::{
    self, method, ClientCapabilities, CreateTerminalParams, CreateTerminalResponse,
    ReadTextFileParams, ReadTextFileResponse, RequestPermissionParams, RequestPermissionResponse,
    TerminalIdParams, TerminalOutputResponse, WriteTextFileParams,
};
use crate::protocol::jsonrpc::{self, RpcError};
use crate::protocol::update::{SessionNotification, SessionUpdate};
use crate::types::{AgentError, Result};

/// Deadline for client answers to fs/terminal requests. Permission requests
/// carry their own rendezvous timeout on top of this.
const CLIENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(310);

/// Clone-cheap handle to the client side of the connection
#[derive(Clone)]
pub struct ClientHandle {
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<DashMap<i64, oneshot::Sender<std::result::Result<Value, RpcError>>>>,
    next_id: Arc<AtomicI64>,
    capabilities: Arc<RwLock<ClientCapabilities>>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ClientHandle {
    /// Create a handle plus the receiver its transport writer drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound,
                pending: Arc::new(DashMap::new()),
                next_id: Arc::new(AtomicI64::new(1)),
                capabilities: Arc::new(RwLock::new(ClientCapabilities::default())),
            },
            rx,
        )
    }

    /// Record the capabilities the client advertised in `initialize`
    pub fn set_capabilities(&self, caps: ClientCapabilities) {
        if let Ok(mut slot) = self.capabilities.write() {
            *slot = caps;
        }
    }

    /// Capabilities snapshot
    pub fn capabilities(&self) -> ClientCapabilities {
        self.capabilities
            .read()
            .map(|caps| caps.clone())
            .unwrap_or_default()
    }

    /// Queue one serialized frame for the writer task
    pub fn send_raw(&self, frame: String) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| AgentError::NotificationFailed("transport writer gone".to_string()))
    }

    /// Send a success response for a client request
    pub fn send_response(&self, id: &Value, result: Value) -> Result<()> {
        self.send_raw(jsonrpc::response_ok(id, result))
    }

    /// Send an error response for a client request
    pub fn send_error(&self, id: &Value, error: &RpcError) -> Result<()> {
        self.send_raw(jsonrpc::response_err(id, error))
    }

    /// Send a notification to the client
    pub fn send_notification(&self, method: &str, params: Value) -> Result<()> {
        self.send_raw(jsonrpc::notification(method, params))
    }

    /// Send one `session/update` notification
    pub fn send_update(&self, session_id: &str, update: SessionUpdate) -> Result<()> {
        let notification = SessionNotification::new(session_id, update);
        self.send_notification(method::SESSION_UPDATE, serde_json::to_value(notification)?)
    }

    /// Issue a request to the client and await its response
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if let Err(e) = self.send_raw(jsonrpc::request(id, method, params)) {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(CLIENT_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(rpc_error))) => Err(AgentError::client_request(format!(
                "{method}: {} ({})",
                rpc_error.message, rpc_error.code
            ))),
            Ok(Err(_)) => Err(AgentError::client_request(format!(
                "{method}: connection closed"
            ))),
            Err(_) => {
                self.pending.remove(&id);
                Err(AgentError::client_request(format!("{method}: timed out")))
            }
        }
    }

    /// Route an inbound response frame to the task awaiting it
    pub fn handle_response(&self, id: &Value, result: Option<Value>, error: Option<RpcError>) {
        let Some(id) = id.as_i64() else {
            warn!(id = ?id, "Response with non-numeric id");
            return;
        };
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let payload = match error {
                    Some(err) => Err(err),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(payload);
            }
            None => debug!(id, "Response for unknown request id"),
        }
    }

    /// Fail every in-flight client request (transport closed)
    pub fn fail_all_pending(&self) {
        let ids: Vec<i64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(RpcError::new(
                    crate::types::ErrorCode::InternalError,
                    "connection closed",
                )));
            }
        }
    }

    // === Typed client-direction requests ===

    /// `session/request_permission`
    pub async fn request_permission(
        &self,
        params: RequestPermissionParams,
    ) -> Result<RequestPermissionResponse> {
        let result = self
            .request(
                method::SESSION_REQUEST_PERMISSION,
                serde_json::to_value(params)?,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `fs/read_text_file`; requires the client capability
    pub async fn fs_read_text_file(
        &self,
        params: ReadTextFileParams,
    ) -> Result<ReadTextFileResponse> {
        let result = self
            .request(method::FS_READ_TEXT_FILE, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `fs/write_text_file`; requires the client capability
    pub async fn fs_write_text_file(&self, params: WriteTextFileParams) -> Result<()> {
        self.request(method::FS_WRITE_TEXT_FILE, serde_json::to_value(params)?)
            .await?;
        Ok(())
    }

    /// `terminal/create`; requires the client terminal capability
    pub async fn terminal_create(
        &self,
        params: CreateTerminalParams,
    ) -> Result<CreateTerminalResponse> {
        let result = self
            .request(method::TERMINAL_CREATE, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `terminal/output`
    pub async fn terminal_output(
        &self,
        params: TerminalIdParams,
    ) -> Result<TerminalOutputResponse> {
        let result = self
            .request(method::TERMINAL_OUTPUT, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `terminal/wait_for_exit`
    pub async fn terminal_wait_for_exit(
        &self,
        params: TerminalIdParams,
    ) -> Result<acp::TerminalExitStatus> {
        let result = self
            .request(
                method::TERMINAL_WAIT_FOR_EXIT,
                serde_json::to_value(params)?,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `terminal/kill`
    pub async fn terminal_kill(&self, params: TerminalIdParams) -> Result<()> {
        self.request(method::TERMINAL_KILL, serde_json::to_value(params)?)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_notification_frame_reaches_writer() {
        let (client, mut rx) = ClientHandle::new();
        client
            .send_update(
                "s-1",
                SessionUpdate::AgentMessageChunk {
                    content: crate::protocol::ContentBlock::text("hi"),
                },
            )
            .unwrap();

        let frame = rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["method"], "session/update");
        assert_eq!(value["params"]["sessionId"], "s-1");
        assert_eq!(value["params"]["update"]["sessionUpdate"], "agent_message_chunk");
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (client, mut rx) = ClientHandle::new();

        let requester = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request("fs/read_text_file", serde_json::json!({"path": "/x"}))
                    .await
            })
        };

        let frame = rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        let id = value["id"].clone();
        assert_eq!(value["method"], "fs/read_text_file");

        client.handle_response(&id, Some(serde_json::json!({"content": "body"})), None);
        let result = requester.await.unwrap().unwrap();
        assert_eq!(result["content"], "body");
    }

    #[tokio::test]
    async fn test_error_response_maps_to_client_request_error() {
        let (client, mut rx) = ClientHandle::new();

        let requester = {
            let client = client.clone();
            tokio::spawn(async move { client.request("terminal/create", Value::Null).await })
        };

        let frame = rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        client.handle_response(
            &value["id"],
            None,
            Some(RpcError::new(
                crate::types::ErrorCode::InternalError,
                "no terminal support",
            )),
        );

        let result = requester.await.unwrap();
        assert!(matches!(result, Err(AgentError::ClientRequest(_))));
    }

    #[tokio::test]
    async fn test_fail_all_pending() {
        let (client, mut rx) = ClientHandle::new();
        let requester = {
            let client = client.clone();
            tokio::spawn(async move { client.request("fs/read_text_file", Value::Null).await })
        };
        let _frame = rx.recv().await.unwrap();

        client.fail_all_pending();
        let result = requester.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unknown_response_id_is_ignored() {
        let (client, _rx) = ClientHandle::new();
        // Should not panic or leak.
        client.handle_response(&Value::from(999), Some(Value::Null), None);
        client.handle_response(&Value::String("weird".to_string()), None, None);
    }

    #[test]
    fn test_capabilities_set_and_read() {
        let (client, _rx) = ClientHandle::new();
        assert!(!client.capabilities().fs.read_text_file);

        let caps: ClientCapabilities = serde_json::from_str(
            r#"{"fs":{"readTextFile":true},"terminal":true}"#,
        )
        .unwrap();
        client.set_capabilities(caps);
        assert!(client.capabilities().fs.read_text_file);
        assert!(client.capabilities().terminal);
    }
}
