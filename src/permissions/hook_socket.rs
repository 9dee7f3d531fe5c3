//! Permission hook socket for the Claude bridge
//!
//! The Claude child's hook tool connects to a per-session Unix domain socket
//! when a tool is about to run, sends one JSON object, and waits for a
//! one-line decision. The socket path contains the session id and is handed
//! to the child through the `BANJO_HOOK_SOCKET` environment variable.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Environment variable carrying the socket path to the child's hook tool
pub const HOOK_SOCKET_ENV: &str = "BANJO_HOOK_SOCKET";

/// Socket path for a session: `${tmp}/banjo-${sessionId}.sock`
pub fn hook_socket_path(session_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("banjo-{session_id}.sock"))
}

/// One permission request from the hook tool
#[derive(Debug, Clone, Deserialize)]
pub struct HookRequest {
    pub session_id: String,
    #[serde(default)]
    pub hook_event_name: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    pub tool_use_id: String,
}

/// The decision line written back to the hook tool
#[derive(Debug, Clone, Serialize)]
pub struct HookResponse {
    pub decision: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "updatedInput", skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
}

impl HookResponse {
    pub fn allow() -> Self {
        Self {
            decision: "allow",
            reason: None,
            updated_input: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: "deny",
            reason: Some(reason.into()),
            updated_input: None,
        }
    }
}

/// Async handler invoked once per hook connection
pub type HookHandler = Arc<
    dyn Fn(HookRequest) -> Pin<Box<dyn Future<Output = HookResponse> + Send>> + Send + Sync,
>;

/// Listening side of the hook socket
///
/// Owns the accept task and the socket file; both are torn down on `stop`
/// or drop.
pub struct HookListener {
    path: PathBuf,
    accept_task: JoinHandle<()>,
}

impl std::fmt::Debug for HookListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookListener")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl HookListener {
    /// Bind the socket and start accepting hook connections
    ///
    /// A stale socket file from a crashed run is removed before binding.
    pub fn bind(path: PathBuf, handler: HookHandler) -> std::io::Result<Self> {
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = UnixListener::bind(&path)?;
        debug!(path = %path.display(), "Permission hook socket listening");

        let accept_task = tokio::spawn({
            let path = path.clone();
            async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            let handler = Arc::clone(&handler);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, handler).await {
                                    warn!(error = %e, "Hook connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Hook socket accept failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self { path, accept_task })
    }

    /// Path the listener is bound to
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Stop accepting and unlink the socket file
    pub fn stop(&self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for HookListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serve one hook connection: one request object in, one decision line out
async fn serve_connection(stream: UnixStream, handler: HookHandler) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let request: HookRequest = match serde_json::from_str(line.trim()) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "Malformed hook request");
            let response = HookResponse::deny("malformed request");
            let mut payload = serde_json::to_string(&response)?;
            payload.push('\n');
            write_half.write_all(payload.as_bytes()).await?;
            return Ok(());
        }
    };

    debug!(
        tool_name = %request.tool_name,
        tool_use_id = %request.tool_use_id,
        hook_event = %request.hook_event_name,
        "Hook permission request"
    );

    let response = handler(request).await;
    let mut payload = serde_json::to_string(&response)?;
    payload.push('\n');
    write_half.write_all(payload.as_bytes()).await?;
    write_half.flush().await?;
    Ok(())
}
