//! WebSocket transport (daemon run mode)
//!
//! Accepts connections on `ws://127.0.0.1:<port>/acp` (the `/editor` path is
//! reserved for the editor-bridge role) and carries the same JSON-RPC
//! payloads as the stdio transport, one message per text frame. Frame
//! discipline: text only, 16 MiB cap, ping answered with pong echoing the
//! payload, close tears down every session bound to the connection. Client
//! masking, fragmentation and reserved opcodes are enforced at parse time
//! by the WebSocket layer; violations fail the connection.

use std::path::PathBuf;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{accept_hdr_async_with_config, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::agent::{route_line, AcpAgent};
use crate::types::AdapterConfig;

use super::lockfile::DaemonLockfile;
use super::ClientHandle;

/// Path serving the ACP role
pub const ACP_PATH: &str = "/acp";
/// Path reserved for the editor-bridge role
pub const EDITOR_BRIDGE_PATH: &str = "/editor";

/// Maximum single-message payload
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Deadline for the HTTP upgrade handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve the WebSocket daemon until a shutdown signal arrives
pub async fn run_daemon(config: AdapterConfig, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let local_port = listener.local_addr()?.port();
    info!(port = local_port, "Daemon listening");

    let lockfile = DaemonLockfile::write(
        local_port,
        &[std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))],
    )?;

    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            () = &mut shutdown => {
                info!("Shutdown signal received, stopping daemon");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "New connection");
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, config).await {
                        warn!(peer = %peer, error = %e, "Connection error");
                    }
                });
            }
        }
    }

    lockfile.remove();
    Ok(())
}

/// Resolves when SIGTERM (Unix) or Ctrl-C arrives
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Validate the upgrade request path
fn check_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    let path = request.uri().path();
    if path == ACP_PATH || path == EDITOR_BRIDGE_PATH {
        Ok(response)
    } else {
        debug!(path = %path, "Rejecting handshake on unknown path");
        let mut rejection = ErrorResponse::new(Some("unknown path".to_string()));
        *rejection.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
        Err(rejection)
    }
}

/// Serve one connection: its own adapter instance and session registry
///
/// Sessions created over a connection are exclusively bound to it; when the
/// connection closes they are shut down.
async fn handle_connection(stream: TcpStream, config: AdapterConfig) -> anyhow::Result<()> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_PAYLOAD),
        max_frame_size: Some(MAX_PAYLOAD),
        ..Default::default()
    };

    let ws = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        accept_hdr_async_with_config(stream, check_path, Some(ws_config)),
    )
    .await
    .map_err(|_| anyhow::anyhow!("handshake timed out"))??;

    let (mut sink, mut stream) = ws.split();
    let (client, mut outbound) = ClientHandle::new();
    let agent = AcpAgent::new(config, client.clone());

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        route_line(&agent, &text).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        // Text frames only on this endpoint.
                        warn!("Binary frame on ACP connection, closing");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            warn!(error = %e, "WebSocket send failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // The connection owns its sessions; tear them down with it.
    agent.sessions().shutdown_all().await;
    client.fail_all_pending();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tokio_tungstenite::connect_async;

    /// Bind an ephemeral daemon socket and return its port
    async fn spawn_test_daemon() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(stream, AdapterConfig::default()));
            }
        });
        port
    }

    #[tokio::test]
    async fn test_acp_path_accepts_and_answers() {
        let port = spawn_test_daemon().await;
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/acp"))
            .await
            .unwrap();

        ws.send(Message::Text(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":1}}"#
                .to_string(),
        ))
        .await
        .unwrap();

        let frame = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = frame else {
            panic!("expected text frame, got {frame:?}");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["id"], 1);
        assert_eq!(value["result"]["protocolVersion"], 1);

        ws.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_path_rejected() {
        let port = spawn_test_daemon().await;
        let result = connect_async(format!("ws://127.0.0.1:{port}/other")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_session_new_over_websocket() {
        let port = spawn_test_daemon().await;
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/acp"))
            .await
            .unwrap();

        ws.send(Message::Text(
            r#"{"jsonrpc":"2.0","id":2,"method":"session/new","params":{"cwd":"/tmp"}}"#
                .to_string(),
        ))
        .await
        .unwrap();

        let frame = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = frame else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value["result"]["sessionId"].is_string());

        ws.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let port = spawn_test_daemon().await;
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/acp"))
            .await
            .unwrap();

        ws.send(Message::Ping(b"beat".to_vec())).await.unwrap();
        let frame = ws.next().await.unwrap().unwrap();
        assert_eq!(frame, Message::Pong(b"beat".to_vec()));

        ws.close(None).await.unwrap();
    }
}
