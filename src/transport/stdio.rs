//! Stdio transport (agent run mode)
//!
//! Line-delimited JSON-RPC on standard input/output: one reader loop over
//! stdin, one writer task owning stdout. The writer drains the outbound
//! channel, which serializes every frame the handlers and sessions emit.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::agent::{route_line, AcpAgent};
use crate::types::AdapterConfig;

use super::ClientHandle;

/// Serve ACP over stdio until stdin closes
pub async fn run(config: AdapterConfig) -> anyhow::Result<()> {
    let (client, mut outbound) = ClientHandle::new();
    let agent = AcpAgent::new(config, client.clone());

    // Writer task: sole owner of stdout.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = outbound.recv().await {
            let mut line = frame.into_bytes();
            line.push(b'\n');
            if let Err(e) = stdout.write_all(&line).await {
                warn!(error = %e, "stdout write failed");
                break;
            }
            if let Err(e) = stdout.flush().await {
                warn!(error = %e, "stdout flush failed");
                break;
            }
        }
    });

    info!("Serving ACP on stdio");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                route_line(&agent, trimmed).await;
            }
            Ok(None) => {
                debug!("stdin closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        }
    }

    // Client is gone: stop bridges, unlink sockets, fail parked requests.
    agent.sessions().shutdown_all().await;
    client.fail_all_pending();
    writer.abort();
    Ok(())
}
