//! Auto-continue controller
//!
//! When a turn stops on `max_turn_requests`, the controller consults an
//! external task oracle (a child process named by configuration) and, if
//! pending tasks remain, queues a continuation prompt in the session's slot,
//! pinned to the engine of the source turn. The dispatcher consumes the
//! slot immediately after the terminal response is sent.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::types::AdapterConfig;

/// Minimum wall-clock distance between two auto-continues of one session
pub const AUTO_CONTINUE_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for one oracle invocation
const ORACLE_TIMEOUT: Duration = Duration::from_secs(10);

/// The fixed instruction queued as the continuation prompt
pub const CONTINUATION_PROMPT: &str =
    "Continue working on the remaining tasks. Pick the next pending task, complete it, and keep going until the list is done.";

/// Controller deciding whether a max-turn stop gets a follow-up prompt
#[derive(Debug, Clone, Default)]
pub struct AutoContinue {
    oracle_command: Option<String>,
    min_interval: Duration,
}

impl AutoContinue {
    /// Controller from the adapter configuration
    pub fn new(config: &AdapterConfig) -> Self {
        Self {
            oracle_command: config.task_oracle.clone(),
            min_interval: AUTO_CONTINUE_INTERVAL,
        }
    }

    /// Controller with an explicit oracle and interval (tests)
    pub fn with_oracle(oracle_command: Option<String>, min_interval: Duration) -> Self {
        Self {
            oracle_command,
            min_interval,
        }
    }

    /// Queue a continuation if the session qualifies and tasks remain
    ///
    /// Returns true when a continuation was queued.
    pub async fn maybe_queue(&self, session: &Arc<Session>) -> bool {
        let Some(ref command) = self.oracle_command else {
            return false;
        };
        if !session.auto_continue_enabled() {
            debug!(session_id = %session.session_id, "Auto-continue disabled for session");
            return false;
        }
        if !session.claim_auto_continue_budget(self.min_interval) {
            debug!(
                session_id = %session.session_id,
                "Auto-continue time budget not elapsed"
            );
            return false;
        }

        match pending_tasks(command, session).await {
            Some(count) if count > 0 => {
                info!(
                    session_id = %session.session_id,
                    pending_tasks = count,
                    "Queueing auto-continue prompt"
                );
                session.queue_continuation(CONTINUATION_PROMPT.to_string(), session.engine());
                true
            }
            Some(_) => {
                debug!(session_id = %session.session_id, "Oracle reports no pending tasks");
                false
            }
            None => false,
        }
    }
}

/// Ask the oracle for pending tasks; `None` means the oracle was unusable
async fn pending_tasks(command: &str, session: &Arc<Session>) -> Option<usize> {
    let output = tokio::time::timeout(
        ORACLE_TIMEOUT,
        tokio::process::Command::new(command)
            .current_dir(&session.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await;

    let output = match output {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(command = %command, error = %e, "Task oracle failed to run");
            return None;
        }
        Err(_) => {
            warn!(command = %command, "Task oracle timed out");
            return None;
        }
    };

    if !output.status.success() {
        warn!(
            command = %command,
            status = %output.status,
            "Task oracle exited with failure"
        );
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    match serde_json::from_str::<Value>(stdout.trim()) {
        Ok(Value::Array(tasks)) => Some(tasks.len()),
        Ok(_) => {
            warn!(command = %command, "Task oracle output is not a JSON array");
            None
        }
        Err(e) => {
            warn!(command = %command, error = %e, "Task oracle output is not JSON");
            None
        }
    }
}
