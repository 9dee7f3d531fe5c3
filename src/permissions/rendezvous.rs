//! Permission rendezvous: correlating pending requests to their answers
//!
//! Outstanding permission/approval identifiers map to one-shot slots awaited
//! by the asking side (a hook connection or an approval handler task). The
//! answering side (the transport, a timeout, or cancellation) takes the entry
//! atomically; a second answer for the same id is ignored.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// Default deadline for an unanswered permission request
pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Terminal outcome of one permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    /// Allow this invocation only
    Allow,
    /// Allow and remember the tool for the rest of the session
    AllowAlways,
    /// Deny this invocation
    Deny,
    /// The turn was cancelled while the request was pending
    Cancelled,
    /// No answer arrived within the deadline
    TimedOut,
}

impl PermissionOutcome {
    /// Whether the tool may run
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allow | Self::AllowAlways)
    }

    /// Reason string sent back to the asking child when denied
    pub fn deny_reason(self) -> Option<&'static str> {
        match self {
            Self::Allow | Self::AllowAlways => None,
            Self::Deny => Some("rejected"),
            Self::Cancelled => Some("cancelled"),
            Self::TimedOut => Some("timeout"),
        }
    }
}

struct PendingEntry {
    tx: oneshot::Sender<PermissionOutcome>,
    tool_name: String,
}

/// Per-session table of outstanding permission requests
pub struct PermissionRendezvous {
    pending: DashMap<String, PendingEntry>,
    timeout: Duration,
}

impl std::fmt::Debug for PermissionRendezvous {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionRendezvous")
            .field("pending", &self.pending.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PermissionRendezvous {
    /// Table with the default 5 minute deadline
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PERMISSION_TIMEOUT)
    }

    /// Table with an explicit deadline (tests use short ones)
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
        }
    }

    /// Register a pending request under its correlation id
    ///
    /// Ids are unique per session; re-registering an id replaces the stale
    /// entry, resolving it as cancelled.
    pub fn register(
        &self,
        correlation_id: &str,
        tool_name: &str,
    ) -> oneshot::Receiver<PermissionOutcome> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            tx,
            tool_name: tool_name.to_string(),
        };
        if let Some(stale) = self.pending.insert(correlation_id.to_string(), entry) {
            let _ = stale.tx.send(PermissionOutcome::Cancelled);
        }
        rx
    }

    /// Resolve a pending request, consuming its entry
    ///
    /// Returns false when the id is unknown or already resolved; the second
    /// answer for an id is a no-op.
    pub fn resolve(&self, correlation_id: &str, outcome: PermissionOutcome) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, entry)) => {
                debug!(
                    correlation_id = %correlation_id,
                    tool_name = %entry.tool_name,
                    outcome = ?outcome,
                    "Resolving pending permission"
                );
                // The waiter may have timed out and dropped its receiver.
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolve every pending request as cancelled
    pub fn cancel_all(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.resolve(&id, PermissionOutcome::Cancelled);
        }
    }

    /// Await the outcome for a registered request, bounded by the deadline
    ///
    /// On timeout the entry is taken atomically: if an answer raced the
    /// deadline and won, that answer is returned instead of `TimedOut`.
    pub async fn wait(
        &self,
        correlation_id: &str,
        mut rx: oneshot::Receiver<PermissionOutcome>,
    ) -> PermissionOutcome {
        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => PermissionOutcome::Cancelled,
            Err(_) => {
                if self.pending.remove(correlation_id).is_some() {
                    PermissionOutcome::TimedOut
                } else {
                    rx.try_recv().unwrap_or(PermissionOutcome::Cancelled)
                }
            }
        }
    }

    /// Number of outstanding requests
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for PermissionRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let table = PermissionRendezvous::new();
        let rx = table.register("perm-1", "Bash");
        assert_eq!(table.pending_count(), 1);

        assert!(table.resolve("perm-1", PermissionOutcome::Allow));
        assert_eq!(table.wait("perm-1", rx).await, PermissionOutcome::Allow);
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_resolve_is_ignored() {
        let table = PermissionRendezvous::new();
        let rx = table.register("perm-1", "Bash");

        assert!(table.resolve("perm-1", PermissionOutcome::Deny));
        assert!(!table.resolve("perm-1", PermissionOutcome::Allow));
        assert_eq!(table.wait("perm-1", rx).await, PermissionOutcome::Deny);
    }

    #[tokio::test]
    async fn test_unknown_id_resolve_is_noop() {
        let table = PermissionRendezvous::new();
        assert!(!table.resolve("nope", PermissionOutcome::Allow));
    }

    #[tokio::test]
    async fn test_timeout_resolves_as_timed_out() {
        let table = PermissionRendezvous::with_timeout(Duration::from_millis(10));
        let rx = table.register("perm-1", "Bash");
        let outcome = table.wait("perm-1", rx).await;
        assert_eq!(outcome, PermissionOutcome::TimedOut);
        assert_eq!(table.pending_count(), 0);
        // The timed out entry is gone; a late answer is ignored.
        assert!(!table.resolve("perm-1", PermissionOutcome::Allow));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let table = PermissionRendezvous::new();
        let rx1 = table.register("perm-1", "Bash");
        let rx2 = table.register("perm-2", "Edit");

        table.cancel_all();
        assert_eq!(table.wait("perm-1", rx1).await, PermissionOutcome::Cancelled);
        assert_eq!(table.wait("perm-2", rx2).await, PermissionOutcome::Cancelled);
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reregister_cancels_stale_entry() {
        let table = PermissionRendezvous::new();
        let rx_old = table.register("perm-1", "Bash");
        let rx_new = table.register("perm-1", "Bash");

        assert_eq!(
            table.wait("perm-1", rx_old).await,
            PermissionOutcome::Cancelled
        );
        table.resolve("perm-1", PermissionOutcome::Allow);
        assert_eq!(table.wait("perm-1", rx_new).await, PermissionOutcome::Allow);
    }

    #[test]
    fn test_deny_reasons() {
        assert_eq!(PermissionOutcome::Deny.deny_reason(), Some("rejected"));
        assert_eq!(PermissionOutcome::Cancelled.deny_reason(), Some("cancelled"));
        assert_eq!(PermissionOutcome::TimedOut.deny_reason(), Some("timeout"));
        assert_eq!(PermissionOutcome::Allow.deny_reason(), None);
    }
}
