//! Core adapter structure
//!
//! The AcpAgent holds shared state for handling ACP protocol requests on one
//! transport connection: configuration, the session registry, the persisted
//! settings, the auto-continue controller, and the client handle.

use std::sync::Arc;

use crate::autocontinue::AutoContinue;
use crate::session::SessionManager;
use crate::settings::SettingsManager;
use crate::transport::ClientHandle;
use crate::types::AdapterConfig;

/// The ACP adapter
///
/// One instance serves one client connection; it is shared across all
/// request handler tasks of that connection.
#[derive(Debug)]
pub struct AcpAgent {
    /// Adapter configuration from environment
    config: AdapterConfig,
    /// Session registry for this connection
    sessions: Arc<SessionManager>,
    /// Persisted settings (always-allow, last-session resume)
    settings: Arc<SettingsManager>,
    /// Max-turn continuation controller
    auto_continue: AutoContinue,
    /// Handle to the client side of the connection
    client: ClientHandle,
}

impl AcpAgent {
    /// Create an adapter over a client handle
    pub fn new(config: AdapterConfig, client: ClientHandle) -> Arc<Self> {
        let auto_continue = AutoContinue::new(&config);
        Arc::new(Self {
            config,
            sessions: Arc::new(SessionManager::new()),
            settings: Arc::new(SettingsManager::new()),
            auto_continue,
            client,
        })
    }

    /// Create with an explicit settings manager (tests)
    pub fn with_settings(
        config: AdapterConfig,
        client: ClientHandle,
        settings: Arc<SettingsManager>,
    ) -> Arc<Self> {
        let auto_continue = AutoContinue::new(&config);
        Arc::new(Self {
            config,
            sessions: Arc::new(SessionManager::new()),
            settings,
            auto_continue,
            client,
        })
    }

    /// Get the adapter configuration
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Get the session manager
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Get the settings manager
    pub fn settings(&self) -> &Arc<SettingsManager> {
        &self.settings
    }

    /// Get the auto-continue controller
    pub fn auto_continue(&self) -> &AutoContinue {
        &self.auto_continue
    }

    /// Get the client handle
    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    /// Agent name for logging
    pub fn name(&self) -> &'static str {
        "banjo"
    }

    /// Agent version
    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_new() {
        let (client, _rx) = ClientHandle::new();
        let agent = AcpAgent::new(AdapterConfig::default(), client);
        assert_eq!(agent.name(), "banjo");
        assert_eq!(agent.sessions().session_count(), 0);
    }

    #[test]
    fn test_agent_with_config() {
        let (client, _rx) = ClientHandle::new();
        let config = AdapterConfig {
            task_oracle: Some("task-ls".to_string()),
            ..Default::default()
        };
        let agent = AcpAgent::new(config, client);
        assert!(agent.config().auto_continue_available());
    }
}
