//! Error types for the banjo ACP adapter

use thiserror::Error;

/// ACP protocol error codes
///
/// Standard JSON-RPC error codes plus the ACP-specific codes the adapter
/// emits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Standard JSON-RPC errors (-32xxx)
    /// Parse error: invalid JSON
    ParseError = -32700,
    /// Invalid request: not a valid request object
    InvalidRequest = -32600,
    /// Method not found
    MethodNotFound = -32601,
    /// Invalid params
    InvalidParams = -32602,
    /// Internal error
    InternalError = -32603,

    // ACP-specific errors
    /// Authentication required
    AuthRequired = -32000,
    /// Unsupported protocol version
    UnsupportedVersion = -32001,
}

impl ErrorCode {
    /// Get the error code value
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Main error type for the adapter
#[derive(Debug, Error)]
pub enum AgentError {
    // === Session errors ===
    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session already exists
    #[error("Session already exists: {0}")]
    SessionAlreadyExists(String),

    /// A prompt is already in flight for the session
    #[error("Session is busy: {0}")]
    SessionBusy(String),

    // === Protocol errors ===
    /// Unknown method
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Invalid params
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Unsupported protocol version
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u64),

    // === Engine/bridge errors ===
    /// Engine selection was rejected
    #[error("Invalid engine: {0}")]
    InvalidEngine(String),

    /// Model is not in the engine's model set
    #[error("Invalid model for engine: {0}")]
    InvalidModel(String),

    /// Invalid permission mode
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    /// The engine child process could not be started
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The engine child process died mid-turn
    #[error("Bridge failed: {0}")]
    BridgeFailed(String),

    // === Prompt errors ===
    /// Empty prompt
    #[error("Prompt cannot be empty")]
    EmptyPrompt,

    // === Authentication errors ===
    /// Authentication required
    #[error("Authentication required")]
    AuthRequired,

    // === Client-direction errors ===
    /// The client rejected or failed one of our requests
    #[error("Client request failed: {0}")]
    ClientRequest(String),

    /// The transport writer is gone
    #[error("Failed to send notification: {0}")]
    NotificationFailed(String),

    // === External errors ===
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic errors ===
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type for the adapter
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Get the JSON-RPC error code for this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AgentError::SessionNotFound(_)
            | AgentError::SessionAlreadyExists(_)
            | AgentError::SessionBusy(_) => ErrorCode::InvalidRequest,
            AgentError::MethodNotFound(_) => ErrorCode::MethodNotFound,
            AgentError::InvalidParams(_)
            | AgentError::InvalidEngine(_)
            | AgentError::InvalidModel(_)
            | AgentError::InvalidMode(_)
            | AgentError::EmptyPrompt => ErrorCode::InvalidParams,
            AgentError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            AgentError::AuthRequired => ErrorCode::AuthRequired,
            AgentError::Json(_) => ErrorCode::ParseError,
            AgentError::EngineUnavailable(_)
            | AgentError::BridgeFailed(_)
            | AgentError::ClientRequest(_)
            | AgentError::NotificationFailed(_)
            | AgentError::Io(_)
            | AgentError::Internal(_)
            | AgentError::Cancelled => ErrorCode::InternalError,
        }
    }

    /// Check if this error is a client error (caused by invalid input)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.error_code(),
            ErrorCode::InvalidRequest
                | ErrorCode::MethodNotFound
                | ErrorCode::InvalidParams
                | ErrorCode::UnsupportedVersion
        )
    }

    // === Constructor helpers ===

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        AgentError::Internal(msg.into())
    }

    /// Create a session not found error
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        AgentError::SessionNotFound(session_id.into())
    }

    /// Create a session busy error
    pub fn session_busy(session_id: impl Into<String>) -> Self {
        AgentError::SessionBusy(session_id.into())
    }

    /// Create an invalid params error
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        AgentError::InvalidParams(msg.into())
    }

    /// Create an engine unavailable error
    pub fn engine_unavailable(msg: impl Into<String>) -> Self {
        AgentError::EngineUnavailable(msg.into())
    }

    /// Create a bridge failed error
    pub fn bridge_failed(msg: impl Into<String>) -> Self {
        AgentError::BridgeFailed(msg.into())
    }

    /// Create a client request error
    pub fn client_request(msg: impl Into<String>) -> Self {
        AgentError::ClientRequest(msg.into())
    }
}
