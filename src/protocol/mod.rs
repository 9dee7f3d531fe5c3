//! ACP wire protocol
//!
//! JSON-RPC 2.0 message classification and framing, the ACP request and
//! response parameter types, and the `session/update` notification variants.
//! One logical message format travels over two physical framings: newline
//! delimited JSON on stdio and text frames on a WebSocket.

pub mod acp;
pub mod jsonrpc;
pub mod update;

pub use acp::{ContentBlock, StopReason, PROTOCOL_VERSION};
pub use jsonrpc::{Inbound, RpcError};
pub use update::{SessionUpdate, ToolCallStatus, ToolKind};
