//! Error types for SDK operations.

use std::time::Duration;
use thiserror::Error;

use quill_rpc::RpcError;

/// Errors surfaced by the client and session surface.
#[derive(Debug, Error)]
pub enum SdkError {
    /// The underlying RPC engine failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Operation attempted on a closed session.
    #[error("session is closed")]
    SessionClosed,

    /// Operation attempted before the client connected.
    #[error("client is not connected")]
    NotConnected,

    /// The assistant CLI process could not be spawned.
    #[error("failed to spawn assistant process: {0}")]
    Spawn(String),

    /// A network connection could not be established.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The client options were invalid or incomplete.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The server sent a structurally valid frame missing required fields.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The server speaks a different protocol revision.
    #[error("protocol version mismatch: expected {expected}, server reported {actual:?}")]
    ProtocolMismatch {
        /// Protocol version this SDK was built against.
        expected: u32,
        /// Version the server reported, if any.
        actual: Option<u32>,
    },

    /// A bounded wait elapsed before the reply arrived.
    ///
    /// The underlying request stays in flight; only the local wait is
    /// abandoned.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Result alias for SDK operations.
pub type SdkResult<T> = Result<T, SdkError>;
