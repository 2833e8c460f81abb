//! Error types for the RPC engine.

use thiserror::Error;

use crate::protocol::ErrorObject;

/// Errors surfaced by the RPC engine.
///
/// The variants map onto the failure classes callers need to tell apart:
/// transport loss fails every outstanding call, a server `error` member is an
/// [`RpcError::Rpc`], and a result that does not fit the requested shape is an
/// [`RpcError::Decode`] so "server rejected the call" and "client misread the
/// reply" stay distinguishable.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Transport failure or stream closed. Fatal for the connection.
    #[error("connection I/O error: {0}")]
    Io(String),

    /// Operation attempted on an engine that has already been closed.
    #[error("rpc client is closed")]
    Closed,

    /// The server answered the call with an error object.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// Error code reported by the server.
        code: i64,
        /// Error message reported by the server.
        message: String,
        /// Optional structured detail.
        data: Option<serde_json::Value>,
    },

    /// The result payload did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The request parameters could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl RpcError {
    /// Whether this error means the connection itself is gone.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Closed)
    }

    /// The server-reported error code, if this is an RPC-level failure.
    #[must_use]
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<ErrorObject> for RpcError {
    fn from(error: ErrorObject) -> Self {
        Self::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

/// Result alias for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Failure raised by a registered method handler.
///
/// For server-initiated requests the message is reflected back to the peer in
/// a `-32603` reply; for notifications it is only logged.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Build a handler error from any displayable message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(RpcError::Io("broken pipe".to_string()).is_transport());
        assert!(RpcError::Closed.is_transport());
        assert!(
            !RpcError::Rpc {
                code: -32601,
                message: "Method not found".to_string(),
                data: None,
            }
            .is_transport()
        );
        assert!(!RpcError::Decode("bad shape".to_string()).is_transport());
    }

    #[test]
    fn test_error_object_conversion() {
        let error = RpcError::from(ErrorObject::new(-32600, "invalid"));
        assert_eq!(error.code(), Some(-32600));
        assert_eq!(error.to_string(), "rpc error -32600: invalid");
    }
}
