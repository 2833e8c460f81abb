//! JSON-RPC 2.0 envelope types and reserved error codes.
//!
//! These types describe the wire shape only. Correlation and dispatch live
//! in [`crate::client`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Protocol version carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Reserved code: the server received malformed JSON.
pub const PARSE_ERROR: i64 = -32700;
/// Reserved code: the request object was not a valid call.
pub const INVALID_REQUEST: i64 = -32600;
/// Reserved code: the method does not exist on the receiving peer.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Reserved code: the method parameters were invalid.
pub const INVALID_PARAMS: i64 = -32602;
/// Reserved code: the handler failed while producing a result.
pub const INTERNAL_ERROR: i64 = -32603;

/// Code substituted when the server omits one from an error object.
pub const UNKNOWN_ERROR_CODE: i64 = -1;
/// Message substituted when the server omits one from an error object.
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

/// Correlation id pairing a request with its eventual response.
///
/// Outgoing ids are always integers; inbound frames may echo either form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id, what this client allocates.
    Number(i64),
    /// String id, tolerated on inbound frames.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

/// Outbound request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Correlation id.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl OutgoingRequest {
    /// Build a request for the given id, method, and parameters.
    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// Outbound notification envelope. Carries no id and expects no reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingNotification {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl OutgoingNotification {
    /// Build a notification for the given method and parameters.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// Outbound response envelope for a server-initiated call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the call being answered.
    pub id: RequestId,
    /// Success payload. Mutually exclusive with `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload. Mutually exclusive with `result`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl OutgoingResponse {
    /// Build a success response.
    #[must_use]
    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    #[must_use]
    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Error member of a response.
///
/// Decoding applies the lenient defaults the original protocol expects: a
/// missing `code` becomes [`UNKNOWN_ERROR_CODE`] and a missing `message`
/// becomes [`UNKNOWN_ERROR_MESSAGE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code.
    #[serde(default = "default_error_code")]
    pub code: i64,
    /// Human-readable message.
    #[serde(default = "default_error_message")]
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn default_error_code() -> i64 {
    UNKNOWN_ERROR_CODE
}

fn default_error_message() -> String {
    UNKNOWN_ERROR_MESSAGE.to_string()
}

impl ErrorObject {
    /// Build an error object with the given code and message.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Standard reply for a call naming an unregistered method.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// Standard reply for a handler that failed while producing a result.
    #[must_use]
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// A decoded inbound frame, prior to classification.
///
/// Classification order (see [`crate::client`]): response, then
/// server-initiated call, then discard.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    /// Call id. Absent or explicitly `null` marks a notification.
    #[serde(default)]
    pub id: Option<RequestId>,
    /// Method name of a server-initiated call.
    #[serde(default)]
    pub method: Option<String>,
    /// Call parameters.
    #[serde(default)]
    pub params: Option<Value>,
    /// Success member of a response.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error member of a response.
    #[serde(default)]
    pub error: Option<ErrorObject>,
}

impl IncomingMessage {
    /// Whether this frame answers an outstanding request.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let request = OutgoingRequest::new(7, "session.send", json!({"prompt": "hi"}));
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["jsonrpc"], "2.0");
        assert_eq!(encoded["id"], 7);
        assert_eq!(encoded["method"], "session.send");
        assert_eq!(encoded["params"]["prompt"], "hi");

        let decoded: OutgoingRequest = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.id, RequestId::Number(7));
        assert_eq!(decoded.method, "session.send");
        assert_eq!(decoded.params, Some(json!({"prompt": "hi"})));
    }

    #[test]
    fn test_notification_has_no_id_field() {
        let notification = OutgoingNotification::new("session.abort", json!({}));
        let encoded = serde_json::to_value(&notification).unwrap();
        assert!(encoded.get("id").is_none());
        assert_eq!(encoded["method"], "session.abort");
    }

    #[test]
    fn test_response_round_trip() {
        let response = OutgoingResponse::result(RequestId::Number(3), json!({"ok": true}));
        let encoded = serde_json::to_string(&response).unwrap();
        let decoded: OutgoingResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, RequestId::Number(3));
        assert_eq!(decoded.result, Some(json!({"ok": true})));
        assert!(decoded.error.is_none());
    }

    #[test]
    fn test_error_round_trip() {
        let error = ErrorObject {
            code: 1001,
            message: "rate limited".to_string(),
            data: Some(json!({"retryAfter": 30})),
        };
        let encoded = serde_json::to_string(&error).unwrap();
        let decoded: ErrorObject = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.code, 1001);
        assert_eq!(decoded.message, "rate limited");
        assert_eq!(decoded.data, Some(json!({"retryAfter": 30})));
    }

    #[test]
    fn test_error_without_message_defaults() {
        let decoded: ErrorObject = serde_json::from_str(r#"{"code":-32600}"#).unwrap();
        assert_eq!(decoded.code, INVALID_REQUEST);
        assert_eq!(decoded.message, "Unknown error");
    }

    #[test]
    fn test_error_without_code_defaults() {
        let decoded: ErrorObject = serde_json::from_str(r#"{"message":"bad request"}"#).unwrap();
        assert_eq!(decoded.code, -1);
        assert_eq!(decoded.message, "bad request");
    }

    #[test]
    fn test_null_id_decodes_as_none() {
        let decoded: IncomingMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":null,"method":"m","params":{}}"#)
                .unwrap();
        assert!(decoded.id.is_none());
        assert_eq!(decoded.method.as_deref(), Some("m"));
    }

    #[test]
    fn test_string_id_accepted_on_inbound() {
        let decoded: IncomingMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#).unwrap();
        assert_eq!(decoded.id, Some(RequestId::String("abc".to_string())));
        assert!(decoded.is_response());
    }
}
