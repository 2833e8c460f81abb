//! Custom tools and the permission round-trip.
//!
//! The server calls back into the client to execute registered tools. When a
//! permission handler is configured the decision is awaited first; denial
//! short-circuits the tool handler entirely and is reported to the server as
//! a result, never as a call failure. Tool handler failures are reported
//! with an opaque indicator — the handler's own error text stays on this
//! side of the wire.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{SdkError, SdkResult};

/// Text sent to the server when a tool handler fails.
///
/// Deliberately carries no detail from the handler's own error.
pub const OPAQUE_TOOL_FAILURE: &str =
    "Invoking this tool produced an error. Detailed information is not available.";

/// Failure raised by a tool handler.
///
/// Only the local error hooks and logs ever see this message; the wire reply
/// uses [`OPAQUE_TOOL_FAILURE`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ToolError(pub String);

impl ToolError {
    /// Build a tool error from any displayable message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A tool invocation request from the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    /// Session the tool was invoked in.
    pub session_id: String,
    /// Correlation id for this tool call.
    pub tool_call_id: String,
    /// Name of the tool being invoked.
    pub tool_name: String,
    /// Raw argument payload, matching the tool's parameter schema.
    #[serde(default)]
    pub arguments: Value,
}

impl ToolInvocation {
    /// Deserialize the arguments into a typed shape.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Protocol`] if the arguments do not match `T`.
    pub fn arguments_as<T: serde::de::DeserializeOwned>(&self) -> SdkResult<T> {
        serde_json::from_value(self.arguments.clone())
            .map_err(|error| SdkError::Protocol(format!("tool arguments did not decode: {error}")))
    }
}

/// Executes a registered tool on behalf of the assistant.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool. The returned value is serialized as the call's result.
    async fn invoke(&self, invocation: ToolInvocation) -> Result<Value, ToolError>;
}

struct FnToolHandler<F>(F);

#[async_trait]
impl<F> ToolHandler for FnToolHandler<F>
where
    F: Fn(ToolInvocation) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync,
{
    async fn invoke(&self, invocation: ToolInvocation) -> Result<Value, ToolError> {
        (self.0)(invocation).await
    }
}

/// A tool the client offers to the assistant.
#[derive(Clone)]
pub struct ToolDefinition {
    name: String,
    description: String,
    parameters: Value,
    handler: Arc<dyn ToolHandler>,
}

impl ToolDefinition {
    /// Define a tool backed by an async closure.
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolInvocation) -> BoxFuture<'static, Result<Value, ToolError>>
            + Send
            + Sync
            + 'static,
    {
        Self::with_handler(name, description, parameters, Arc::new(FnToolHandler(handler)))
    }

    /// Define a tool backed by a [`ToolHandler`] implementation.
    pub fn with_handler(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler,
        }
    }

    /// Tool name, unique within a session.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description shown to the model.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// JSON Schema of the tool's parameters.
    #[must_use]
    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    pub(crate) fn handler(&self) -> Arc<dyn ToolHandler> {
        Arc::clone(&self.handler)
    }

    /// Wire descriptor announced to the server at session creation.
    #[must_use]
    pub fn descriptor(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// A permission request, either synthesized for a custom tool call or
/// decoded from a server-initiated `permission.request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Request category, e.g. `custom-tool` or `shell`.
    #[serde(default)]
    pub kind: String,
    /// Correlation id of the tool call, when tool-related.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Name of the tool, when tool-related.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Remaining request fields, passed through untyped.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PermissionRequest {
    /// Synthesize the request presented for a custom tool invocation.
    #[must_use]
    pub fn custom_tool(invocation: &ToolInvocation) -> Self {
        Self {
            kind: "custom-tool".to_string(),
            tool_call_id: Some(invocation.tool_call_id.clone()),
            tool_name: Some(invocation.tool_name.clone()),
            extra: serde_json::Map::new(),
        }
    }
}

/// Outcome of a permission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionOutcome {
    /// The tool may run.
    Approved,
    /// The tool must not run. `kind` is reported back to the server.
    Denied {
        /// Denial category, e.g. `denied-interactively-by-user`.
        kind: String,
    },
}

impl PermissionOutcome {
    /// Denial recorded as an interactive user decision.
    #[must_use]
    pub fn denied_by_user() -> Self {
        Self::Denied {
            kind: "denied-interactively-by-user".to_string(),
        }
    }

    /// Denial used when no handler is configured to decide.
    #[must_use]
    pub fn denied_no_handler() -> Self {
        Self::Denied {
            kind: "denied-no-permission-handler".to_string(),
        }
    }

    /// The wire `kind` string for this outcome.
    #[must_use]
    pub fn reply_kind(&self) -> &str {
        match self {
            Self::Approved => "approved",
            Self::Denied { kind } => kind,
        }
    }

    /// Whether the tool may run.
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// Decides whether a requested capability may run.
///
/// The decision may itself be asynchronous — escalating to a human and
/// resolving later is the expected shape for interactive frontends.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    /// Decide on one request. `invocation` is present for custom tool calls
    /// and absent for server-driven permission requests.
    async fn decide(
        &self,
        request: PermissionRequest,
        invocation: Option<ToolInvocation>,
    ) -> PermissionOutcome;
}

/// Permission handler that approves everything. Test and trusted-harness
/// use only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproveAll;

#[async_trait]
impl PermissionHandler for ApproveAll {
    async fn decide(
        &self,
        _request: PermissionRequest,
        _invocation: Option<ToolInvocation>,
    ) -> PermissionOutcome {
        PermissionOutcome::Approved
    }
}

/// Wrap an async closure as a [`PermissionHandler`].
pub fn permission_handler<F>(f: F) -> Arc<dyn PermissionHandler>
where
    F: Fn(PermissionRequest, Option<ToolInvocation>) -> BoxFuture<'static, PermissionOutcome>
        + Send
        + Sync
        + 'static,
{
    struct FnPermissionHandler<F>(F);

    #[async_trait]
    impl<F> PermissionHandler for FnPermissionHandler<F>
    where
        F: Fn(PermissionRequest, Option<ToolInvocation>) -> BoxFuture<'static, PermissionOutcome>
            + Send
            + Sync,
    {
        async fn decide(
            &self,
            request: PermissionRequest,
            invocation: Option<ToolInvocation>,
        ) -> PermissionOutcome {
            (self.0)(request, invocation).await
        }
    }

    Arc::new(FnPermissionHandler(f))
}

/// Disposition of a tool result reported to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultType {
    /// The tool ran and produced a result.
    Success,
    /// The tool failed or was unsupported.
    Failure,
    /// Permission to run the tool was denied.
    Denied,
}

/// Result envelope for a `tool.call` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultObject {
    /// Text surfaced to the model.
    pub text_result_for_llm: String,
    /// Disposition of the call.
    pub result_type: ToolResultType,
    /// Machine-readable failure indicator. Never carries handler detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResultObject {
    /// Wrap a handler's return value as a success result.
    #[must_use]
    pub fn success(value: &Value) -> Self {
        let text = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Self {
            text_result_for_llm: text,
            result_type: ToolResultType::Success,
            error: None,
        }
    }

    /// The opaque failure reported when a handler errors.
    #[must_use]
    pub fn opaque_failure() -> Self {
        Self {
            text_result_for_llm: OPAQUE_TOOL_FAILURE.to_string(),
            result_type: ToolResultType::Failure,
            error: Some("tool execution failed".to_string()),
        }
    }

    /// Failure reported for a tool this client never registered.
    #[must_use]
    pub fn unsupported(tool_name: &str) -> Self {
        Self {
            text_result_for_llm: format!(
                "Tool '{tool_name}' is not supported by this client instance."
            ),
            result_type: ToolResultType::Failure,
            error: Some(format!("tool '{tool_name}' not supported")),
        }
    }

    /// Denial result. Not a call failure; the tool handler never ran.
    #[must_use]
    pub fn denied(kind: &str) -> Self {
        Self {
            text_result_for_llm: "Permission to invoke this tool was denied.".to_string(),
            result_type: ToolResultType::Denied,
            error: Some(kind.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    fn invocation() -> ToolInvocation {
        ToolInvocation {
            session_id: "s-1".to_string(),
            tool_call_id: "tc-1".to_string(),
            tool_name: "encrypt_string".to_string(),
            arguments: json!({"input": "Hello"}),
        }
    }

    #[test]
    fn test_arguments_as_typed_shape() {
        #[derive(Deserialize)]
        struct Args {
            input: String,
        }
        let args: Args = invocation().arguments_as().unwrap();
        assert_eq!(args.input, "Hello");
    }

    #[test]
    fn test_arguments_as_mismatch_is_protocol_error() {
        let result: SdkResult<i64> = invocation().arguments_as();
        assert!(matches!(result, Err(SdkError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_closure_tool_handler_runs() {
        let tool = ToolDefinition::new(
            "encrypt_string",
            "Encrypts a string",
            json!({"type": "object"}),
            |invocation| {
                async move {
                    let input = invocation
                        .arguments
                        .get("input")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    Ok(Value::String(input.to_uppercase()))
                }
                .boxed()
            },
        );

        let result = tool.handler().invoke(invocation()).await.unwrap();
        assert_eq!(result, Value::String("HELLO".to_string()));
    }

    #[tokio::test]
    async fn test_approve_all_approves() {
        let outcome = ApproveAll
            .decide(PermissionRequest::custom_tool(&invocation()), None)
            .await;
        assert!(outcome.is_approved());
        assert_eq!(outcome.reply_kind(), "approved");
    }

    #[test]
    fn test_custom_tool_request_carries_invocation_context() {
        let request = PermissionRequest::custom_tool(&invocation());
        assert_eq!(request.kind, "custom-tool");
        assert_eq!(request.tool_name.as_deref(), Some("encrypt_string"));
        assert_eq!(request.tool_call_id.as_deref(), Some("tc-1"));
    }

    #[test]
    fn test_opaque_failure_carries_no_detail() {
        let result = ToolResultObject::opaque_failure();
        assert_eq!(result.text_result_for_llm, OPAQUE_TOOL_FAILURE);
        assert_eq!(result.result_type, ToolResultType::Failure);
    }

    #[test]
    fn test_result_object_serializes_camel_case() {
        let encoded = serde_json::to_value(ToolResultObject::success(&json!("ok"))).unwrap();
        assert_eq!(encoded["textResultForLlm"], "ok");
        assert_eq!(encoded["resultType"], "success");
    }

    #[test]
    fn test_denied_is_not_a_failure_type() {
        let result = ToolResultObject::denied("denied-interactively-by-user");
        assert_eq!(result.result_type, ToolResultType::Denied);
    }
}
