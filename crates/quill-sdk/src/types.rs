//! Request and response data types for the assistant protocol.
//!
//! All wire fields are camelCase; unknown fields are tolerated everywhere so
//! newer servers never break older clients.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{PermissionHandler, ToolDefinition};

/// Protocol revision this SDK speaks, verified against the server at start.
pub const PROTOCOL_VERSION: u32 = 1;

/// Configuration for a new session.
#[derive(Clone, Default)]
pub struct SessionConfig {
    /// Model to use, or the server default when `None`.
    pub model: Option<String>,
    /// Custom tools offered to the assistant.
    pub tools: Vec<ToolDefinition>,
    /// Decision function for tool permission requests.
    pub permission_handler: Option<Arc<dyn PermissionHandler>>,
}

impl SessionConfig {
    /// Select a model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Offer custom tools to the assistant.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Install the permission decision function.
    #[must_use]
    pub fn with_permission_handler(mut self, handler: Arc<dyn PermissionHandler>) -> Self {
        self.permission_handler = Some(handler);
        self
    }
}

/// Configuration for resuming an existing session.
#[derive(Clone, Default)]
pub struct ResumeSessionConfig {
    /// Id of the session to resume.
    pub session_id: String,
    /// Custom tools offered to the assistant.
    pub tools: Vec<ToolDefinition>,
    /// Decision function for tool permission requests.
    pub permission_handler: Option<Arc<dyn PermissionHandler>>,
}

impl ResumeSessionConfig {
    /// Resume the session with the given id.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("model", &self.model)
            .field("tools", &self.tools)
            .field("permission_handler", &self.permission_handler.is_some())
            .finish()
    }
}

impl std::fmt::Debug for ResumeSessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeSessionConfig")
            .field("session_id", &self.session_id)
            .field("tools", &self.tools)
            .field("permission_handler", &self.permission_handler.is_some())
            .finish()
    }
}

/// Options for one outgoing user message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageOptions {
    /// The prompt text.
    pub prompt: String,
    /// Paths of files attached to the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
    /// Delivery mode hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl MessageOptions {
    /// Build options for a plain text prompt.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            attachments: None,
            mode: None,
        }
    }
}

/// Response to `ping`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PingResponse {
    /// Echo of the message sent, if any.
    pub message: Option<String>,
    /// Server timestamp.
    pub timestamp: Option<i64>,
    /// Protocol revision the server speaks.
    pub protocol_version: Option<u32>,
}

/// Response to `status.get`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetStatusResponse {
    /// Server build version.
    pub version: Option<String>,
    /// Protocol revision the server speaks.
    pub protocol_version: Option<u32>,
}

/// Response to `auth.getStatus`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetAuthStatusResponse {
    /// Whether a user is authenticated.
    pub is_authenticated: Option<bool>,
    /// Authentication mechanism in use.
    pub auth_type: Option<String>,
    /// Host authenticated against.
    pub host: Option<String>,
    /// Authenticated login name.
    pub login: Option<String>,
    /// Human-readable status detail.
    pub status_message: Option<String>,
}

/// Response to `session.create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    /// Id of the new session.
    pub session_id: String,
    /// Workspace directory bound to the session.
    #[serde(default)]
    pub workspace_path: Option<String>,
}

/// Response to `session.resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSessionResponse {
    /// Id of the resumed session.
    pub session_id: String,
    /// Workspace directory bound to the session.
    #[serde(default)]
    pub workspace_path: Option<String>,
}

/// Response to `session.send`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendMessageResponse {
    /// Id assigned to the submitted message.
    pub message_id: Option<String>,
}

/// Response to `session.getMessages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetMessagesResponse {
    /// Raw event log of the conversation.
    pub events: Vec<Value>,
}

/// Metadata describing a stored session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionMetadata {
    /// Session id.
    pub session_id: Option<String>,
    /// Workspace the session was bound to.
    pub workspace_path: Option<String>,
    /// When the session started.
    pub start_time: Option<String>,
    /// Last modification time.
    pub modified_time: Option<String>,
    /// One-line summary of the conversation.
    pub summary: Option<String>,
}

/// Response to `session.list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListSessionsResponse {
    /// All stored sessions.
    pub sessions: Vec<SessionMetadata>,
}

/// Response to `session.delete`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteSessionResponse {
    /// Whether the deletion happened.
    pub success: bool,
    /// Failure detail when `success` is false.
    pub error: Option<String>,
}

/// Response to `session.getLastId`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetLastSessionIdResponse {
    /// Most recent session id, if any.
    pub session_id: Option<String>,
}

/// Response to `session.getForeground`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetForegroundSessionResponse {
    /// Foreground session id, if any.
    pub session_id: Option<String>,
    /// Its workspace path.
    pub workspace_path: Option<String>,
}

/// Response to `session.setForeground`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetForegroundSessionResponse {
    /// Whether the switch happened.
    pub success: bool,
    /// Failure detail when `success` is false.
    pub error: Option<String>,
}

/// A model offered by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelInfo {
    /// Model id used in requests.
    pub id: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Capability flags and limits, passed through untyped.
    pub capabilities: Option<Value>,
    /// Usage policy, passed through untyped.
    pub policy: Option<Value>,
    /// Billing descriptor, passed through untyped.
    pub billing: Option<Value>,
}

/// Response to `models.list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetModelsResponse {
    /// All available models.
    pub models: Vec<ModelInfo>,
}

/// A custom agent offered by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentInfo {
    /// Agent name used for selection.
    pub name: Option<String>,
    /// Display name.
    pub display_name: Option<String>,
    /// What the agent does.
    pub description: Option<String>,
}

/// Result of `session.compaction.compact`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompactResult {
    /// Whether compaction ran.
    pub success: bool,
    /// Tokens removed from the context.
    pub tokens_removed: f64,
    /// Messages summarized away.
    pub messages_removed: f64,
}

/// Client-level lifecycle notification for a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionLifecycleEvent {
    /// Session the notification concerns.
    pub session_id: Option<String>,
    /// Lifecycle phase, e.g. `created` or `deleted`.
    pub event: Option<String>,
    /// Session metadata at the time of the event.
    pub metadata: Option<SessionMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_options_round_trip() {
        let options = MessageOptions {
            prompt: "hello".to_string(),
            attachments: Some(vec!["a.txt".to_string()]),
            mode: Some("immediate".to_string()),
        };
        let encoded = serde_json::to_value(&options).unwrap();
        assert_eq!(encoded["prompt"], "hello");
        assert_eq!(encoded["attachments"][0], "a.txt");

        let decoded: MessageOptions = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.prompt, "hello");
        assert_eq!(decoded.mode.as_deref(), Some("immediate"));
    }

    #[test]
    fn test_plain_prompt_omits_optional_fields() {
        let encoded = serde_json::to_value(MessageOptions::new("hi")).unwrap();
        assert!(encoded.get("attachments").is_none());
        assert!(encoded.get("mode").is_none());
    }

    #[test]
    fn test_create_session_response_tolerates_missing_workspace() {
        let decoded: CreateSessionResponse =
            serde_json::from_value(json!({"sessionId": "s-1"})).unwrap();
        assert_eq!(decoded.session_id, "s-1");
        assert!(decoded.workspace_path.is_none());
    }

    #[test]
    fn test_ping_response_tolerates_unknown_fields() {
        let decoded: PingResponse = serde_json::from_value(json!({
            "message": "pong",
            "protocolVersion": 1,
            "futureField": {"x": 1}
        }))
        .unwrap();
        assert_eq!(decoded.protocol_version, Some(1));
    }

    #[test]
    fn test_models_response_decodes_nested_values() {
        let decoded: GetModelsResponse = serde_json::from_value(json!({
            "models": [{"id": "m-1", "name": "Test Model", "capabilities": {"vision": true}}]
        }))
        .unwrap();
        assert_eq!(decoded.models.len(), 1);
        assert_eq!(decoded.models[0].id.as_deref(), Some("m-1"));
        assert_eq!(decoded.models[0].capabilities, Some(json!({"vision": true})));
    }
}
