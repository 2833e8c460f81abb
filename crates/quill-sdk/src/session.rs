//! One logical conversation with the assistant, guarded by a closed/open
//! state machine.
//!
//! Every operation that mutates state or touches the wire checks the guard
//! first and fails fast with [`SdkError::SessionClosed`] once the session is
//! closed. Pure accessors (`session_id`, `workspace_path`) stay valid after
//! close. The OPEN → CLOSED transition is one-way and idempotent: concurrent
//! `close` calls collapse into a single teardown.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use quill_rpc::RpcClient;

use crate::api::{AgentApi, CompactionApi};
use crate::error::{SdkError, SdkResult};
use crate::events::{
    EventDispatcher, EventErrorPolicy, EventKind, SessionEvent, Subscription,
};
use crate::tools::{
    PermissionHandler, PermissionOutcome, PermissionRequest, ToolDefinition, ToolInvocation,
    ToolResultObject,
};
use crate::types::{GetMessagesResponse, MessageOptions, SendMessageResponse};
use crate::util::{lock, read, write};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The session accepts operations.
    Open,
    /// Terminal. Every mutating operation fails fast.
    Closed,
}

/// One conversation bound to a shared RPC connection.
pub struct Session {
    session_id: String,
    workspace_path: Option<String>,
    rpc: RpcClient,
    dispatcher: Arc<EventDispatcher>,
    tools: DashMap<String, ToolDefinition>,
    permission: Option<Arc<dyn PermissionHandler>>,
    state: RwLock<SessionState>,
    registry: Weak<DashMap<String, Arc<Session>>>,
}

impl Session {
    pub(crate) fn new(
        session_id: String,
        workspace_path: Option<String>,
        rpc: RpcClient,
        tools: Vec<ToolDefinition>,
        permission: Option<Arc<dyn PermissionHandler>>,
        registry: Weak<DashMap<String, Arc<Session>>>,
    ) -> Arc<Self> {
        let tool_map = DashMap::new();
        for tool in tools {
            tool_map.insert(tool.name().to_string(), tool);
        }
        Arc::new(Self {
            session_id,
            workspace_path,
            rpc,
            dispatcher: Arc::new(EventDispatcher::new()),
            tools: tool_map,
            permission,
            state: RwLock::new(SessionState::Open),
            registry,
        })
    }

    /// Session id. Valid before and after close.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Workspace directory bound to the session. Valid before and after
    /// close.
    #[must_use]
    pub fn workspace_path(&self) -> Option<&str> {
        self.workspace_path.as_deref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *read(&self.state)
    }

    pub(crate) fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub(crate) fn ensure_open(&self) -> SdkResult<()> {
        match self.state() {
            SessionState::Open => Ok(()),
            SessionState::Closed => Err(SdkError::SessionClosed),
        }
    }

    // ---- Messaging ----

    /// Submit a user message.
    ///
    /// # Errors
    ///
    /// [`SdkError::SessionClosed`] after close, or the underlying RPC error.
    pub async fn send(&self, options: MessageOptions) -> SdkResult<SendMessageResponse> {
        self.ensure_open()?;
        let response = self
            .rpc
            .invoke("session.send", self.with_session_id(&options)?)
            .await?;
        Ok(response)
    }

    /// Submit a user message and wait for the assistant's reply.
    ///
    /// Resolves with the first `assistant.message` event dispatched after
    /// the send.
    ///
    /// # Errors
    ///
    /// [`SdkError::SessionClosed`] after close (including a close that
    /// happens mid-wait), or the underlying RPC error.
    pub async fn send_and_wait(&self, options: MessageOptions) -> SdkResult<SessionEvent> {
        self.send_and_wait_inner(options, None).await
    }

    /// Like [`Session::send_and_wait`] with a bounded wait.
    ///
    /// The timeout abandons the local wait only; the in-flight request and
    /// the assistant's turn are not canceled.
    ///
    /// # Errors
    ///
    /// [`SdkError::Timeout`] when the wait elapses, plus everything
    /// [`Session::send_and_wait`] can return.
    pub async fn send_and_wait_timeout(
        &self,
        options: MessageOptions,
        wait: Duration,
    ) -> SdkResult<SessionEvent> {
        self.send_and_wait_inner(options, Some(wait)).await
    }

    async fn send_and_wait_inner(
        &self,
        options: MessageOptions,
        wait: Option<Duration>,
    ) -> SdkResult<SessionEvent> {
        self.ensure_open()?;

        // Subscribe before sending so a fast reply cannot slip through.
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let sink = Arc::clone(&slot);
        let subscription =
            self.dispatcher
                .subscribe_kind(EventKind::AssistantMessage, move |event| {
                    if let Some(tx) = lock(&sink).take() {
                        let _ = tx.send(event.clone());
                    }
                });

        if let Err(error) = self.send(options).await {
            subscription.unsubscribe();
            return Err(error);
        }

        let outcome = match wait {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(received) => received,
                Err(_) => {
                    subscription.unsubscribe();
                    return Err(SdkError::Timeout(duration));
                }
            },
            None => rx.await,
        };
        subscription.unsubscribe();

        // The sender only drops without firing when the dispatcher was
        // cleared by teardown.
        outcome.map_err(|_| SdkError::SessionClosed)
    }

    /// Fetch the conversation's raw event log.
    ///
    /// # Errors
    ///
    /// [`SdkError::SessionClosed`] after close, or the underlying RPC error.
    pub async fn get_messages(&self) -> SdkResult<Vec<Value>> {
        self.ensure_open()?;
        let response: GetMessagesResponse = self
            .rpc
            .invoke(
                "session.getMessages",
                json!({"sessionId": self.session_id}),
            )
            .await?;
        Ok(response.events)
    }

    /// Abort the in-flight assistant turn.
    ///
    /// # Errors
    ///
    /// [`SdkError::SessionClosed`] after close, or the underlying RPC error.
    pub async fn abort(&self) -> SdkResult<()> {
        self.ensure_open()?;
        self.rpc
            .invoke_unit("session.abort", json!({"sessionId": self.session_id}))
            .await?;
        Ok(())
    }

    // ---- Events ----

    /// Register a callback for every event of this session.
    ///
    /// # Errors
    ///
    /// [`SdkError::SessionClosed`] after close.
    pub fn on(
        &self,
        callback: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> SdkResult<Subscription> {
        self.ensure_open()?;
        Ok(self.dispatcher.subscribe_all(callback))
    }

    /// Register a callback for events of one kind.
    ///
    /// # Errors
    ///
    /// [`SdkError::SessionClosed`] after close.
    pub fn on_kind(
        &self,
        kind: EventKind,
        callback: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> SdkResult<Subscription> {
        self.ensure_open()?;
        Ok(self.dispatcher.subscribe_kind(kind, callback))
    }

    /// Set the dispatch error policy.
    ///
    /// # Errors
    ///
    /// [`SdkError::SessionClosed`] after close.
    pub fn set_event_error_policy(&self, policy: EventErrorPolicy) -> SdkResult<()> {
        self.ensure_open()?;
        self.dispatcher.set_policy(policy);
        Ok(())
    }

    /// Install the hook invoked when a subscriber panics during dispatch.
    ///
    /// # Errors
    ///
    /// [`SdkError::SessionClosed`] after close.
    pub fn set_event_error_hook(
        &self,
        hook: impl Fn(&SessionEvent, &str) + Send + Sync + 'static,
    ) -> SdkResult<()> {
        self.ensure_open()?;
        self.dispatcher.set_error_hook(hook);
        Ok(())
    }

    /// Deliver one decoded event to this session's subscribers.
    pub(crate) fn dispatch_event(&self, event: &SessionEvent) {
        if self.state() == SessionState::Closed {
            trace!(session = %self.session_id, "dropping event for closed session");
            return;
        }
        self.dispatcher.dispatch(event);
    }

    // ---- Sub-APIs ----

    /// Agent selection API for this session.
    #[must_use]
    pub fn agent(&self) -> AgentApi<'_> {
        AgentApi::new(self)
    }

    /// History compaction API for this session.
    #[must_use]
    pub fn compaction(&self) -> CompactionApi<'_> {
        CompactionApi::new(self)
    }

    // ---- Tool / permission round-trip ----

    /// Execute a server-initiated tool call.
    ///
    /// Runs on a handler task, never the reader. When a permission handler
    /// is configured its decision is awaited first; denial short-circuits
    /// and is reported as a denial result, not a call failure. Handler
    /// failures produce an opaque result — the error detail stays in local
    /// logs.
    pub(crate) async fn handle_tool_call(&self, invocation: ToolInvocation) -> ToolResultObject {
        let Some(tool) = self
            .tools
            .get(&invocation.tool_name)
            .map(|entry| entry.value().clone())
        else {
            debug!(
                session = %self.session_id,
                tool = %invocation.tool_name,
                "server invoked a tool this client never registered"
            );
            return ToolResultObject::unsupported(&invocation.tool_name);
        };

        if let Some(permission) = &self.permission {
            let request = PermissionRequest::custom_tool(&invocation);
            let outcome = permission.decide(request, Some(invocation.clone())).await;
            if let PermissionOutcome::Denied { kind } = outcome {
                debug!(
                    session = %self.session_id,
                    tool = %invocation.tool_name,
                    kind = %kind,
                    "tool invocation denied"
                );
                return ToolResultObject::denied(&kind);
            }
        }

        match tool.handler().invoke(invocation.clone()).await {
            Ok(value) => ToolResultObject::success(&value),
            Err(error) => {
                // Local surface only; the wire reply stays opaque.
                warn!(
                    session = %self.session_id,
                    tool = %invocation.tool_name,
                    %error,
                    "tool handler failed"
                );
                ToolResultObject::opaque_failure()
            }
        }
    }

    /// Answer a server-driven permission request (built-in tools).
    pub(crate) async fn handle_permission_request(
        &self,
        request: PermissionRequest,
    ) -> PermissionOutcome {
        match &self.permission {
            Some(handler) => handler.decide(request, None).await,
            None => PermissionOutcome::denied_no_handler(),
        }
    }

    // ---- Teardown ----

    /// Close the session.
    ///
    /// Idempotent: the first call performs the teardown (subscriptions
    /// released, session unregistered, best-effort server-side destroy) and
    /// every later call is a no-op. Never fails; a dead connection only
    /// downgrades the destroy to a log line.
    pub async fn close(&self) {
        if !self.transition_to_closed() {
            return;
        }
        self.teardown_local();
        // Fire-and-forget: close must not block on a server that is slow or
        // already gone.
        if let Err(error) = self
            .rpc
            .notify("session.destroy", json!({"sessionId": self.session_id}))
            .await
        {
            debug!(session = %self.session_id, %error, "session.destroy failed during close");
        }
    }

    /// Local half of close, used by [`crate::Client::stop`] after it has
    /// already driven the server-side destroy.
    pub(crate) fn close_local(&self) {
        if self.transition_to_closed() {
            self.teardown_local();
        }
    }

    pub(crate) async fn destroy_remote(&self) -> SdkResult<()> {
        self.rpc
            .invoke_unit("session.destroy", json!({"sessionId": self.session_id}))
            .await?;
        Ok(())
    }

    /// Returns true if this call performed the OPEN → CLOSED transition.
    fn transition_to_closed(&self) -> bool {
        let mut state = write(&self.state);
        if *state == SessionState::Closed {
            return false;
        }
        *state = SessionState::Closed;
        true
    }

    fn teardown_local(&self) {
        self.dispatcher.clear();
        self.tools.clear();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.session_id);
        }
        debug!(session = %self.session_id, "session closed");
    }

    fn with_session_id(&self, options: &MessageOptions) -> SdkResult<Value> {
        let mut params = serde_json::Map::new();
        params.insert(
            "sessionId".to_string(),
            Value::String(self.session_id.clone()),
        );
        let encoded = serde_json::to_value(options)
            .map_err(|error| SdkError::Protocol(format!("options did not encode: {error}")))?;
        if let Value::Object(fields) = encoded {
            params.extend(fields);
        }
        Ok(Value::Object(params))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ApproveAll, ToolError, permission_handler};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn offline_session(
        tools: Vec<ToolDefinition>,
        permission: Option<Arc<dyn PermissionHandler>>,
    ) -> Arc<Session> {
        // A session over a pipe nobody answers; enough for guard, event,
        // and tool-path tests.
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        let rpc = RpcClient::new(read_half, write_half);
        Session::new(
            "session-1".to_string(),
            Some("/workspace".to_string()),
            rpc,
            tools,
            permission,
            Weak::new(),
        )
    }

    fn echo_tool(called: Arc<AtomicBool>) -> ToolDefinition {
        ToolDefinition::new(
            "echo",
            "Echoes its input",
            json!({"type": "object"}),
            move |invocation| {
                called.store(true, Ordering::SeqCst);
                async move { Ok(invocation.arguments) }.boxed()
            },
        )
    }

    fn invocation() -> ToolInvocation {
        ToolInvocation {
            session_id: "session-1".to_string(),
            tool_call_id: uuid::Uuid::new_v4().to_string(),
            tool_name: "echo".to_string(),
            arguments: json!({"text": "hi"}),
        }
    }

    #[tokio::test]
    async fn test_accessors_survive_close() {
        let session = offline_session(Vec::new(), None);
        assert_eq!(session.session_id(), "session-1");
        session.close().await;
        assert_eq!(session.session_id(), "session-1");
        assert_eq!(session.workspace_path(), Some("/workspace"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = offline_session(Vec::new(), None);
        session.close().await;
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_mutating_operations_fail_after_close() {
        let session = offline_session(Vec::new(), None);
        session.close().await;

        let send = session.send(MessageOptions::new("hello")).await;
        assert!(matches!(send, Err(SdkError::SessionClosed)));

        let wait = session.send_and_wait(MessageOptions::new("hello")).await;
        assert!(matches!(wait, Err(SdkError::SessionClosed)));

        let messages = session.get_messages().await;
        assert!(matches!(messages, Err(SdkError::SessionClosed)));

        let abort = session.abort().await;
        assert!(matches!(abort, Err(SdkError::SessionClosed)));

        let on = session.on(|_| {});
        assert!(matches!(on, Err(SdkError::SessionClosed)));

        let on_kind = session.on_kind(EventKind::AssistantMessage, |_| {});
        assert!(matches!(on_kind, Err(SdkError::SessionClosed)));

        let policy = session.set_event_error_policy(EventErrorPolicy::Propagate);
        assert!(matches!(policy, Err(SdkError::SessionClosed)));

        let hook = session.set_event_error_hook(|_, _| {});
        assert!(matches!(hook, Err(SdkError::SessionClosed)));

        let agents = session.agent().list().await;
        assert!(matches!(agents, Err(SdkError::SessionClosed)));

        let compact = session.compaction().compact().await;
        assert!(matches!(compact, Err(SdkError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_events_are_dropped_after_close() {
        let session = offline_session(Vec::new(), None);
        let hits = Arc::new(AtomicBool::new(false));
        let sink = Arc::clone(&hits);
        let _subscription = session
            .on(move |_| sink.store(true, Ordering::SeqCst))
            .unwrap();

        session.close().await;
        session.dispatch_event(&SessionEvent::SessionIdle);
        assert!(!hits.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_tool_call_runs_registered_handler() {
        let called = Arc::new(AtomicBool::new(false));
        let session = offline_session(
            vec![echo_tool(Arc::clone(&called))],
            Some(Arc::new(ApproveAll)),
        );

        let result = session.handle_tool_call(invocation()).await;
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(result.result_type, crate::tools::ToolResultType::Success);
        assert!(result.text_result_for_llm.contains("hi"));
    }

    #[tokio::test]
    async fn test_denied_permission_short_circuits_tool_handler() {
        let called = Arc::new(AtomicBool::new(false));
        let deny = permission_handler(|_request, _invocation| {
            async { PermissionOutcome::denied_by_user() }.boxed()
        });
        let session = offline_session(vec![echo_tool(Arc::clone(&called))], Some(deny));

        let result = session.handle_tool_call(invocation()).await;
        assert!(!called.load(Ordering::SeqCst), "handler must not run");
        assert_eq!(result.result_type, crate::tools::ToolResultType::Denied);
    }

    #[tokio::test]
    async fn test_failing_tool_handler_reply_is_opaque() {
        let failing = ToolDefinition::new(
            "get_user_location",
            "Gets the user's location",
            json!({"type": "object"}),
            |_invocation| async { Err(ToolError::new("Melbourne")) }.boxed(),
        );
        let session = offline_session(vec![failing], Some(Arc::new(ApproveAll)));

        let mut call = invocation();
        call.tool_name = "get_user_location".to_string();
        let result = session.handle_tool_call(call).await;

        let encoded = serde_json::to_string(&result).unwrap();
        assert!(
            !encoded.contains("Melbourne"),
            "handler detail leaked to the wire: {encoded}"
        );
        assert_eq!(result.result_type, crate::tools::ToolResultType::Failure);
    }

    #[tokio::test]
    async fn test_unregistered_tool_reports_unsupported() {
        let session = offline_session(Vec::new(), Some(Arc::new(ApproveAll)));
        let result = session.handle_tool_call(invocation()).await;
        assert_eq!(result.result_type, crate::tools::ToolResultType::Failure);
        assert!(result.text_result_for_llm.contains("not supported"));
    }

    #[tokio::test]
    async fn test_permission_request_without_handler_is_denied() {
        let session = offline_session(Vec::new(), None);
        let outcome = session
            .handle_permission_request(PermissionRequest::custom_tool(&invocation()))
            .await;
        assert!(!outcome.is_approved());
    }
}
