//! Client bootstrap: spawns the assistant CLI or connects to a running
//! server, owns the connection, and routes server-initiated traffic to
//! sessions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{
    Arc, RwLock,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

use quill_rpc::{HandlerError, RpcClient, method_handler};

use crate::error::{SdkError, SdkResult};
use crate::events::SessionEvent;
use crate::session::Session;
use crate::tools::{PermissionRequest, ToolInvocation};
use crate::types::{
    CreateSessionResponse, DeleteSessionResponse, GetAuthStatusResponse,
    GetForegroundSessionResponse, GetLastSessionIdResponse, GetModelsResponse, GetStatusResponse,
    ListSessionsResponse, ModelInfo, PROTOCOL_VERSION, PingResponse, ResumeSessionConfig,
    ResumeSessionResponse, SessionConfig, SessionLifecycleEvent, SessionMetadata,
    SetForegroundSessionResponse,
};
use crate::util::{read, write};

/// Connection lifecycle of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection has been established.
    Disconnected,
    /// A start attempt is in flight.
    Connecting,
    /// The connection is up and the protocol version was verified.
    Connected,
    /// The last start attempt failed.
    Error,
}

/// Options for constructing a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Path to the assistant CLI binary. Required unless `server_url` is
    /// set.
    pub cli_path: Option<String>,
    /// Extra arguments placed before the standard headless flags.
    pub cli_args: Vec<String>,
    /// Address of an already-running server (`host:port`, a bare port, or
    /// an `http://host:port` form). When set, no process is spawned.
    pub server_url: Option<String>,
    /// Working directory for the spawned CLI.
    pub cwd: Option<PathBuf>,
    /// Extra environment for the spawned CLI.
    pub env: HashMap<String, String>,
    /// Log level passed to the spawned CLI.
    pub log_level: String,
    /// Start automatically on the first `create_session`/`resume_session`.
    pub auto_start: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            cli_path: None,
            cli_args: Vec::new(),
            server_url: None,
            cwd: None,
            env: HashMap::new(),
            log_level: "error".to_string(),
            auto_start: true,
        }
    }
}

type LifecycleHandler = Arc<dyn Fn(SessionLifecycleEvent) + Send + Sync>;

/// Entry point of the SDK: manages the connection to the assistant CLI and
/// creates conversation sessions.
pub struct Client {
    options: ClientOptions,
    state: RwLock<ConnectionState>,
    rpc: tokio::sync::Mutex<Option<RpcClient>>,
    sessions: Arc<DashMap<String, Arc<Session>>>,
    models_cache: tokio::sync::Mutex<Option<Vec<ModelInfo>>>,
    lifecycle_handlers: Arc<DashMap<u64, LifecycleHandler>>,
    next_lifecycle_id: AtomicU64,
}

impl Client {
    /// Build a client. No connection is made until [`Client::start`] runs
    /// (or the first session is created with `auto_start`).
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            state: RwLock::new(ConnectionState::Disconnected),
            rpc: tokio::sync::Mutex::new(None),
            sessions: Arc::new(DashMap::new()),
            models_cache: tokio::sync::Mutex::new(None),
            lifecycle_handlers: Arc::new(DashMap::new()),
            next_lifecycle_id: AtomicU64::new(1),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *read(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *write(&self.state) = state;
    }

    // ---- Start / stop ----

    /// Establish the connection: spawn the CLI (or connect to
    /// `server_url`), wire up inbound handlers, and verify the protocol
    /// version. A no-op when already connected.
    ///
    /// # Errors
    ///
    /// [`SdkError::Configuration`], [`SdkError::Spawn`],
    /// [`SdkError::Connection`], or [`SdkError::ProtocolMismatch`].
    pub async fn start(&self) -> SdkResult<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);
        match self.do_start().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!("connected to assistant server");
                Ok(())
            }
            Err(error) => {
                self.set_state(ConnectionState::Error);
                Err(error)
            }
        }
    }

    async fn do_start(&self) -> SdkResult<()> {
        let rpc = if let Some(url) = &self.options.server_url {
            let (host, port) = parse_server_url(url)?;
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|error| {
                    SdkError::Connection(format!("failed to connect to {host}:{port}: {error}"))
                })?;
            RpcClient::from_tcp(stream)
        } else {
            self.spawn_cli().await?
        };

        self.attach_handlers(&rpc);
        {
            let mut slot = self.rpc.lock().await;
            *slot = Some(rpc.clone());
        }

        if let Err(error) = self.verify_protocol_version(&rpc).await {
            rpc.close().await;
            *self.rpc.lock().await = None;
            return Err(error);
        }
        Ok(())
    }

    async fn spawn_cli(&self) -> SdkResult<RpcClient> {
        let cli_path = self.options.cli_path.as_deref().ok_or_else(|| {
            SdkError::Configuration("cli_path is required when no server_url is set".to_string())
        })?;

        let mut command = Command::new(cli_path);
        command.args(&self.options.cli_args);
        command.args(["--headless", "--stdio", "--log-level", &self.options.log_level]);
        if let Some(cwd) = &self.options.cwd {
            command.current_dir(cwd);
        }
        command.envs(&self.options.env);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|error| SdkError::Spawn(format!("{cli_path}: {error}")))?;
        debug!(path = cli_path, "assistant process spawned");
        Ok(RpcClient::from_child(child)?)
    }

    async fn verify_protocol_version(&self, rpc: &RpcClient) -> SdkResult<()> {
        let ping: PingResponse = rpc.invoke("ping", json!({"message": null})).await?;
        match ping.protocol_version {
            Some(version) if version == PROTOCOL_VERSION => Ok(()),
            actual => Err(SdkError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                actual,
            }),
        }
    }

    /// Gracefully stop: destroy every session (three attempts each, with
    /// backoff), close the connection, and drop caches. Errors from the
    /// per-session teardown are collected, not fatal.
    ///
    /// # Errors
    ///
    /// Currently never fails outright; the returned list carries the
    /// sessions that could not be destroyed.
    pub async fn stop(&self) -> SdkResult<Vec<SdkError>> {
        let mut errors = Vec::new();
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for session in sessions {
            for attempt in 1u32..=3 {
                match session.destroy_remote().await {
                    Ok(()) => break,
                    Err(error) => {
                        if attempt == 3 {
                            warn!(
                                session = %session.session_id(),
                                %error,
                                "failed to destroy session after 3 attempts"
                            );
                            errors.push(error);
                        } else {
                            let delay = match attempt {
                                1 => Duration::from_millis(100),
                                _ => Duration::from_millis(200),
                            };
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
            session.close_local();
        }
        self.sessions.clear();

        if let Some(rpc) = self.rpc.lock().await.take() {
            rpc.close().await;
        }
        *self.models_cache.lock().await = None;
        self.set_state(ConnectionState::Disconnected);
        Ok(errors)
    }

    /// Tear everything down without the graceful per-session destroy pass.
    pub async fn force_stop(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            session.close_local();
        }
        self.sessions.clear();

        if let Some(rpc) = self.rpc.lock().await.take() {
            rpc.close().await;
        }
        *self.models_cache.lock().await = None;
        self.set_state(ConnectionState::Disconnected);
    }

    // ---- Sessions ----

    /// Create a new conversation session.
    ///
    /// # Errors
    ///
    /// [`SdkError::NotConnected`] when not started and `auto_start` is off,
    /// or the underlying RPC/decode error.
    pub async fn create_session(&self, config: SessionConfig) -> SdkResult<Arc<Session>> {
        self.ensure_connected().await?;
        let rpc = self.rpc().await?;

        let descriptors: Vec<Value> = config.tools.iter().map(|tool| tool.descriptor()).collect();
        let response: CreateSessionResponse = rpc
            .invoke(
                "session.create",
                json!({"model": config.model, "tools": descriptors}),
            )
            .await?;

        let session = Session::new(
            response.session_id.clone(),
            response.workspace_path,
            rpc,
            config.tools,
            config.permission_handler,
            Arc::downgrade(&self.sessions),
        );
        self.sessions
            .insert(response.session_id, Arc::clone(&session));
        Ok(session)
    }

    /// Resume a stored session by id.
    ///
    /// # Errors
    ///
    /// Same as [`Client::create_session`].
    pub async fn resume_session(&self, config: ResumeSessionConfig) -> SdkResult<Arc<Session>> {
        self.ensure_connected().await?;
        let rpc = self.rpc().await?;

        let descriptors: Vec<Value> = config.tools.iter().map(|tool| tool.descriptor()).collect();
        let response: ResumeSessionResponse = rpc
            .invoke(
                "session.resume",
                json!({"sessionId": config.session_id, "tools": descriptors}),
            )
            .await?;

        let session = Session::new(
            response.session_id.clone(),
            response.workspace_path,
            rpc,
            config.tools,
            config.permission_handler,
            Arc::downgrade(&self.sessions),
        );
        self.sessions
            .insert(response.session_id, Arc::clone(&session));
        Ok(session)
    }

    /// List the sessions stored on the server.
    ///
    /// # Errors
    ///
    /// [`SdkError::NotConnected`] or the underlying RPC error.
    pub async fn list_sessions(&self) -> SdkResult<Vec<SessionMetadata>> {
        let rpc = self.rpc().await?;
        let response: ListSessionsResponse = rpc.invoke("session.list", json!({})).await?;
        Ok(response.sessions)
    }

    /// Permanently delete a stored session.
    ///
    /// # Errors
    ///
    /// [`SdkError::Protocol`] when the server reports a failed deletion,
    /// plus the usual connection errors.
    pub async fn delete_session(&self, session_id: &str) -> SdkResult<()> {
        let rpc = self.rpc().await?;
        let response: DeleteSessionResponse = rpc
            .invoke("session.delete", json!({"sessionId": session_id}))
            .await?;
        if !response.success {
            let detail = response.error.unwrap_or_else(|| "Unknown error".to_string());
            return Err(SdkError::Protocol(format!(
                "failed to delete session {session_id}: {detail}"
            )));
        }
        self.sessions.remove(session_id);
        Ok(())
    }

    /// Id of the most recently used session, if any.
    ///
    /// # Errors
    ///
    /// [`SdkError::NotConnected`] or the underlying RPC error.
    pub async fn get_last_session_id(&self) -> SdkResult<Option<String>> {
        let rpc = self.rpc().await?;
        let response: GetLastSessionIdResponse = rpc.invoke("session.getLastId", json!({})).await?;
        Ok(response.session_id)
    }

    // ---- Ping / status / models ----

    /// Ping the server.
    ///
    /// # Errors
    ///
    /// [`SdkError::NotConnected`] or the underlying RPC error.
    pub async fn ping(&self, message: Option<&str>) -> SdkResult<PingResponse> {
        let rpc = self.rpc().await?;
        Ok(rpc.invoke("ping", json!({"message": message})).await?)
    }

    /// Server version and protocol information.
    ///
    /// # Errors
    ///
    /// [`SdkError::NotConnected`] or the underlying RPC error.
    pub async fn get_status(&self) -> SdkResult<GetStatusResponse> {
        let rpc = self.rpc().await?;
        Ok(rpc.invoke("status.get", json!({})).await?)
    }

    /// Current authentication status.
    ///
    /// # Errors
    ///
    /// [`SdkError::NotConnected`] or the underlying RPC error.
    pub async fn get_auth_status(&self) -> SdkResult<GetAuthStatusResponse> {
        let rpc = self.rpc().await?;
        Ok(rpc.invoke("auth.getStatus", json!({})).await?)
    }

    /// List available models. Cached after the first successful call.
    ///
    /// # Errors
    ///
    /// [`SdkError::NotConnected`] or the underlying RPC error.
    pub async fn list_models(&self) -> SdkResult<Vec<ModelInfo>> {
        {
            let cache = self.models_cache.lock().await;
            if let Some(models) = cache.as_ref() {
                return Ok(models.clone());
            }
        }
        let rpc = self.rpc().await?;
        let response: GetModelsResponse = rpc.invoke("models.list", json!({})).await?;
        let mut cache = self.models_cache.lock().await;
        *cache = Some(response.models.clone());
        Ok(response.models)
    }

    // ---- Foreground session ----

    /// Foreground session id, when the server runs with an attached UI.
    ///
    /// # Errors
    ///
    /// [`SdkError::NotConnected`] or the underlying RPC error.
    pub async fn get_foreground_session_id(&self) -> SdkResult<Option<String>> {
        let rpc = self.rpc().await?;
        let response: GetForegroundSessionResponse =
            rpc.invoke("session.getForeground", json!({})).await?;
        Ok(response.session_id)
    }

    /// Bring a session to the foreground.
    ///
    /// # Errors
    ///
    /// [`SdkError::Protocol`] when the server refuses the switch, plus the
    /// usual connection errors.
    pub async fn set_foreground_session_id(&self, session_id: &str) -> SdkResult<()> {
        let rpc = self.rpc().await?;
        let response: SetForegroundSessionResponse = rpc
            .invoke("session.setForeground", json!({"sessionId": session_id}))
            .await?;
        if !response.success {
            let detail = response.error.unwrap_or_else(|| "Unknown error".to_string());
            return Err(SdkError::Protocol(detail));
        }
        Ok(())
    }

    // ---- Lifecycle subscription ----

    /// Subscribe to client-level session lifecycle notifications. Returns
    /// the handler id for [`Client::off_lifecycle`].
    pub fn on_lifecycle(
        &self,
        handler: impl Fn(SessionLifecycleEvent) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_lifecycle_id.fetch_add(1, Ordering::SeqCst);
        self.lifecycle_handlers.insert(id, Arc::new(handler));
        id
    }

    /// Remove a lifecycle handler by id.
    pub fn off_lifecycle(&self, id: u64) {
        self.lifecycle_handlers.remove(&id);
    }

    // ---- Internal ----

    async fn ensure_connected(&self) -> SdkResult<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        if self.options.auto_start {
            self.start().await
        } else {
            Err(SdkError::NotConnected)
        }
    }

    async fn rpc(&self) -> SdkResult<RpcClient> {
        self.rpc.lock().await.clone().ok_or(SdkError::NotConnected)
    }

    /// Wire the server-initiated surface: session events and lifecycle
    /// notifications, tool calls, and permission requests.
    fn attach_handlers(&self, rpc: &RpcClient) {
        let sessions = Arc::clone(&self.sessions);
        rpc.register_method_handler(
            "session.event",
            method_handler(move |_id, params| {
                let sessions = Arc::clone(&sessions);
                async move {
                    let session_id = params
                        .get("sessionId")
                        .and_then(Value::as_str)
                        .ok_or_else(|| HandlerError::new("session.event missing sessionId"))?;
                    let event_value = params
                        .get("event")
                        .ok_or_else(|| HandlerError::new("session.event missing event"))?;
                    let event = SessionEvent::from_value(event_value);
                    // Drop the map guard before dispatching; a subscriber may
                    // close the session and touch the registry.
                    let session = sessions.get(session_id).map(|s| Arc::clone(s.value()));
                    match session {
                        Some(session) => session.dispatch_event(&event),
                        None => debug!(session = %session_id, "event for unknown session"),
                    }
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );

        let handlers = Arc::clone(&self.lifecycle_handlers);
        rpc.register_method_handler(
            "session.lifecycle",
            method_handler(move |_id, params| {
                let handlers = Arc::clone(&handlers);
                async move {
                    let event: SessionLifecycleEvent = serde_json::from_value(params)
                        .map_err(|error| {
                            HandlerError::new(format!("bad session.lifecycle payload: {error}"))
                        })?;
                    for entry in handlers.iter() {
                        (entry.value().as_ref())(event.clone());
                    }
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );

        let sessions = Arc::clone(&self.sessions);
        rpc.register_method_handler(
            "tool.call",
            method_handler(move |_id, params| {
                let sessions = Arc::clone(&sessions);
                async move {
                    let invocation: ToolInvocation =
                        serde_json::from_value(params).map_err(|error| {
                            HandlerError::new(format!("bad tool.call params: {error}"))
                        })?;
                    let session = sessions
                        .get(&invocation.session_id)
                        .map(|s| Arc::clone(s.value()))
                        .ok_or_else(|| {
                            HandlerError::new(format!(
                                "unknown session {}",
                                invocation.session_id
                            ))
                        })?;
                    let result = session.handle_tool_call(invocation).await;
                    Ok(json!({"result": result}))
                }
                .boxed()
            }),
        );

        let sessions = Arc::clone(&self.sessions);
        rpc.register_method_handler(
            "permission.request",
            method_handler(move |_id, params| {
                let sessions = Arc::clone(&sessions);
                async move {
                    let session_id = params
                        .get("sessionId")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let request: PermissionRequest = params
                        .get("permissionRequest")
                        .cloned()
                        .map(serde_json::from_value)
                        .transpose()
                        .map_err(|error| {
                            HandlerError::new(format!("bad permission.request payload: {error}"))
                        })?
                        .unwrap_or(PermissionRequest {
                            kind: String::new(),
                            tool_call_id: None,
                            tool_name: None,
                            extra: serde_json::Map::new(),
                        });

                    let session = sessions.get(&session_id).map(|s| Arc::clone(s.value()));
                    let kind = match session {
                        Some(session) => session
                            .handle_permission_request(request)
                            .await
                            .reply_kind()
                            .to_string(),
                        None => {
                            debug!(session = %session_id, "permission request for unknown session");
                            "denied-no-permission-handler".to_string()
                        }
                    };
                    Ok(json!({"result": {"kind": kind}}))
                }
                .boxed()
            }),
        );
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

/// Parse a `server_url` into host and port.
///
/// Accepted forms: `host:port`, a bare port (localhost assumed), and the
/// same with an `http://`/`https://` prefix.
fn parse_server_url(url: &str) -> SdkResult<(String, u16)> {
    let clean = url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');

    if let Ok(port) = clean.parse::<u16>() {
        return Ok(("localhost".to_string(), port));
    }

    let Some((host, port)) = clean.rsplit_once(':') else {
        return Err(SdkError::Configuration(format!(
            "invalid server_url '{url}': expected host:port, http://host:port, or a bare port"
        )));
    };
    let port: u16 = port.parse().map_err(|_| {
        SdkError::Configuration(format!("invalid port in server_url '{url}'"))
    })?;
    let host = if host.is_empty() {
        "localhost".to_string()
    } else {
        host.to_string()
    };
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_port() {
        assert_eq!(
            parse_server_url("8923").unwrap(),
            ("localhost".to_string(), 8923)
        );
    }

    #[test]
    fn test_parse_host_and_port() {
        assert_eq!(
            parse_server_url("127.0.0.1:9000").unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );
    }

    #[test]
    fn test_parse_http_prefix() {
        assert_eq!(
            parse_server_url("http://localhost:4321").unwrap(),
            ("localhost".to_string(), 4321)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_server_url("not a url").is_err());
        assert!(parse_server_url("host:notaport").is_err());
    }

    #[test]
    fn test_new_client_is_disconnected() {
        let client = Client::new(ClientOptions::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_calls_fail_before_start() {
        let client = Client::new(ClientOptions::default());
        let result = client.ping(None).await;
        assert!(matches!(result, Err(SdkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_create_session_without_auto_start_fails() {
        let client = Client::new(ClientOptions {
            auto_start: false,
            ..ClientOptions::default()
        });
        let result = client.create_session(SessionConfig::default()).await;
        assert!(matches!(result, Err(SdkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_start_without_cli_path_is_a_configuration_error() {
        let client = Client::new(ClientOptions {
            auto_start: true,
            ..ClientOptions::default()
        });
        let result = client.start().await;
        assert!(matches!(result, Err(SdkError::Configuration(_))));
        assert_eq!(client.state(), ConnectionState::Error);
    }

    #[test]
    fn test_lifecycle_handler_registration() {
        let client = Client::new(ClientOptions::default());
        let id = client.on_lifecycle(|_| {});
        assert_eq!(client.lifecycle_handlers.len(), 1);
        client.off_lifecycle(id);
        assert!(client.lifecycle_handlers.is_empty());
    }
}
