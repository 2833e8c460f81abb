//! Request/response correlation engine and inbound dispatch.
//!
//! One dedicated reader task per connection pulls frames sequentially and
//! classifies them: responses resolve the matching pending request,
//! server-initiated requests are handed to registered [`MethodHandler`]s on
//! their own tasks so the reader is never blocked by application code,
//! notifications dispatch inline to keep delivery ordered, and anything else
//! is discarded. Writes from request sending, notification sending, and
//! reply sending are serialized through a single writer lock so frames never
//! interleave.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    process::Child,
    sync::{Mutex, oneshot},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::error::{HandlerError, RpcError, RpcResult};
use crate::protocol::{
    ErrorObject, IncomingMessage, OutgoingNotification, OutgoingRequest, OutgoingResponse,
    RequestId,
};
use crate::transport::{FrameReader, write_frame};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingSender = oneshot::Sender<RpcResult<Value>>;

/// Handler for server-initiated calls.
///
/// `id` is `Some` for requests expecting a reply and `None` for
/// notifications. For requests, the returned value becomes the `result`
/// member of the reply and an error becomes a `-32603` reply carrying the
/// handler's message; for notifications the outcome is discarded (errors are
/// logged) and no reply frame is ever written.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Handle one inbound call.
    async fn handle(&self, id: Option<RequestId>, params: Value) -> Result<Value, HandlerError>;
}

struct FnMethodHandler<F>(F);

#[async_trait]
impl<F> MethodHandler for FnMethodHandler<F>
where
    F: Fn(Option<RequestId>, Value) -> BoxFuture<'static, Result<Value, HandlerError>>
        + Send
        + Sync,
{
    async fn handle(&self, id: Option<RequestId>, params: Value) -> Result<Value, HandlerError> {
        (self.0)(id, params).await
    }
}

/// Wrap an async closure as a [`MethodHandler`].
pub fn method_handler<F>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(Option<RequestId>, Value) -> BoxFuture<'static, Result<Value, HandlerError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnMethodHandler(f))
}

/// Framed JSON-RPC client over a subprocess's stdio pipes or a TCP socket.
///
/// Cheaply cloneable; clones share the same connection, pending table, and
/// handler registry.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    writer: Mutex<BoxWriter>,
    pending: DashMap<i64, PendingSender>,
    handlers: DashMap<String, Arc<dyn MethodHandler>>,
    next_id: AtomicI64,
    closed: AtomicBool,
    child: Option<Mutex<Child>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Build a client over an arbitrary read/write pair and spawn its reader
    /// task. Must be called from within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(Box::new(reader), Box::new(writer), None)
    }

    /// Build a client over a spawned assistant process's stdio pipes.
    ///
    /// Takes ownership of the child; [`RpcClient::close`] kills it. Stderr,
    /// if piped, is forwarded to the log.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Io`] if the child's stdin or stdout was not piped.
    pub fn from_child(mut child: Child) -> RpcResult<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RpcError::Io("child process stdin is not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RpcError::Io("child process stdout is not piped".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        debug!(target: "quill_rpc::server", "{line}");
                    }
                }
            });
        }
        Ok(Self::build(Box::new(stdout), Box::new(stdin), Some(child)))
    }

    /// Build a client over a connected TCP socket.
    #[must_use]
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::build(Box::new(reader), Box::new(writer), None)
    }

    fn build(reader: BoxReader, writer: BoxWriter, child: Option<Child>) -> Self {
        let inner = Arc::new(ClientInner {
            writer: Mutex::new(writer),
            pending: DashMap::new(),
            handlers: DashMap::new(),
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
            child: child.map(Mutex::new),
            reader_task: Mutex::new(None),
        });
        let task = tokio::spawn(read_loop(Arc::clone(&inner), reader));
        // The reader task holds its own Arc; stash the handle for close().
        if let Ok(mut slot) = inner.reader_task.try_lock() {
            *slot = Some(task);
        }
        Self { inner }
    }

    /// Issue a request and decode the result into `T`.
    ///
    /// The pending entry is registered before the frame is written, so a
    /// reply can never race its own registration.
    ///
    /// # Errors
    ///
    /// [`RpcError::Closed`] on a closed engine, [`RpcError::Io`] if the send
    /// fails or the connection is lost before the reply, [`RpcError::Rpc`]
    /// if the server answers with an error object, and [`RpcError::Decode`]
    /// if the result does not match `T`.
    pub async fn invoke<T: DeserializeOwned>(&self, method: &str, params: Value) -> RpcResult<T> {
        let result = self.invoke_raw(method, params).await?;
        serde_json::from_value(result).map_err(|error| RpcError::Decode(error.to_string()))
    }

    /// Issue a request whose result payload is irrelevant.
    ///
    /// Succeeds once any matching response arrives, regardless of the
    /// payload's shape.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::invoke`], minus the decode failure.
    pub async fn invoke_unit(&self, method: &str, params: Value) -> RpcResult<()> {
        self.invoke_raw(method, params).await.map(|_| ())
    }

    /// Issue a request and return the raw result value.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::invoke`], minus the decode failure.
    pub async fn invoke_raw(&self, method: &str, params: Value) -> RpcResult<Value> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        // A close between the flag check and the insert would miss this
        // entry when it sweeps the table.
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.pending.remove(&id);
            return Err(RpcError::Closed);
        }

        let request = OutgoingRequest::new(id, method, params);
        let payload = match serde_json::to_vec(&request) {
            Ok(payload) => payload,
            Err(error) => {
                self.inner.pending.remove(&id);
                return Err(RpcError::Encode(error.to_string()));
            }
        };
        trace!(method, id, "sending request");
        if let Err(error) = self.inner.send_frame(&payload).await {
            self.inner.pending.remove(&id);
            return Err(error);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Io(
                "connection closed before a response arrived".to_string(),
            )),
        }
    }

    /// Send a notification: no id, no pending entry, no reply.
    ///
    /// # Errors
    ///
    /// [`RpcError::Closed`] on a closed engine, [`RpcError::Encode`] if the
    /// parameters cannot be serialized, or [`RpcError::Io`] if the write
    /// fails.
    pub async fn notify(&self, method: &str, params: Value) -> RpcResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let notification = OutgoingNotification::new(method, params);
        let payload =
            serde_json::to_vec(&notification).map_err(|e| RpcError::Encode(e.to_string()))?;
        trace!(method, "sending notification");
        self.inner.send_frame(&payload).await
    }

    /// Register a handler for a server-initiated method.
    ///
    /// Replaces any handler previously registered under the same name.
    pub fn register_method_handler(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) {
        self.inner.handlers.insert(method.into(), handler);
    }

    /// Whether the connection is still usable.
    ///
    /// For subprocess connections this also checks that the child is alive.
    pub async fn is_connected(&self) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(child) = &self.inner.child {
            let mut child = child.lock().await;
            return matches!(child.try_wait(), Ok(None));
        }
        true
    }

    /// OS process id of the owned assistant process, `None` for sockets.
    pub async fn process_id(&self) -> Option<u32> {
        match &self.inner.child {
            Some(child) => child.lock().await.id(),
            None => None,
        }
    }

    /// Close the connection.
    ///
    /// Idempotent. Stops the reader task, fails every outstanding request
    /// with a transport-kind error exactly once, kills an owned child
    /// process, and shuts the write half down. Later `invoke`/`notify`
    /// calls fail immediately with [`RpcError::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.inner.reader_task.lock().await.take() {
            task.abort();
        }
        self.inner.fail_all_pending("connection closed");
        if let Some(child) = &self.inner.child {
            let mut child = child.lock().await;
            if let Err(error) = child.start_kill() {
                debug!(%error, "failed to kill assistant process");
            }
        }
        let mut writer = self.inner.writer.lock().await;
        if let Err(error) = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await {
            trace!(%error, "write half shutdown failed");
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    async fn send_frame(&self, payload: &[u8]) -> RpcResult<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, payload)
            .await
            .map_err(RpcError::from)
    }

    fn fail_all_pending(&self, reason: &str) {
        let ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(RpcError::Io(reason.to_string())));
            }
        }
    }

    /// Classify one decoded frame: response, server-initiated call, or noise.
    async fn dispatch_frame(self: &Arc<Self>, payload: &[u8]) {
        let message: IncomingMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "failed to parse incoming message");
                return;
            }
        };

        if message.is_response() {
            if let Some(RequestId::Number(id)) = &message.id {
                if let Some((_, tx)) = self.pending.remove(id) {
                    let outcome = match message.error {
                        Some(error) => Err(RpcError::from(error)),
                        None => Ok(message.result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(outcome);
                    return;
                }
            }
            if message.method.is_none() {
                debug!(id = ?message.id, "discarding response with unknown or stale id");
                return;
            }
        }

        if let Some(method) = message.method {
            let params = message.params.unwrap_or(Value::Null);
            self.handle_server_call(message.id, method, params).await;
            return;
        }

        trace!("discarding frame with neither response nor method");
    }

    /// Route a server-initiated call.
    ///
    /// Requests (id present) run on their own task so the reader is never
    /// blocked waiting on application code — permission prompts and tool
    /// handlers can take arbitrarily long. Notifications run inline on the
    /// reader task, keeping event delivery sequential; a slow notification
    /// handler stalls delivery of subsequent frames by contract.
    async fn handle_server_call(
        self: &Arc<Self>,
        id: Option<RequestId>,
        method: String,
        params: Value,
    ) {
        let handler = self
            .handlers
            .get(&method)
            .map(|entry| Arc::clone(entry.value()));

        match (id, handler) {
            (Some(id), Some(handler)) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let reply = match handler.handle(Some(id.clone()), params).await {
                        Ok(result) => OutgoingResponse::result(id, result),
                        Err(error) => {
                            warn!(method, %error, "method handler failed");
                            OutgoingResponse::error(id, ErrorObject::internal_error(error.0))
                        }
                    };
                    inner.send_reply(reply).await;
                });
            }
            (Some(id), None) => {
                debug!(method, "no handler registered for server request");
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let reply = OutgoingResponse::error(id, ErrorObject::method_not_found(&method));
                    inner.send_reply(reply).await;
                });
            }
            (None, Some(handler)) => {
                if let Err(error) = handler.handle(None, params).await {
                    warn!(method, %error, "notification handler failed");
                }
            }
            (None, None) => {
                debug!(method, "no handler registered for notification");
            }
        }
    }

    async fn send_reply(&self, reply: OutgoingResponse) {
        let payload = match serde_json::to_vec(&reply) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "failed to encode reply");
                return;
            }
        };
        if let Err(error) = self.send_frame(&payload).await {
            debug!(%error, "failed to send reply");
        }
    }
}

async fn read_loop(inner: Arc<ClientInner>, reader: BoxReader) {
    let mut frames = FrameReader::new(reader);
    loop {
        match frames.read_frame().await {
            Ok(Some(payload)) => inner.dispatch_frame(&payload).await,
            Ok(None) => {
                debug!("server closed the stream");
                break;
            }
            Err(error) => {
                debug!(%error, "read loop terminated");
                break;
            }
        }
    }
    // Connection loss counts as close: reject new work, fail what's pending.
    if !inner.closed.swap(true, Ordering::SeqCst) {
        inner.fail_all_pending("connection lost");
    }
}
