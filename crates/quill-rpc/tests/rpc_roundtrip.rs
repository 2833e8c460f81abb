//! End-to-end tests for the correlation engine against a scripted fake
//! server on the other end of an in-memory duplex pipe.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde_json::{Value, json};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;

use quill_rpc::transport::{FrameReader, write_frame};
use quill_rpc::{HandlerError, RequestId, RpcClient, RpcError, method_handler};

struct FakeServer {
    frames: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeServer {
    async fn recv(&mut self) -> Value {
        let payload = self
            .frames
            .read_frame()
            .await
            .expect("server read failed")
            .expect("stream ended early");
        serde_json::from_slice(&payload).expect("client sent invalid JSON")
    }

    async fn send(&mut self, value: &Value) {
        let payload = serde_json::to_vec(value).expect("encode");
        write_frame(&mut self.writer, &payload)
            .await
            .expect("server write failed");
    }

    async fn send_raw(&mut self, payload: &[u8]) {
        write_frame(&mut self.writer, payload)
            .await
            .expect("server write failed");
    }

    /// Assert no frame arrives within a grace window.
    async fn expect_silence(&mut self) {
        let outcome = timeout(Duration::from_millis(150), self.frames.read_frame()).await;
        assert!(outcome.is_err(), "unexpected frame from client");
    }
}

/// Opt-in test logging via `RUST_LOG`.
fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn connect() -> (RpcClient, FakeServer) {
    init_logging();
    let (client_io, server_io) = tokio::io::duplex(65536);
    let (client_read, client_write) = tokio::io::split(client_io);
    let client = RpcClient::new(client_read, client_write);
    let (server_read, server_write) = tokio::io::split(server_io);
    (
        client,
        FakeServer {
            frames: FrameReader::new(server_read),
            writer: server_write,
        },
    )
}

#[tokio::test]
async fn test_concurrent_invokes_resolve_by_own_id() {
    let (client, mut server) = connect();

    let mut calls = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client
                .invoke::<Value>(&format!("test.{name}"), json!({ "name": name }))
                .await
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(server.recv().await);
    }

    // Answer in reverse arrival order; each caller must still get its own.
    for request in requests.iter().rev() {
        let id = request["id"].clone();
        let name = request["params"]["name"].clone();
        server
            .send(&json!({"jsonrpc": "2.0", "id": id, "result": {"echo": name}}))
            .await;
    }

    let mut seen = Vec::new();
    for call in calls {
        let result = call.await.expect("task").expect("invoke");
        seen.push(result["echo"].as_str().expect("echo").to_string());
    }
    seen.sort();
    assert_eq!(seen, ["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn test_each_invoke_gets_its_matching_payload() {
    let (client, mut server) = connect();

    let first_client = client.clone();
    let first = tokio::spawn(async move {
        first_client
            .invoke::<Value>("test.first", json!({}))
            .await
    });
    let first_request = server.recv().await;

    let second_client = client.clone();
    let second = tokio::spawn(async move {
        second_client
            .invoke::<Value>("test.second", json!({}))
            .await
    });
    let second_request = server.recv().await;

    // Second reply first.
    server
        .send(&json!({
            "jsonrpc": "2.0",
            "id": second_request["id"],
            "result": {"for": "second"}
        }))
        .await;
    server
        .send(&json!({
            "jsonrpc": "2.0",
            "id": first_request["id"],
            "result": {"for": "first"}
        }))
        .await;

    assert_eq!(first.await.unwrap().unwrap()["for"], "first");
    assert_eq!(second.await.unwrap().unwrap()["for"], "second");
}

#[tokio::test]
async fn test_close_fails_all_pending_with_transport_error() {
    let (client, mut server) = connect();

    let mut calls = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        calls.push(tokio::spawn(
            async move { client.invoke::<Value>("test", json!({})).await },
        ));
    }
    for _ in 0..4 {
        server.recv().await;
    }

    client.close().await;

    for call in calls {
        let error = call.await.expect("task").expect_err("must fail on close");
        assert!(error.is_transport(), "expected transport error, got {error}");
    }
}

#[tokio::test]
async fn test_unknown_method_request_gets_method_not_found() {
    let (_client, mut server) = connect();

    server
        .send(&json!({"jsonrpc": "2.0", "id": 42, "method": "unknown.method", "params": {}}))
        .await;

    let reply = server.recv().await;
    assert_eq!(reply["jsonrpc"], "2.0");
    assert_eq!(reply["id"], 42);
    assert_eq!(reply["error"]["code"], -32601);
    assert!(
        reply["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Method not found")
    );
}

#[tokio::test]
async fn test_unknown_method_notification_gets_no_reply() {
    let (_client, mut server) = connect();

    server
        .send(&json!({"jsonrpc": "2.0", "method": "unknown.method", "params": {}}))
        .await;

    server.expect_silence().await;
}

#[tokio::test]
async fn test_error_reply_without_message_defaults() {
    let (client, mut server) = connect();

    let call_client = client.clone();
    let call =
        tokio::spawn(async move { call_client.invoke::<Value>("test", json!({})).await });
    let request = server.recv().await;
    server
        .send(&json!({"jsonrpc": "2.0", "id": request["id"], "error": {"code": -32600}}))
        .await;

    let error = call.await.unwrap().expect_err("server errored");
    match error {
        RpcError::Rpc { code, message, .. } => {
            assert_eq!(code, -32600);
            assert_eq!(message, "Unknown error");
        }
        other => panic!("expected Rpc error, got {other}"),
    }
}

#[tokio::test]
async fn test_error_reply_without_code_defaults() {
    let (client, mut server) = connect();

    let call_client = client.clone();
    let call =
        tokio::spawn(async move { call_client.invoke::<Value>("test", json!({})).await });
    let request = server.recv().await;
    server
        .send(
            &json!({"jsonrpc": "2.0", "id": request["id"], "error": {"message": "bad request"}}),
        )
        .await;

    let error = call.await.unwrap().expect_err("server errored");
    match error {
        RpcError::Rpc { code, message, .. } => {
            assert_eq!(code, -1);
            assert_eq!(message, "bad request");
        }
        other => panic!("expected Rpc error, got {other}"),
    }
}

#[tokio::test]
async fn test_handler_result_is_sent_as_reply() {
    let (client, mut server) = connect();

    client.register_method_handler(
        "echo.params",
        method_handler(|_id, params| async move { Ok(json!({ "echo": params })) }.boxed()),
    );

    server
        .send(&json!({"jsonrpc": "2.0", "id": 5, "method": "echo.params", "params": {"x": 1}}))
        .await;

    let reply = server.recv().await;
    assert_eq!(reply["id"], 5);
    assert_eq!(reply["result"]["echo"]["x"], 1);
    assert!(reply.get("error").is_none());
}

#[tokio::test]
async fn test_handler_error_with_id_reports_internal_error() {
    let (client, mut server) = connect();

    client.register_method_handler(
        "fail.method",
        method_handler(|_id, _params| {
            async move { Err(HandlerError::new("handler error")) }.boxed()
        }),
    );

    server
        .send(&json!({"jsonrpc": "2.0", "id": 7, "method": "fail.method", "params": {}}))
        .await;

    let reply = server.recv().await;
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["error"]["code"], -32603);
    assert_eq!(reply["error"]["message"], "handler error");
}

#[tokio::test]
async fn test_handler_error_without_id_is_swallowed() {
    let (client, mut server) = connect();

    client.register_method_handler(
        "fail.notify",
        method_handler(|_id, _params| {
            async move { Err(HandlerError::new("notify error")) }.boxed()
        }),
    );

    server
        .send(&json!({"jsonrpc": "2.0", "method": "fail.notify", "params": {}}))
        .await;

    server.expect_silence().await;
}

#[tokio::test]
async fn test_null_id_is_treated_as_notification() {
    let (client, mut server) = connect();

    let received: Arc<Mutex<Option<Option<RequestId>>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&received);
    client.register_method_handler(
        "test.null.id",
        method_handler(move |id, _params| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock().unwrap() = Some(id);
                Ok(Value::Null)
            }
            .boxed()
        }),
    );

    server
        .send(&json!({"jsonrpc": "2.0", "id": null, "method": "test.null.id", "params": {}}))
        .await;

    server.expect_silence().await;
    assert_eq!(*received.lock().unwrap(), Some(None));
}

#[tokio::test]
async fn test_malformed_frames_do_not_kill_the_stream() {
    let (client, mut server) = connect();

    // Invalid JSON, a frame with neither response nor method, and a response
    // for an id nobody asked about.
    server.send_raw(b"not valid json {{{").await;
    server.send(&json!({"jsonrpc": "2.0", "id": 1})).await;
    server
        .send(&json!({"jsonrpc": "2.0", "id": 99999, "result": {"ok": true}}))
        .await;

    // The engine must still be able to complete a normal round trip.
    let call_client = client.clone();
    let call =
        tokio::spawn(async move { call_client.invoke::<Value>("ping", json!({})).await });
    let request = server.recv().await;
    server
        .send(&json!({"jsonrpc": "2.0", "id": request["id"], "result": {"pong": true}}))
        .await;

    assert_eq!(call.await.unwrap().unwrap()["pong"], true);
}

#[tokio::test]
async fn test_invoke_unit_ignores_result_shape() {
    let (client, mut server) = connect();

    let call_client = client.clone();
    let call = tokio::spawn(async move { call_client.invoke_unit("test", json!({})).await });
    let request = server.recv().await;
    server
        .send(&json!({"jsonrpc": "2.0", "id": request["id"], "result": {"any": "thing"}}))
        .await;

    call.await.unwrap().expect("void call must accept any result");
}

#[tokio::test]
async fn test_decode_failure_is_distinct_from_rpc_error() {
    let (client, mut server) = connect();

    let call_client = client.clone();
    let call = tokio::spawn(async move { call_client.invoke::<i64>("test", json!({})).await });
    let request = server.recv().await;
    server
        .send(&json!({"jsonrpc": "2.0", "id": request["id"], "result": {"complex": "object"}}))
        .await;

    let error = call.await.unwrap().expect_err("integer cannot decode a map");
    assert!(matches!(error, RpcError::Decode(_)), "got {error}");
}

#[tokio::test]
async fn test_server_eof_fails_pending_and_disconnects() {
    let (client, mut server) = connect();

    let call_client = client.clone();
    let call =
        tokio::spawn(async move { call_client.invoke::<Value>("test", json!({})).await });
    server.recv().await;

    drop(server);

    let error = call.await.unwrap().expect_err("must fail on EOF");
    assert!(error.is_transport());

    // A fresh invoke is rejected outright once the loss is observed.
    let error = client
        .invoke::<Value>("test", json!({}))
        .await
        .expect_err("client is dead");
    assert!(error.is_transport());
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn test_child_process_connection_lifecycle() {
    let child = tokio::process::Command::new("cat")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .spawn()
        .expect("spawn cat");

    let client = RpcClient::from_child(child).expect("wrap child");
    assert!(client.is_connected().await);
    assert!(client.process_id().await.is_some());

    client.close().await;
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn test_socket_connection_has_no_process() {
    let (client, _server) = connect();
    assert!(client.process_id().await.is_none());
}

#[tokio::test]
async fn test_notify_carries_no_id() {
    let (client, mut server) = connect();

    client
        .notify("test.method", json!({"key": "value"}))
        .await
        .expect("notify");

    let frame = server.recv().await;
    assert_eq!(frame["jsonrpc"], "2.0");
    assert_eq!(frame["method"], "test.method");
    assert_eq!(frame["params"]["key"], "value");
    assert!(frame.get("id").is_none());
}
