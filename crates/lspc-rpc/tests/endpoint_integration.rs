//! Integration tests for `RpcEndpoint` over in-memory pipes.
//!
//! Each test wires the endpoint to a scripted peer through
//! `tokio::io::duplex`, so everything the endpoint writes can be decoded
//! and inspected, and inbound traffic can be chunked arbitrarily.

use futures_util::StreamExt;
use lspc_rpc::{FrameStream, RequestId, ResponseError, RpcEndpoint, RpcError, encode_frame};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Scripted peer
// ---------------------------------------------------------------------------

/// The server side of the pipe.
struct Peer {
    frames: FrameStream<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Peer {
    /// Send one framed message to the endpoint.
    async fn send(&mut self, message: Value) {
        let payload = serde_json::to_vec(&message).unwrap();
        self.writer.write_all(&encode_frame(&payload)).await.unwrap();
    }

    /// Send raw bytes, for chunking and corruption tests.
    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Read the next message the endpoint wrote.
    async fn recv(&mut self) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.frames.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("endpoint closed its writer")
            .expect("endpoint wrote a bad frame");
        serde_json::from_slice(frame.as_bytes()).unwrap()
    }
}

/// An endpoint with no reader attached yet, plus its peer and read half.
fn pipe() -> (RpcEndpoint, ReadHalf<DuplexStream>, Peer) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);
    let endpoint = RpcEndpoint::new(client_write);
    let peer = Peer {
        frames: FrameStream::new(server_read),
        writer: server_write,
    };
    (endpoint, client_read, peer)
}

/// An endpoint that is already reading.
fn connected() -> (RpcEndpoint, Peer) {
    let (endpoint, reader, peer) = pipe();
    endpoint.attach(reader).unwrap();
    (endpoint, peer)
}

fn collect_errors(endpoint: &RpcEndpoint) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    endpoint.on_error(move |e| {
        let _ = tx.send(e.to_string());
    });
    rx
}

// ---------------------------------------------------------------------------
// Outbound wire format
// ---------------------------------------------------------------------------

#[tokio::test]
async fn request_is_framed_with_first_id_zero() {
    let (endpoint, mut peer) = connected();
    let params = json!({"param1": "value1", "param2": {"subParam1": "subValue1"}});

    let ep = endpoint.clone();
    let sent = params.clone();
    tokio::spawn(async move { ep.call::<Value>("someMethod", sent).await });

    let request = peer.recv().await;
    assert_eq!(
        request,
        json!({"jsonrpc": "2.0", "id": 0, "method": "someMethod", "params": params})
    );
}

#[tokio::test]
async fn notification_has_no_id_and_consumes_none() {
    let (endpoint, mut peer) = connected();

    endpoint.notify("initialized", json!({})).await.unwrap();
    let notification = peer.recv().await;
    assert_eq!(notification, json!({"jsonrpc": "2.0", "method": "initialized", "params": {}}));

    let ep = endpoint.clone();
    tokio::spawn(async move { ep.call::<Value>("shutdown", ()).await });
    let request = peer.recv().await;
    assert_eq!(request["id"], 0);
    assert!(request.get("params").is_none());
}

#[tokio::test]
async fn emoji_payload_uses_byte_length() {
    let (client_io, mut server_io) = tokio::io::duplex(64 * 1024);
    let (_client_read, client_write) = tokio::io::split(client_io);
    let endpoint = RpcEndpoint::new(client_write);

    let params = json!({"param1": "value1😀", "param2": {"subParam1": "subValue1🎉"}});
    endpoint.notify("someMethod", params.clone()).await.unwrap();
    drop(endpoint);

    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = tokio::io::AsyncReadExt::read(&mut server_io, &mut buf).await.unwrap();
        raw.extend_from_slice(&buf[..n]);
        if raw.windows(4).any(|w| w == b"\r\n\r\n") {
            let text = String::from_utf8(raw.clone()).unwrap();
            let (header, body) = text.split_once("\r\n\r\n").unwrap();
            let declared: usize = header.trim_start_matches("Content-Length: ").parse().unwrap();
            if body.len() >= declared {
                assert_eq!(body.len(), declared);
                assert!(body.chars().count() < declared);
                let value: Value = serde_json::from_str(body).unwrap();
                assert_eq!(value["params"], params);
                return;
            }
        }
        assert!(n > 0, "stream ended before the full frame arrived");
    }
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn call_resolves_with_matching_result() {
    let (endpoint, mut peer) = connected();

    let ep = endpoint.clone();
    let call = tokio::spawn(async move { ep.call::<Value>("someMethod", json!({"a": 1})).await });

    let request = peer.recv().await;
    peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"responseParam1": "resValue1"}}))
        .await;

    let result = call.await.unwrap().unwrap();
    assert_eq!(result, json!({"responseParam1": "resValue1"}));
    assert_eq!(endpoint.pending_count(), 0);
}

#[tokio::test]
async fn error_response_rejects_call() {
    let (endpoint, mut peer) = connected();

    let ep = endpoint.clone();
    let call = tokio::spawn(async move { ep.call::<Value>("textDocument/hover", ()).await });

    let request = peer.recv().await;
    peer.send(json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "error": {"code": -32601, "message": "Method not found"}
    }))
    .await;

    match call.await.unwrap() {
        Err(RpcError::Remote(err)) => {
            assert_eq!(err.code, -32601);
            assert_eq!(err.message, "Method not found");
        }
        other => panic!("Expected Remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn out_of_order_responses_reach_the_right_callers() {
    let (endpoint, mut peer) = connected();

    let mut calls = Vec::new();
    for method in ["first", "second", "third"] {
        let ep = endpoint.clone();
        calls.push(tokio::spawn(async move { ep.call::<String>(method, ()).await }));
    }

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(peer.recv().await);
    }
    for request in requests.iter().rev() {
        peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": request["method"]}))
            .await;
    }

    let mut results = Vec::new();
    for call in calls {
        results.push(call.await.unwrap().unwrap());
    }
    assert_eq!(results, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn concurrent_calls_get_distinct_ids() {
    let (endpoint, mut peer) = connected();

    for _ in 0..20 {
        let ep = endpoint.clone();
        tokio::spawn(async move { ep.call::<Value>("ping", ()).await });
    }

    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(peer.recv().await["id"].as_i64().unwrap());
    }
    ids.sort_unstable();
    assert_eq!(ids, (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn unmatched_response_is_reported_and_leaves_pending_calls_alone() {
    let (endpoint, mut peer) = connected();
    let mut errors = collect_errors(&endpoint);

    let ep = endpoint.clone();
    let call = tokio::spawn(async move { ep.call::<Value>("someMethod", ()).await });
    let request = peer.recv().await;

    peer.send(json!({"jsonrpc": "2.0", "id": 10, "result": {"responseParam1": "resValue1"}}))
        .await;
    let error = errors.recv().await.unwrap();
    assert!(error.contains("got 10"), "{error}");
    assert!(error.contains("[0]"), "{error}");
    assert_eq!(endpoint.pending_count(), 1);

    peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": 42})).await;
    assert_eq!(call.await.unwrap().unwrap(), json!(42));
}

// ---------------------------------------------------------------------------
// Peer requests and notifications
// ---------------------------------------------------------------------------

#[tokio::test]
async fn notification_reaches_subscriber() {
    let (endpoint, reader, mut peer) = pipe();
    let event = endpoint.once("telemetry/event");
    endpoint.attach(reader).unwrap();

    let params = json!({"properties": {"Feature": "ApexPrelude-startup"}, "measures": {"ExecutionTime": 2673}});
    peer.send(json!({"jsonrpc": "2.0", "method": "telemetry/event", "params": params}))
        .await;

    let incoming = event.await.unwrap();
    assert_eq!(incoming.id, None);
    assert_eq!(incoming.params, Some(params));
}

#[tokio::test]
async fn peer_request_interleaved_with_pending_call() {
    let (endpoint, reader, mut peer) = pipe();

    // Reply to configuration requests from a spawned task.
    let responder = endpoint.clone();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    endpoint.on("workspace/configuration", move |incoming| {
        let Some(id) = incoming.id.clone() else {
            return;
        };
        let _ = seen_tx.send((id.clone(), incoming.params.clone()));
        let responder = responder.clone();
        tokio::spawn(async move {
            let config = json!([{"settings": {"typescript": {"format": {"enable": true}}}}]);
            responder.respond(id, config).await.unwrap();
        });
    });
    endpoint.attach(reader).unwrap();

    let ep = endpoint.clone();
    let shutdown = tokio::spawn(async move { ep.call::<Value>("shutdown", ()).await });
    let request = peer.recv().await;
    assert_eq!(request["id"], 0);

    let params = json!({"items": [{"section": "typescript"}]});
    peer.send(json!({"jsonrpc": "2.0", "id": 100, "method": "workspace/configuration", "params": params}))
        .await;

    let (id, seen_params) = seen_rx.recv().await.unwrap();
    assert_eq!(id, RequestId::Number(100));
    assert_eq!(seen_params, Some(params));

    let reply = peer.recv().await;
    assert_eq!(
        reply,
        json!({
            "jsonrpc": "2.0",
            "id": 100,
            "result": [{"settings": {"typescript": {"format": {"enable": true}}}}]
        })
    );
    assert_eq!(endpoint.pending_count(), 1);

    peer.send(json!({"jsonrpc": "2.0", "id": 0, "result": {}})).await;
    assert_eq!(shutdown.await.unwrap().unwrap(), json!({}));
}

#[tokio::test]
async fn multiple_peer_requests_each_get_a_reply() {
    let (endpoint, reader, mut peer) = pipe();
    let responder = endpoint.clone();
    endpoint.on("workspace/configuration", move |incoming| {
        let responder = responder.clone();
        let id = incoming.id.clone().unwrap();
        tokio::spawn(async move { responder.respond(id, json!([null])).await.unwrap() });
    });
    endpoint.attach(reader).unwrap();

    for id in [200, 201] {
        peer.send(json!({"jsonrpc": "2.0", "id": id, "method": "workspace/configuration", "params": {"items": [{}]}}))
            .await;
    }

    let mut ids = vec![peer.recv().await["id"].clone(), peer.recv().await["id"].clone()];
    ids.sort_by_key(|v| v.as_i64());
    assert_eq!(ids, vec![json!(200), json!(201)]);
}

#[tokio::test]
async fn respond_error_writes_error_object() {
    let (endpoint, mut peer) = connected();
    endpoint
        .respond_error("abc".into(), ResponseError::method_not_found("window/showDocument"))
        .await
        .unwrap();
    let reply = peer.recv().await;
    assert_eq!(reply["id"], "abc");
    assert_eq!(reply["error"]["code"], -32601);
}

// ---------------------------------------------------------------------------
// Chunking and framing failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inbound_frames_split_across_writes() {
    let (endpoint, reader, mut peer) = pipe();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    endpoint.on("$/progress", move |incoming| {
        seen2.lock().unwrap().push(incoming.params.clone().unwrap());
    });
    let done = endpoint.once("done");
    endpoint.attach(reader).unwrap();

    let mut bytes = Vec::new();
    for n in 0..3 {
        let payload = serde_json::to_vec(&json!({"method": "$/progress", "params": {"n": n, "s": "ü"}})).unwrap();
        bytes.extend_from_slice(&encode_frame(&payload));
    }
    bytes.extend_from_slice(&encode_frame(br#"{"method":"done"}"#));

    for chunk in bytes.chunks(7) {
        peer.send_raw(chunk).await;
        tokio::task::yield_now().await;
    }
    done.await.unwrap();

    let seen = seen.lock().unwrap();
    let ns: Vec<i64> = seen.iter().map(|p| p["n"].as_i64().unwrap()).collect();
    assert_eq!(ns, vec![0, 1, 2]);
}

#[tokio::test]
async fn bad_header_reports_error_and_rejects_pending_calls() {
    let (endpoint, mut peer) = connected();
    let mut errors = collect_errors(&endpoint);

    let ep = endpoint.clone();
    let call = tokio::spawn(async move { ep.call::<Value>("initialize", json!({})).await });
    peer.recv().await;

    peer.send_raw(b"Content-Length: invalid\r\n\r\n{}").await;

    let error = errors.recv().await.unwrap();
    assert!(error.contains("Bad header"), "{error}");
    assert!(matches!(call.await.unwrap(), Err(RpcError::ConnectionClosed)));
    assert!(endpoint.is_closed());
}

#[tokio::test]
async fn eof_rejects_pending_calls() {
    let (endpoint, mut peer) = connected();

    let ep = endpoint.clone();
    let call = tokio::spawn(async move { ep.call::<Value>("shutdown", ()).await });
    peer.recv().await;
    drop(peer);

    assert!(matches!(call.await.unwrap(), Err(RpcError::ConnectionClosed)));
}

#[tokio::test]
async fn write_failure_surfaces_to_the_caller() {
    let (client_io, server_io) = tokio::io::duplex(64);
    drop(server_io);
    let endpoint = RpcEndpoint::new(client_io);

    let result = endpoint.call::<Value>("initialize", json!({})).await;
    assert!(matches!(result, Err(RpcError::Io(_))), "{result:?}");
    assert_eq!(endpoint.pending_count(), 0);

    let result = endpoint.notify("exit", ()).await;
    assert!(matches!(result, Err(RpcError::Io(_))));
}

#[tokio::test]
async fn close_stops_reading_and_rejects_pending() {
    let (endpoint, mut peer) = connected();
    let ep = endpoint.clone();
    let call = tokio::spawn(async move { ep.call::<Value>("workspace/symbol", json!({"query": ""})).await });
    peer.recv().await;

    endpoint.close().await.unwrap();
    assert!(matches!(call.await.unwrap(), Err(RpcError::ConnectionClosed)));
    assert!(endpoint.is_closed());
}
