//! Integration tests for outbox-client.
//!
//! The persistent-transport scenarios drive a real [`IpcChannel`] over
//! an in-memory duplex pipe: the test plays the server, writing
//! envelope lines in and reading the client's replies out. The HTTP
//! scenarios drive the webhook router directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

use outbox_client::channel::IpcRole;
use outbox_client::heartbeat::Liveness;
use outbox_client::{
    Client, ClientConfig, Envelope, HttpChannel, IpcChannel, OutboxError, TransportKind,
};

/// The test's view of the peer: write envelopes in, read replies out.
struct Peer {
    to_client: DuplexStream,
    from_client: DuplexStream,
}

impl Peer {
    async fn send(&mut self, value: Value) {
        let line = value.to_string();
        self.to_client.write_all(line.as_bytes()).await.unwrap();
        self.to_client.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> Envelope {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.from_client.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        serde_json::from_slice(&line).unwrap()
    }

    /// Expect silence on the wire for the given window.
    async fn expect_quiet(&mut self, window: Duration) {
        let read = tokio::time::timeout(window, self.recv()).await;
        assert!(read.is_err(), "unexpected outbound frame: {read:?}");
    }
}

/// A connected client over an in-memory pipe, with the peer's ends.
async fn connect(config: ClientConfig) -> (Client, Peer) {
    let liveness = Liveness::new(config.heartbeat.timeout);
    let (to_client, client_reader) = tokio::io::duplex(1 << 20);
    let (client_writer, from_client) = tokio::io::duplex(1 << 20);

    let channel = Arc::new(IpcChannel::from_io(
        client_reader,
        client_writer,
        IpcRole::Child,
        liveness.clone(),
    ));
    let client = Client::with_channel(channel, config, liveness).await.unwrap();

    (
        client,
        Peer {
            to_client,
            from_client,
        },
    )
}

/// Subscribe a handler that records each event's `payload.n`.
fn subscribe_recorder(client: &Client, event_type: &str) -> Arc<Mutex<Vec<i64>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client
        .subscribe(event_type, move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().await.push(event.payload["n"].as_i64().unwrap_or(-1));
                Ok(())
            }
        })
        .unwrap();
    seen
}

fn batch_envelope(action: &str, events: Value) -> Value {
    json!({ "action": action, "payload": { "events": events } })
}

/// S1: happy-path batch on a persistent transport. The handler sees the
/// events in order and the next outbound frame is the full-range ACK.
#[tokio::test]
async fn happy_path_batch_acks_in_order() {
    let (client, mut peer) = connect(ClientConfig::new(TransportKind::IpcChild)).await;
    let seen = subscribe_recorder(&client, "A");

    peer.send(batch_envelope(
        "outbox.stream.batch",
        json!([
            { "eventType": "A", "payload": { "n": 1 } },
            { "eventType": "A", "payload": { "n": 2 } }
        ]),
    ))
    .await;

    let ack = peer.recv().await;
    assert_eq!(ack.action, "outbox.stream.ack");
    assert_eq!(ack.payload["ok"], true);
    assert_eq!(ack.payload["okIndices"], json!([0, 1]));
    assert_eq!(*seen.lock().await, vec![1, 2]);

    client.close().await;
}

/// S2: cross-type parallelism with per-type ordering. Three 100 ms `A`
/// events and two 10 ms `B` events take ~300 ms overall, not 320 ms.
#[tokio::test]
async fn cross_type_parallelism_preserves_per_type_order() {
    let (client, mut peer) = connect(ClientConfig::new(TransportKind::IpcChild)).await;

    let order_a = Arc::new(Mutex::new(Vec::new()));
    let order_b = Arc::new(Mutex::new(Vec::new()));
    {
        let order_a = order_a.clone();
        client
            .subscribe("A", move |event| {
                let order_a = order_a.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    order_a.lock().await.push(event.payload["n"].as_i64().unwrap());
                    Ok(())
                }
            })
            .unwrap();
    }
    {
        let order_b = order_b.clone();
        client
            .subscribe("B", move |event| {
                let order_b = order_b.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    order_b.lock().await.push(event.payload["n"].as_i64().unwrap());
                    Ok(())
                }
            })
            .unwrap();
    }

    let start = Instant::now();
    peer.send(batch_envelope(
        "outbox.stream.batch",
        json!([
            { "eventType": "A", "payload": { "n": 1 } },
            { "eventType": "B", "payload": { "n": 1 } },
            { "eventType": "A", "payload": { "n": 2 } },
            { "eventType": "B", "payload": { "n": 2 } },
            { "eventType": "A", "payload": { "n": 3 } }
        ]),
    ))
    .await;

    let ack = peer.recv().await;
    let elapsed = start.elapsed();

    assert_eq!(ack.payload["okIndices"], json!([0, 1, 2, 3, 4]));
    assert_eq!(*order_a.lock().await, vec![1, 2, 3]);
    assert_eq!(*order_b.lock().await, vec![1, 2]);
    // Groups overlap: the wall clock tracks the slow group alone.
    assert!(elapsed >= Duration::from_millis(295), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(420), "took {elapsed:?}");

    client.close().await;
}

/// S3: a handler slower than the batch deadline suppresses the ACK.
#[tokio::test]
async fn deadline_expiry_suppresses_ack() {
    let mut config = ClientConfig::new(TransportKind::IpcChild);
    config.process_timeout = Duration::from_millis(5);
    let (client, mut peer) = connect(config).await;

    client
        .subscribe("SLOW", |_event| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        })
        .unwrap();

    peer.send(batch_envelope(
        "outbox.stream.batch",
        json!([{ "eventType": "SLOW", "payload": {} }]),
    ))
    .await;

    peer.expect_quiet(Duration::from_millis(60)).await;
    client.close().await;
}

/// S4: single-flight violation on the socket policy. The second query
/// fails fast while the first is pending, and the first still resolves.
#[tokio::test]
async fn single_flight_rejects_second_query() {
    let mut config = ClientConfig::new(TransportKind::Ws);
    config.query_timeout = Duration::from_secs(2);
    let (client, mut peer) = connect(config).await;
    let client = Arc::new(client);

    // Handshake first: queries are gated until a Ping/Pong exchange.
    peer.send(json!({ "action": "ping" })).await;
    let pong = peer.recv().await;
    assert_eq!(pong.action, "pong");

    let first_client = client.clone();
    let first = tokio::spawn(async move { first_client.query("A", None).await });

    // The first query is on the wire and pending.
    let request = peer.recv().await;
    assert_eq!(request.action, "query.request");
    let request_id = request.request_id.clone().unwrap();

    let second = client.query("B", None).await;
    assert!(matches!(second, Err(OutboxError::QueryInFlight)));

    peer.send(json!({
        "action": "query.response",
        "requestId": request_id,
        "payload": { "ok": true, "data": { "answer": 1 } }
    }))
    .await;

    let resolved = first.await.unwrap().unwrap();
    assert_eq!(resolved, Some(json!({ "answer": 1 })));

    client.close().await;
}

/// S5: an inbound Ping is answered with a Pong carrying the configured
/// token as password.
#[tokio::test]
async fn ping_reply_carries_password() {
    let mut config = ClientConfig::new(TransportKind::IpcChild);
    config.token = Some("pw".into());
    let (client, mut peer) = connect(config).await;

    peer.send(json!({ "action": "ping" })).await;

    let pong = peer.recv().await;
    assert_eq!(pong.action, "pong");
    assert_eq!(pong.payload["password"], "pw");

    client.close().await;
}

/// S6: webhook auth on the HTTP transport. No token means 401 and no
/// handler runs; the right token processes the batch and returns the
/// ACK envelope.
#[tokio::test]
async fn http_webhook_auth_and_ack() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let mut config = ClientConfig::new(TransportKind::Http);
    config.base_url = Some("http://127.0.0.1:0".into());
    config.token = Some("t".into());

    let channel = HttpChannel::new(&config).unwrap();
    let router = channel.router();
    let liveness = Liveness::new(config.heartbeat.timeout);
    let client = Client::with_channel(Arc::new(channel), config, liveness)
        .await
        .unwrap();

    let seen = subscribe_recorder(&client, "A");

    let body = json!({
        "action": "outbox.stream.batch",
        "payload": { "events": [{ "eventType": "A", "payload": { "n": 5 } }] }
    })
    .to_string();

    // Unauthenticated delivery is rejected before any handler runs.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/outbox/stream")
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(seen.lock().await.is_empty());

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/outbox/stream")
                .header("x-transport-token", "t")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let ack: Envelope = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(ack.action, "outbox.stream.ack");
    assert_eq!(ack.payload["ok"], true);
    assert_eq!(*seen.lock().await, vec![5]);

    client.close().await;
}

/// ACK style mirrors the batch style: camel in, camel out.
#[tokio::test]
async fn ack_style_mirrors_camel_batch() {
    let (client, mut peer) = connect(ClientConfig::new(TransportKind::IpcChild)).await;

    peer.send(batch_envelope(
        "outboxStreamBatch",
        json!([{ "eventType": "X", "payload": {} }]),
    ))
    .await;

    let ack = peer.recv().await;
    assert_eq!(ack.action, "outboxStreamAck");
    assert_eq!(ack.payload["okIndices"], json!([0]));

    client.close().await;
}

/// An IPC batch carrying a correlationId gets it echoed on the ACK.
#[tokio::test]
async fn ack_echoes_batch_correlation_id() {
    let (client, mut peer) = connect(ClientConfig::new(TransportKind::IpcChild)).await;

    peer.send(json!({
        "action": "outbox.stream.batch",
        "correlationId": "corr-7",
        "payload": { "events": [] }
    }))
    .await;

    let ack = peer.recv().await;
    assert_eq!(ack.action, "outbox.stream.ack");
    assert_eq!(ack.correlation_id.as_deref(), Some("corr-7"));

    client.close().await;
}

/// Batches are server-driven and bypass the handshake gate; a client
/// that never saw a Pong still processes and acknowledges them.
#[tokio::test]
async fn batches_processed_before_handshake() {
    let (client, mut peer) = connect(ClientConfig::new(TransportKind::IpcChild)).await;
    let seen = subscribe_recorder(&client, "A");

    assert!(!client.is_ready());
    peer.send(batch_envelope(
        "outbox.stream.batch",
        json!([{ "eventType": "A", "payload": { "n": 9 } }]),
    ))
    .await;

    let ack = peer.recv().await;
    assert_eq!(ack.payload["ok"], true);
    assert_eq!(*seen.lock().await, vec![9]);

    client.close().await;
}

/// Queries stay gated until the handshake; without one they fail with
/// NotConnected once the gate deadline passes.
#[tokio::test]
async fn query_gated_until_handshake() {
    let mut config = ClientConfig::new(TransportKind::IpcChild);
    config.connection_timeout = Duration::from_millis(100);
    let (client, _peer) = connect(config).await;

    let result = client.query("Early", None).await;
    assert!(matches!(result, Err(OutboxError::NotConnected)));

    client.close().await;
}

/// Parallel queries on the process channel: correlation by
/// correlationId, responses matched even when they come back out of
/// order, requestId still present on the wire.
#[tokio::test]
async fn parallel_ipc_queries_resolve_out_of_order() {
    let mut config = ClientConfig::new(TransportKind::IpcChild);
    config.query_timeout = Duration::from_secs(2);
    let (client, mut peer) = connect(config).await;
    let client = Arc::new(client);

    peer.send(json!({ "action": "ping" })).await;
    assert_eq!(peer.recv().await.action, "pong");

    let first_client = client.clone();
    let first = tokio::spawn(async move { first_client.query("First", None).await });
    let second_client = client.clone();
    let second = tokio::spawn(async move { second_client.query("Second", None).await });

    let request_a = peer.recv().await;
    let request_b = peer.recv().await;
    assert!(request_a.request_id.is_some());
    assert!(request_b.request_id.is_some());

    // Answer in reverse arrival order.
    for request in [&request_b, &request_a] {
        let name = request.payload["name"].as_str().unwrap().to_string();
        peer.send(json!({
            "action": "query.response",
            "correlationId": request.correlation_id.clone().unwrap(),
            "payload": { "ok": true, "data": name }
        }))
        .await;
    }

    assert_eq!(first.await.unwrap().unwrap(), Some(json!("First")));
    assert_eq!(second.await.unwrap().unwrap(), Some(json!("Second")));

    client.close().await;
}

/// Pipelined batches are processed in arrival order, each ACK emitted
/// only after that batch's handlers complete.
#[tokio::test]
async fn pipelined_batches_ack_in_arrival_order() {
    let (client, mut peer) = connect(ClientConfig::new(TransportKind::IpcChild)).await;
    let seen = subscribe_recorder(&client, "A");

    peer.send(json!({
        "action": "outbox.stream.batch",
        "payload": {
            "streamId": "s",
            "fromOffset": 0,
            "toOffset": 1,
            "events": [
                { "eventType": "A", "payload": { "n": 1 } },
                { "eventType": "A", "payload": { "n": 2 } }
            ]
        }
    }))
    .await;
    peer.send(json!({
        "action": "outbox.stream.batch",
        "payload": {
            "streamId": "s",
            "fromOffset": 2,
            "toOffset": 3,
            "events": [
                { "eventType": "A", "payload": { "n": 3 } },
                { "eventType": "A", "payload": { "n": 4 } }
            ]
        }
    }))
    .await;

    let first_ack = peer.recv().await;
    let second_ack = peer.recv().await;
    assert_eq!(first_ack.payload["ackFromOffset"], 0);
    assert_eq!(second_ack.payload["ackFromOffset"], 2);
    assert_eq!(*seen.lock().await, vec![1, 2, 3, 4]);

    client.close().await;
}

/// A handler failure suppresses the ACK for that batch, and the next
/// delivery of the same batch is processed again (at-least-once).
#[tokio::test]
async fn failed_batch_is_silent_then_reprocessed() {
    let (client, mut peer) = connect(ClientConfig::new(TransportKind::IpcChild)).await;

    let attempts = Arc::new(Mutex::new(0u32));
    {
        let attempts = attempts.clone();
        client
            .subscribe("A", move |_event| {
                let attempts = attempts.clone();
                async move {
                    let mut attempts = attempts.lock().await;
                    *attempts += 1;
                    if *attempts == 1 {
                        Err("first delivery fails".into())
                    } else {
                        Ok(())
                    }
                }
            })
            .unwrap();
    }

    let batch = batch_envelope(
        "outbox.stream.batch",
        json!([{ "eventType": "A", "payload": { "n": 1 } }]),
    );
    peer.send(batch.clone()).await;
    peer.expect_quiet(Duration::from_millis(50)).await;

    // Server retransmits; the idempotent handler succeeds this time.
    peer.send(batch).await;
    let ack = peer.recv().await;
    assert_eq!(ack.payload["ok"], true);
    assert_eq!(*attempts.lock().await, 2);

    client.close().await;
}

/// Closing the client drops the transport: the peer sees EOF.
#[tokio::test]
async fn close_tears_down_transport() {
    let (client, mut peer) = connect(ClientConfig::new(TransportKind::IpcChild)).await;

    client.close().await;

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_millis(500), peer.from_client.read(&mut buf))
        .await
        .expect("peer should observe EOF");
    assert_eq!(read.unwrap(), 0);
}
