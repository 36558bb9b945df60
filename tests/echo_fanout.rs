//! End-to-end tests driving the server over real sockets with a real
//! WebSocket client.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use ws_fanout::config::Config;
use ws_fanout::protocol::now_millis;
use ws_fanout::server::Server;

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(write_factor: usize) -> Config {
    Config {
        listen: "127.0.0.1:0".to_string(),
        write_factor,
        max_backpressure: 256 * 1024,
        workers: None,
        log_level: "info".to_string(),
    }
}

/// Bind to an ephemeral port, run the server in the background, and return
/// the address clients should dial.
async fn start_server(config: Config) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        let server = Server::new(config);
        let _ = server.serve(listener).await;
    });

    addr
}

async fn connect(addr: SocketAddr) -> WsClient {
    let url = format!("ws://{}/", addr);
    let (ws_stream, _response) = connect_async(url.as_str()).await.expect("connect");
    ws_stream
}

async fn recv_frame(client: &mut WsClient) -> Message {
    timeout(RECV_TIMEOUT, client.next())
        .await
        .expect("timed out waiting for a reply")
        .expect("stream ended")
        .expect("read frame")
}

async fn recv_json(client: &mut WsClient) -> Value {
    match recv_frame(client).await {
        Message::Text(text) => serde_json::from_str(&text).expect("reply is JSON"),
        other => panic!("expected text frame, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_message_produces_write_factor_replies() {
    let addr = start_server(test_config(4)).await;
    let mut client = connect(addr).await;

    let sent_at = now_millis();
    let inbound = json!({
        "client_id": "c1",
        "msg_id": 1,
        "msg": "hi",
        "created_at": sent_at,
    });
    client
        .send(Message::Text(inbound.to_string()))
        .await
        .expect("send");

    let mut replies = Vec::new();
    for _ in 0..4 {
        replies.push(recv_json(&mut client).await);
    }

    for reply in &replies {
        assert_eq!(reply["client_id"], json!("c1"));
        assert_eq!(reply["msg_id"], json!(1));
        assert_eq!(reply["msg"], json!("hi"));
        assert_eq!(reply["client_ts"], json!(sent_at));

        // One clock capture per batch: the reported latency is exactly
        // server receipt time minus client send time.
        let server_ts = reply["created_at"].as_i64().expect("created_at");
        let latency = reply["server_latency"].as_i64().expect("server_latency");
        assert_eq!(latency, server_ts - sent_at);
        assert!(latency >= 0, "same-host clock should not run backwards");
    }

    // All duplicates are identical, down to the timestamp
    assert!(replies.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_factor_is_configurable() {
    let addr = start_server(test_config(2)).await;
    let mut client = connect(addr).await;

    let first = json!({
        "client_id": "c1",
        "msg_id": 1,
        "msg": "a",
        "created_at": now_millis(),
    });
    client
        .send(Message::Text(first.to_string()))
        .await
        .expect("send");

    for _ in 0..2 {
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["msg_id"], json!(1));
    }

    // The next frame on the wire belongs to the next batch, proving the
    // first batch had exactly two replies.
    let second = json!({
        "client_id": "c1",
        "msg_id": 2,
        "msg": "b",
        "created_at": now_millis(),
    });
    client
        .send(Message::Text(second.to_string()))
        .await
        .expect("send");

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["msg_id"], json!(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batches_are_independent() {
    let addr = start_server(test_config(4)).await;
    let mut client = connect(addr).await;

    for (msg_id, payload) in [(1, "first"), (2, "second")] {
        let inbound = json!({
            "client_id": "c1",
            "msg_id": msg_id,
            "msg": payload,
            "created_at": now_millis(),
        });
        client
            .send(Message::Text(inbound.to_string()))
            .await
            .expect("send");

        for _ in 0..4 {
            let reply = recv_json(&mut client).await;
            assert_eq!(reply["msg_id"], json!(msg_id));
            assert_eq!(reply["msg"], json!(payload));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binary_frames_echo_as_binary() {
    let addr = start_server(test_config(4)).await;
    let mut client = connect(addr).await;

    let inbound = json!({
        "client_id": 7,
        "msg_id": 3,
        "msg": "payload",
        "created_at": now_millis(),
    });
    client
        .send(Message::Binary(inbound.to_string().into_bytes()))
        .await
        .expect("send");

    for _ in 0..4 {
        match recv_frame(&mut client).await {
            Message::Binary(data) => {
                let reply: Value = serde_json::from_slice(&data).expect("reply is JSON");
                assert_eq!(reply["client_id"], json!(7));
                assert_eq!(reply["msg"], json!("payload"));
            }
            other => panic!("expected binary frame, got {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_message_closes_connection_with_no_replies() {
    let addr = start_server(test_config(4)).await;
    let mut client = connect(addr).await;

    client
        .send(Message::Text("{not json".to_string()))
        .await
        .expect("send");

    // No echo frames come back; the connection just ends.
    let next = timeout(RECV_TIMEOUT, client.next())
        .await
        .expect("timed out waiting for the connection to close");
    match next {
        None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {}
        Some(Ok(frame)) => panic!("expected the connection to close, got {:?}", frame),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_created_at_closes_connection() {
    let addr = start_server(test_config(4)).await;
    let mut client = connect(addr).await;

    let inbound = json!({
        "client_id": "c1",
        "msg_id": 1,
        "msg": "hi",
    });
    client
        .send(Message::Text(inbound.to_string()))
        .await
        .expect("send");

    let next = timeout(RECV_TIMEOUT, client.next())
        .await
        .expect("timed out waiting for the connection to close");
    match next {
        None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {}
        Some(Ok(frame)) => panic!("expected the connection to close, got {:?}", frame),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connections_do_not_share_state() {
    let addr = start_server(test_config(4)).await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    let from_alice = json!({
        "client_id": "alice",
        "msg_id": 1,
        "msg": "a",
        "created_at": now_millis(),
    });
    let from_bob = json!({
        "client_id": "bob",
        "msg_id": 1,
        "msg": "b",
        "created_at": now_millis(),
    });

    alice
        .send(Message::Text(from_alice.to_string()))
        .await
        .expect("send");
    bob.send(Message::Text(from_bob.to_string()))
        .await
        .expect("send");

    for _ in 0..4 {
        let reply = recv_json(&mut alice).await;
        assert_eq!(reply["client_id"], json!("alice"));
    }
    for _ in 0..4 {
        let reply = recv_json(&mut bob).await;
        assert_eq!(reply["client_id"], json!("bob"));
    }
}
