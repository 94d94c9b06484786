use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, client_async};

use crate::broker::{Broker, DestinationName};
use crate::config::Settings;
use crate::transport::message::ServerMessage;
use crate::transport::websocket::serve;

type Ws = WebSocketStream<TcpStream>;

async fn setup_server() -> (String, Arc<Broker>) {
    let broker = Broker::in_memory(&Settings::default());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(serve(listener, Arc::clone(&broker)));
    (addr, broker)
}

async fn open(addr: &str, path: &str) -> Ws {
    let stream = TcpStream::connect(addr).await.expect("Failed to connect");
    let (ws, _) = client_async(format!("ws://{addr}{path}"), stream)
        .await
        .expect("WebSocket handshake failed");
    ws
}

async fn connect(addr: &str) -> (Ws, String) {
    connect_at(addr, "/").await
}

async fn connect_at(addr: &str, path: &str) -> (Ws, String) {
    let mut ws = open(addr, path).await;
    match next(&mut ws).await {
        ServerMessage::Connected { client_id } => (ws, client_id),
        other => panic!("Expected Connected, got {:?}", other),
    }
}

async fn wait_for_clients(broker: &Broker, clients: usize) {
    for _ in 0..100 {
        if broker.stats().clients == clients {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Expected {clients} connected clients, got {}", broker.stats().clients);
}

async fn send(ws: &mut Ws, frame: serde_json::Value) {
    ws.send(WsMessage::Text(frame.to_string().into()))
        .await
        .expect("Failed to send frame");
}

async fn next(ws: &mut Ws) -> ServerMessage {
    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("Timed out waiting for a frame")
        .expect("Connection closed")
        .expect("Read error");
    let raw = frame.into_data();
    serde_json::from_slice(&raw)
        .unwrap_or_else(|e| panic!("Failed to deserialize ServerMessage from {:?}: {}", raw, e))
}

#[tokio::test]
async fn test_connected_frame_carries_client_id() {
    let (addr, _broker) = setup_server().await;
    let (_ws, client_id) = connect(&addr).await;
    assert!(client_id.starts_with("client-"));
}

#[tokio::test]
async fn test_send_and_receive_between_clients() {
    let (addr, _broker) = setup_server().await;
    let (mut consumer, _) = connect(&addr).await;
    let (mut producer, _) = connect(&addr).await;

    send(
        &mut consumer,
        json!({
            "type": "subscribe",
            "destination": "queue://jobs",
            "consumer_id": "worker",
            "receipt": "sub"
        }),
    )
    .await;
    assert_eq!(
        next(&mut consumer).await,
        ServerMessage::Receipt {
            receipt: "sub".into()
        }
    );

    send(
        &mut producer,
        json!({
            "type": "send",
            "destination": "queue://jobs",
            "payload": "build",
            "properties": {"priority": 4},
            "receipt": "sent"
        }),
    )
    .await;
    assert_eq!(
        next(&mut producer).await,
        ServerMessage::Receipt {
            receipt: "sent".into()
        }
    );

    match next(&mut consumer).await {
        ServerMessage::Deliver {
            consumer_id,
            destination,
            payload,
            redelivery_count,
            ..
        } => {
            assert_eq!(consumer_id, "worker");
            assert_eq!(destination, "queue://jobs");
            assert_eq!(payload, "build");
            assert_eq!(redelivery_count, 0);
        }
        other => panic!("Expected Deliver, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_frame_gets_error() {
    let (addr, _broker) = setup_server().await;
    let (mut ws, _) = connect(&addr).await;

    ws.send(WsMessage::Text("not json".to_string().into()))
        .await
        .unwrap();
    match next(&mut ws).await {
        ServerMessage::Error { message, .. } => assert!(message.starts_with("invalid frame")),
        other => panic!("Expected Error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_disconnect_returns_unacked_messages() {
    let (addr, broker) = setup_server().await;
    let (mut ws, _) = connect(&addr).await;

    send(
        &mut ws,
        json!({
            "type": "subscribe",
            "destination": "queue://jobs",
            "consumer_id": "worker",
            "ack_mode": "client"
        }),
    )
    .await;
    send(
        &mut ws,
        json!({"type": "send", "destination": "queue://jobs", "payload": "a"}),
    )
    .await;
    assert!(matches!(next(&mut ws).await, ServerMessage::Deliver { .. }));

    ws.close(None).await.expect("Failed to close WebSocket");
    drop(ws);

    let name = DestinationName::queue("jobs");
    let mut returned = false;
    for _ in 0..100 {
        let stats = broker.destination_stats(&name).unwrap();
        if stats.consumers == 0 && stats.inflight_count == 0 {
            returned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(returned, "consumer was not cleaned up after disconnect");
    assert_eq!(broker.stats().consumers, 0);
    assert_eq!(broker.destination_stats(&name).unwrap().pending, 1);
}

#[tokio::test]
async fn test_connect_with_chosen_client_id() {
    let (addr, _broker) = setup_server().await;
    let (_ws, client_id) = connect_at(&addr, "/?client_id=reader-1").await;
    assert_eq!(client_id, "reader-1");
}

#[tokio::test]
async fn test_client_id_in_use_is_refused() {
    let (addr, broker) = setup_server().await;
    let (_first, _) = connect_at(&addr, "/?client_id=reader").await;

    let mut second = open(&addr, "/?client_id=reader").await;
    match next(&mut second).await {
        ServerMessage::Error { message, .. } => assert!(message.contains("already connected")),
        other => panic!("Expected Error, got {:?}", other),
    }
    assert_eq!(broker.stats().clients, 1);
}

#[tokio::test]
async fn test_durable_subscription_survives_reconnect() {
    let (addr, broker) = setup_server().await;
    let subscribe = json!({
        "type": "subscribe",
        "destination": "topic://feed",
        "consumer_id": "feed-reader",
        "durable": "sub",
        "receipt": "sub"
    });

    let (mut ws, _) = connect_at(&addr, "/?client_id=reader").await;
    send(&mut ws, subscribe).await;
    assert!(matches!(next(&mut ws).await, ServerMessage::Receipt { .. }));
    ws.close(None).await.expect("Failed to close WebSocket");
    drop(ws);
    wait_for_clients(&broker, 0).await;

    let (mut producer, _) = connect(&addr).await;
    send(
        &mut producer,
        json!({"type": "send", "destination": "topic://feed", "payload": "missed", "receipt": "sent"}),
    )
    .await;
    assert!(matches!(next(&mut producer).await, ServerMessage::Receipt { .. }));

    let (mut ws, _) = connect_at(&addr, "/?client_id=reader").await;
    send(
        &mut ws,
        json!({
            "type": "subscribe",
            "destination": "topic://feed",
            "consumer_id": "feed-reader",
            "durable": "sub"
        }),
    )
    .await;
    match next(&mut ws).await {
        ServerMessage::Deliver { payload, .. } => assert_eq!(payload, "missed"),
        other => panic!("Expected Deliver, got {:?}", other),
    }
}
