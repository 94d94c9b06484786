use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Broker;
use crate::client::Session;
use crate::transport::message::{ClientMessage, ServerMessage};

/// Binds `addr` and serves WebSocket clients until the task is dropped.
pub async fn start_websocket_server(addr: &str, broker: Arc<Broker>) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "WebSocket server listening");
    serve(listener, broker).await;
    Ok(())
}

/// Accepts connections on an already bound listener.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(stream, peer, Arc::clone(&broker)));
            }
            Err(e) => warn!(error = %e, "failed to accept connection"),
        }
    }
}

/// Parses one text frame into a client request.
pub fn parse_frame(text: &str) -> Result<ClientMessage, ServerMessage> {
    serde_json::from_str::<ClientMessage>(text).map_err(|e| ServerMessage::Error {
        message: format!("invalid frame: {e}"),
        receipt: None,
    })
}

/// The `client_id` query parameter of the upgrade request, if any.
///
/// A client that reconnects under the same id gets its durable subscriptions
/// back. Without one the connection gets a fresh id.
pub fn client_id_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, value)| *key == "client_id" && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, broker: Arc<Broker>) {
    let mut requested_id = None;
    let handshake = accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            requested_id = client_id_from_query(request.uri().query());
            Ok(response)
        },
    );
    let ws_stream = match handshake.await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake error");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let client_id = requested_id.unwrap_or_else(|| format!("client-{}", uuid::Uuid::new_v4()));
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let session = match Session::new(client_id.clone(), broker, tx) {
        Ok(session) => Arc::new(session),
        Err(e) => {
            warn!(client = %client_id, %peer, error = %e, "connection refused");
            let refusal = ServerMessage::Error {
                message: e.to_string(),
                receipt: None,
            };
            if let Ok(frame) = serde_json::to_string(&refusal) {
                let _ = ws_sender.send(WsMessage::Text(frame.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };
    info!(client = %client_id, %peer, "client connected");

    // broker → client
    let writer_id = client_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                debug!(client = %writer_id, error = %e, "send loop stopped");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    session.reply(&ServerMessage::Connected {
        client_id: client_id.clone(),
    });

    // Requests run on a blocking thread in arrival order, since a send may
    // wait for memory to free up.
    let (requests, mut pending) = mpsc::unbounded_channel::<ClientMessage>();
    let worker_session = Arc::clone(&session);
    let worker = tokio::task::spawn_blocking(move || {
        while let Some(request) = pending.blocking_recv() {
            if let Some(reply) = worker_session.handle(request) {
                worker_session.reply(&reply);
            }
        }
    });

    while let Some(frame) = ws_receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(client = %client_id, error = %e, "read error");
                break;
            }
        };
        match frame {
            WsMessage::Text(text) => match parse_frame(text.as_str()) {
                Ok(request) => {
                    if requests.send(request).is_err() {
                        break;
                    }
                }
                Err(reply) => {
                    warn!(client = %client_id, "invalid client message");
                    session.reply(&reply);
                }
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    session.interrupt();
    drop(requests);
    if let Err(e) = worker.await {
        warn!(client = %client_id, error = %e, "request worker failed");
    }
    session.close();
    info!(client = %client_id, "client disconnected");
}
