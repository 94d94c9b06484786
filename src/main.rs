//! CLI for PopMQ
//!
//! Subcommands:
//! - `server`: run the broker behind a WebSocket server
//! - `client`: send one message to a queue and read it back (smoke test)

use std::sync::Arc;

use clap::Parser;
use popmq::broker::Broker;
use popmq::config::load_config;
use popmq::transport::websocket::start_websocket_server;
use popmq::utils::logging;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "popmq")]
enum Command {
    /// Start the WebSocket server
    Server,
    /// Round-trip one message through a queue on a running server
    Client {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        /// Queue to use
        #[arg(long, default_value = "smoke")]
        queue: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("failed to read .env: {e}");
        }
    }

    let cmd = Command::parse();

    match cmd {
        Command::Server => {
            if let Err(e) = run_server().await {
                error!("Server failed: {}", e);
            }
        }
        Command::Client { url, queue } => {
            logging::init("info");
            if let Err(e) = run_client(&url, &queue).await {
                error!("Client failed: {}", e);
            }
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    logging::init(&config.broker.log_level);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let broker = Broker::open(&config)?;

    tokio::spawn(Arc::clone(&broker).run_maintenance());

    tokio::select! {
        result = start_websocket_server(&addr, Arc::clone(&broker)) => {
            match result {
                Ok(()) => error!("WebSocket server exited unexpectedly."),
                Err(e) => error!(error = %e, "WebSocket server failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    broker.shutdown();
    Ok(())
}

async fn run_client(url: &str, queue: &str) -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (mut ws_stream, _response) = connect_async(url).await?;
    let destination = format!("queue://{queue}");

    let frames = [
        json!({ "type": "subscribe", "destination": destination, "consumer_id": "smoke", "ack_mode": "individual" }),
        json!({ "type": "send", "destination": destination, "payload": "Hello from popmq", "receipt": "sent" }),
    ];
    for frame in frames {
        ws_stream
            .send(WsMessage::Text(frame.to_string().into()))
            .await?;
    }

    while let Some(frame) = ws_stream.next().await {
        let WsMessage::Text(text) = frame? else {
            continue;
        };
        println!("{}", text.as_str());
        let value: serde_json::Value = serde_json::from_str(text.as_str())?;
        match value.get("type").and_then(|t| t.as_str()) {
            Some("deliver") => {
                let ack = json!({
                    "type": "ack",
                    "consumer_id": "smoke",
                    "message_id": value["message_id"],
                });
                ws_stream
                    .send(WsMessage::Text(ack.to_string().into()))
                    .await?;
                break;
            }
            Some("error") => {
                warn!("server reported an error");
                break;
            }
            _ => {}
        }
    }

    ws_stream.close(None).await?;
    Ok(())
}
