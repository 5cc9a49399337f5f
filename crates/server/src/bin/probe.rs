//! Minimal test client.
//!
//! Connects, waits for its session id, reports a position, asks for the
//! spawn chunk, logs what the server sends for a few seconds, then asks to
//! disconnect.
//!
//! Usage: `probe [ws://127.0.0.1:11445]`

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use protocol::packets::{ClientPacket, ServerPacket};
use protocol::{ChunkPosition, Position};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_URL: &str = "ws://127.0.0.1:11445";
const LISTEN_FOR: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let url = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_URL.to_string());
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("connecting to {}", url))?;
    info!("Connected to {}", url);

    let (mut write, mut read) = ws_stream.split();

    let session_id = loop {
        let msg = read
            .next()
            .await
            .context("server closed before assigning an id")??;
        if let Message::Binary(data) = msg {
            match ServerPacket::parse(&data)? {
                ServerPacket::AssignedId(id) => break id,
                other => debug!("Before id assignment: {:?}", other),
            }
        }
    };
    info!("Assigned session {}", session_id);

    let hello = [
        ClientPacket::PlayerPosition {
            session_id,
            position: Position::new(0.5, 17.0, 0.5),
        },
        ClientPacket::ChunkRequest {
            session_id,
            position: ChunkPosition::ZERO,
        },
    ];
    for packet in &hello {
        write.send(Message::Binary(packet.build().finish())).await?;
    }

    let deadline = Instant::now() + LISTEN_FOR;
    let mut snapshots = 0usize;
    loop {
        let msg = match timeout_at(deadline, read.next()).await {
            Err(_) => break,
            Ok(None) => {
                warn!("Server closed the connection");
                return Ok(());
            }
            Ok(Some(msg)) => msg?,
        };
        let Message::Binary(data) = msg else {
            continue;
        };
        match ServerPacket::parse(&data) {
            Ok(ServerPacket::Snapshot(entries)) => {
                snapshots += 1;
                debug!("Snapshot with {} entries", entries.len());
            }
            Ok(ServerPacket::ChunkData { position, blocks }) => {
                let solid = blocks.iter().filter(|&&b| b != 0).count();
                info!("Chunk {}: {} solid blocks", position, solid);
            }
            Ok(other) => info!("{:?}", other),
            Err(e) => warn!("Undecodable message: {}", e),
        }
    }
    info!("Received {} snapshots in {:?}", snapshots, LISTEN_FOR);

    write
        .send(Message::Binary(
            ClientPacket::Disconnect { session_id }.build().finish(),
        ))
        .await?;
    write.close().await?;
    info!("Disconnected");
    Ok(())
}
