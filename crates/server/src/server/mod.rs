//! Server entry point and main loop.

mod orchestrator;

pub use orchestrator::{ChunkOutcome, RemovalReason, Server, SessionState, TickReport};

use crate::config::Config;
use crate::transport::{HostEvents, WebSocketHost};
use crate::world::{ChunkManager, ChunkStore, FlatTerrain};
use protocol::ChunkPosition;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Ticks between periodic status lines.
const STATUS_EVERY: u64 = 400;

/// Run the server until the accept loop fails or Ctrl+C is pressed.
///
/// Transport events and ticks are handled one at a time on this task.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let (transport, HostEvents {
        mut events,
        mut accept_task,
    }) = WebSocketHost::listen(&config.server).await?;

    let mut chunks = ChunkManager::new(FlatTerrain {
        ground_height: config.world.ground_height,
    });
    if config.world.spawn_chunk {
        chunks.get_or_create(ChunkPosition::ZERO);
        info!("Spawn chunk generated");
    }

    let mut server = Server::new(&config, transport, chunks);

    let tick_interval = Duration::from_millis(config.server.tick_interval_ms);
    let tick_budget = tick_interval.mul_f32(0.9);
    let mut ticker = interval_at(Instant::now() + tick_interval, tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        "Ticking every {}ms, up to {} sessions",
        config.server.tick_interval_ms, config.server.max_connections
    );

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    anyhow::bail!("transport event channel closed");
                };
                if let Some(event) = server.transport_mut().accept_event(event) {
                    server.handle_event(event);
                }
            }
            _ = ticker.tick() => {
                let started = Instant::now();
                let report = server.tick();
                let elapsed = started.elapsed();

                if elapsed > tick_budget {
                    warn!(
                        "Tick {} took {:.1}ms (budget {:.1}ms)",
                        report.tick,
                        elapsed.as_secs_f64() * 1000.0,
                        tick_budget.as_secs_f64() * 1000.0
                    );
                }
                if report.tick % STATUS_EVERY == 0 {
                    debug!(
                        "Tick {}: {} sessions, {} chunk requests pending, {} chunks loaded",
                        report.tick,
                        report.snapshot_entries,
                        report.queue_depth,
                        server.chunks().len()
                    );
                }
            }
            result = &mut accept_task => {
                return match result {
                    Ok(Ok(())) => Err(anyhow::anyhow!("accept loop exited")),
                    Ok(Err(e)) => Err(e.context("accept loop failed")),
                    Err(e) => Err(anyhow::Error::new(e).context("accept loop panicked")),
                };
            }
            _ = tokio::signal::ctrl_c() => {
                info!(
                    "Shutting down after {} ticks, {} sessions connected",
                    server.tick_count(),
                    server.registry().len()
                );
                return Ok(());
            }
        }
    }
}
