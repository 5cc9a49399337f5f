//! Server configuration.

use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chunks: ChunkConfig,
    #[serde(default)]
    pub world: WorldConfig,
}

impl Config {
    /// Load configuration from `config.toml` or use defaults.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Path::new("config.toml"))
    }

    /// Load configuration from `path`, writing the defaults there if it does
    /// not exist yet.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            info!("No {} found, creating default config", path.display());
            let default_config = Self::default();
            std::fs::write(path, toml::to_string_pretty(&default_config)?)?;
            default_config
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.max_connections == 0 {
            bail!("server.max_connections must be at least 1");
        }
        // Snapshot count is a u16 on the wire.
        if self.server.max_connections > u16::MAX as usize {
            bail!(
                "server.max_connections must not exceed {}, got {}",
                u16::MAX,
                self.server.max_connections
            );
        }
        if self.server.tick_interval_ms == 0 {
            bail!("server.tick_interval_ms must be at least 1");
        }
        if self.chunks.max_pending_per_session > self.chunks.max_pending {
            bail!(
                "chunks.max_pending_per_session ({}) exceeds chunks.max_pending ({})",
                self.chunks.max_pending_per_session,
                self.chunks.max_pending
            );
        }
        Ok(())
    }
}

/// Server networking and general settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum concurrent sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Connections per IP limit.
    #[serde(default = "default_ip_limit")]
    pub ip_limit: usize,
    /// Seconds without any frame before a peer is timed out.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Tick interval in milliseconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Server name, logged at startup.
    #[serde(default = "default_name")]
    pub name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            max_connections: default_max_connections(),
            ip_limit: default_ip_limit(),
            timeout: default_timeout(),
            tick_interval_ms: default_tick_interval(),
            name: default_name(),
        }
    }
}

fn default_port() -> u16 {
    11445
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_max_connections() -> usize {
    64
}
fn default_ip_limit() -> usize {
    8
}
fn default_timeout() -> u64 {
    15
}
fn default_tick_interval() -> u64 {
    50
}
fn default_name() -> String {
    "Voxel Server".to_string()
}

/// Chunk streaming queue limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkConfig {
    /// Requests waiting across all sessions.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Requests waiting from a single session.
    #[serde(default = "default_max_pending_per_session")]
    pub max_pending_per_session: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            max_pending_per_session: default_max_pending_per_session(),
        }
    }
}

fn default_max_pending() -> usize {
    4096
}
fn default_max_pending_per_session() -> usize {
    256
}

/// World generation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorldConfig {
    /// World-space y of the flat terrain surface.
    #[serde(default = "default_ground_height")]
    pub ground_height: i32,
    /// Generate chunk (0, 0, 0) before accepting connections.
    #[serde(default = "default_spawn_chunk")]
    pub spawn_chunk: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            ground_height: default_ground_height(),
            spawn_chunk: default_spawn_chunk(),
        }
    }
}

fn default_ground_height() -> i32 {
    16
}
fn default_spawn_chunk() -> bool {
    true
}
