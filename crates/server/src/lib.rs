//! Authoritative state-sync server for a chunk-based voxel world.

pub mod config;
pub mod queue;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod transport;
pub mod world;

// Re-export commonly used types
pub use config::Config;
pub use server::{run, ChunkOutcome, RemovalReason, Server, SessionState, TickReport};
pub use transport::{Channel, ConnectionHandle, Reliability, TransportEvent, TransportHost};
pub use world::{ChunkManager, ChunkStore, FlatTerrain};
