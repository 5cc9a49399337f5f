//! Shared protocol crate for the voxel server.
//!
//! This crate contains:
//! - Binary reading/writing utilities
//! - Opcodes and packet encoders/decoders for both directions
//! - Shared types (session ids, positions, chunk geometry)

mod binary;
mod error;
pub mod packets;

pub use binary::{BinaryReader, BinaryWriter};
pub use error::ProtocolError;

/// Server-assigned identity of a connected session.
pub type SessionId = u32;

/// Player position in world space.
pub type Position = glam::Vec3;

/// Integer chunk grid coordinate.
pub type ChunkPosition = glam::IVec3;

/// One block value inside a chunk grid.
pub type BlockId = u8;

/// Edge length of a cubic chunk, in blocks.
pub const CHUNK_SIZE: usize = 32;

/// Number of blocks in one chunk.
pub const CHUNK_VOLUME: usize = CHUNK_SIZE * CHUNK_SIZE * CHUNK_SIZE;
