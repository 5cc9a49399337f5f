//! Packet definitions for the voxel protocol.
//!
//! This module contains both client->server and server->client packet types.
//! Every message starts with a one-byte opcode followed by fixed-order fields.

mod client;
mod server;

pub use client::*;
pub use server::*;

/// Opcodes for client -> server packets.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOpcode {
    /// Position update for the sender's session.
    PlayerPosition = 0x01,
    /// Explicit session teardown.
    Disconnect = 0x02,
    /// Ask the server to stream one chunk.
    ChunkRequest = 0x03,
}

impl TryFrom<u8> for ClientOpcode {
    type Error = crate::ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::PlayerPosition),
            0x02 => Ok(Self::Disconnect),
            0x03 => Ok(Self::ChunkRequest),
            other => Err(crate::ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Opcodes for server -> client packets.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOpcode {
    /// The receiving peer's own session id.
    AssignedId = 0x10,
    /// Another peer was admitted.
    PeerJoined = 0x11,
    /// A peer was removed.
    PeerLeft = 0x12,
    /// Per-tick positions of every session.
    Snapshot = 0x13,
    /// One chunk's block grid.
    ChunkData = 0x14,
}

impl TryFrom<u8> for ServerOpcode {
    type Error = crate::ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x10 => Ok(Self::AssignedId),
            0x11 => Ok(Self::PeerJoined),
            0x12 => Ok(Self::PeerLeft),
            0x13 => Ok(Self::Snapshot),
            0x14 => Ok(Self::ChunkData),
            other => Err(crate::ProtocolError::UnknownOpcode(other)),
        }
    }
}
