//! Server -> Client packet building and parsing.

use super::ServerOpcode;
use crate::{
    BinaryReader, BinaryWriter, ChunkPosition, Position, ProtocolError, SessionId, CHUNK_VOLUME,
};
use bytes::Bytes;

/// One session's entry in a Snapshot packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotEntry {
    pub session_id: SessionId,
    pub position: Position,
}

/// Build an AssignedId packet (0x10).
pub fn build_assigned_id(session_id: SessionId) -> BinaryWriter {
    build_session_event(ServerOpcode::AssignedId, session_id)
}

/// Build a PeerJoined packet (0x11).
pub fn build_peer_joined(session_id: SessionId) -> BinaryWriter {
    build_session_event(ServerOpcode::PeerJoined, session_id)
}

/// Build a PeerLeft packet (0x12).
pub fn build_peer_left(session_id: SessionId) -> BinaryWriter {
    build_session_event(ServerOpcode::PeerLeft, session_id)
}

fn build_session_event(opcode: ServerOpcode, session_id: SessionId) -> BinaryWriter {
    let mut w = BinaryWriter::with_capacity(5);
    w.put_u8(opcode as u8);
    w.put_u32(session_id);
    w
}

/// Build a Snapshot packet (0x13).
///
/// The packet format is:
/// - opcode 0x13
/// - count: u16
/// - [session_id: u32, x: f32, y: f32, z: f32] × count
///
/// Callers keep `entries.len()` within `u16::MAX`; the server enforces it
/// through its connection cap.
pub fn build_snapshot<I>(entries: I) -> BinaryWriter
where
    I: ExactSizeIterator<Item = SnapshotEntry>,
{
    let count = entries.len();
    debug_assert!(count <= u16::MAX as usize);

    let mut w = BinaryWriter::with_capacity(3 + count * 16);
    w.put_u8(ServerOpcode::Snapshot as u8);
    w.put_u16(count as u16);
    for entry in entries {
        w.put_u32(entry.session_id);
        w.put_f32(entry.position.x);
        w.put_f32(entry.position.y);
        w.put_f32(entry.position.z);
    }
    w
}

/// Build a ChunkData packet (0x14).
///
/// `blocks` is the chunk's flat block grid in storage order.
pub fn build_chunk_data(position: ChunkPosition, blocks: &[u8]) -> BinaryWriter {
    let mut w = BinaryWriter::with_capacity(13 + blocks.len());
    w.put_u8(ServerOpcode::ChunkData as u8);
    w.put_i32(position.x);
    w.put_i32(position.y);
    w.put_i32(position.z);
    w.put_slice(blocks);
    w
}

/// Parsed server packet, as seen by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPacket {
    AssignedId(SessionId),
    PeerJoined(SessionId),
    PeerLeft(SessionId),
    Snapshot(Vec<SnapshotEntry>),
    ChunkData {
        position: ChunkPosition,
        blocks: Bytes,
    },
}

impl ServerPacket {
    /// Parse a server packet from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let mut reader = BinaryReader::new(data.to_vec());
        let opcode = ServerOpcode::try_from(reader.read_u8()?)?;

        match opcode {
            ServerOpcode::AssignedId => Ok(ServerPacket::AssignedId(reader.read_u32()?)),
            ServerOpcode::PeerJoined => Ok(ServerPacket::PeerJoined(reader.read_u32()?)),
            ServerOpcode::PeerLeft => Ok(ServerPacket::PeerLeft(reader.read_u32()?)),
            ServerOpcode::Snapshot => {
                let count = reader.read_u16()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let session_id = reader.read_u32()?;
                    let x = reader.read_f32()?;
                    let y = reader.read_f32()?;
                    let z = reader.read_f32()?;
                    entries.push(SnapshotEntry {
                        session_id,
                        position: Position::new(x, y, z),
                    });
                }
                Ok(ServerPacket::Snapshot(entries))
            }
            ServerOpcode::ChunkData => {
                let x = reader.read_i32()?;
                let y = reader.read_i32()?;
                let z = reader.read_i32()?;
                let blocks = reader.read_rest();
                if blocks.len() != CHUNK_VOLUME {
                    return Err(ProtocolError::BlockGridSize {
                        expected: CHUNK_VOLUME,
                        actual: blocks.len(),
                    });
                }
                Ok(ServerPacket::ChunkData {
                    position: ChunkPosition::new(x, y, z),
                    blocks,
                })
            }
        }
    }
}
