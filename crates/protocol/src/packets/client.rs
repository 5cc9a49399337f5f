//! Client -> Server packets.

use super::ClientOpcode;
use crate::{BinaryReader, BinaryWriter, ChunkPosition, Position, ProtocolError, SessionId};

/// Parsed client packet.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    /// Position update (0x01).
    PlayerPosition {
        session_id: SessionId,
        position: Position,
    },
    /// Disconnect (0x02).
    Disconnect { session_id: SessionId },
    /// Chunk request (0x03).
    ChunkRequest {
        session_id: SessionId,
        position: ChunkPosition,
    },
}

impl ClientPacket {
    /// Parse a client packet from raw bytes.
    ///
    /// Trailing bytes after the last field are ignored.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let mut reader = BinaryReader::new(data.to_vec());
        let opcode = ClientOpcode::try_from(reader.read_u8()?)?;

        match opcode {
            ClientOpcode::PlayerPosition => {
                let session_id = reader.read_u32()?;
                let x = reader.read_f32()?;
                let y = reader.read_f32()?;
                let z = reader.read_f32()?;
                Ok(ClientPacket::PlayerPosition {
                    session_id,
                    position: Position::new(x, y, z),
                })
            }
            ClientOpcode::Disconnect => Ok(ClientPacket::Disconnect {
                session_id: reader.read_u32()?,
            }),
            ClientOpcode::ChunkRequest => {
                let session_id = reader.read_u32()?;
                let x = reader.read_i32()?;
                let y = reader.read_i32()?;
                let z = reader.read_i32()?;
                Ok(ClientPacket::ChunkRequest {
                    session_id,
                    position: ChunkPosition::new(x, y, z),
                })
            }
        }
    }

    /// The opcode this packet is sent under.
    pub fn opcode(&self) -> ClientOpcode {
        match self {
            ClientPacket::PlayerPosition { .. } => ClientOpcode::PlayerPosition,
            ClientPacket::Disconnect { .. } => ClientOpcode::Disconnect,
            ClientPacket::ChunkRequest { .. } => ClientOpcode::ChunkRequest,
        }
    }

    /// The session id carried in the payload.
    pub fn session_id(&self) -> SessionId {
        match self {
            ClientPacket::PlayerPosition { session_id, .. }
            | ClientPacket::Disconnect { session_id }
            | ClientPacket::ChunkRequest { session_id, .. } => *session_id,
        }
    }

    /// Encode the packet for sending.
    pub fn build(&self) -> BinaryWriter {
        let mut w = BinaryWriter::with_capacity(17);
        w.put_u8(self.opcode() as u8);
        match self {
            ClientPacket::PlayerPosition {
                session_id,
                position,
            } => {
                w.put_u32(*session_id);
                w.put_f32(position.x);
                w.put_f32(position.y);
                w.put_f32(position.z);
            }
            ClientPacket::Disconnect { session_id } => {
                w.put_u32(*session_id);
            }
            ClientPacket::ChunkRequest {
                session_id,
                position,
            } => {
                w.put_u32(*session_id);
                w.put_i32(position.x);
                w.put_i32(position.y);
                w.put_i32(position.z);
            }
        }
        w
    }
}
