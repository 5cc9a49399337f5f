//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while decoding a message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("Unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Block grid has {actual} bytes, expected {expected}")]
    BlockGridSize { expected: usize, actual: usize },
}
