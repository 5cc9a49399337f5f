//! Transport boundary.
//!
//! The server core never touches sockets. It consumes [`TransportEvent`]s and
//! sends through a [`TransportHost`]. [`websocket`] provides the host used by
//! the binary.

use bytes::Bytes;
use std::fmt;

pub mod websocket;

pub use websocket::{HostEvents, LinkEvent, WebSocketHost};

/// Opaque identifier of one transport-level connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Multiplexing tag for outgoing messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Channel(pub u8);

impl Channel {
    /// Session lifecycle events.
    pub const CONTROL: Self = Self(0);
    /// Chunk payloads.
    pub const CHUNKS: Self = Self(1);
    /// Per-tick snapshots.
    pub const SNAPSHOTS: Self = Self(2);
}

/// Delivery guarantee requested for a send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reliability {
    /// Delivered once, in order with other reliable sends.
    ReliableOrdered,
    /// May be dropped; never retried.
    Unreliable,
}

/// Events the transport host reports to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected(ConnectionHandle),
    Disconnected(ConnectionHandle),
    TimedOut(ConnectionHandle),
    /// One complete inbound message, opcode included.
    Command {
        handle: ConnectionHandle,
        payload: Bytes,
    },
}

/// Send side of a transport host.
///
/// Sends never block and never fail from the caller's point of view; the
/// host logs and absorbs per-peer delivery failures.
pub trait TransportHost {
    fn send_to_one(
        &mut self,
        handle: ConnectionHandle,
        data: Bytes,
        channel: Channel,
        reliability: Reliability,
    );

    fn send_to_all(&mut self, data: Bytes, channel: Channel, reliability: Reliability);

    /// Close a connection after flushing its reliable sends. The host reports
    /// no further events for `handle`.
    fn close(&mut self, handle: ConnectionHandle);

    /// Live transport connections, admitted or not.
    fn connection_count(&self) -> usize;

    fn max_connections(&self) -> usize;
}
