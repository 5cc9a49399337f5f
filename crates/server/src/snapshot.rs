//! Snapshot broadcaster.

use crate::registry::PeerRegistry;
use crate::transport::{Channel, Reliability, TransportHost};
use bytes::Bytes;
use protocol::packets::{build_snapshot, SnapshotEntry};

/// Encode every registered session's id and position, in registry order.
pub fn build(registry: &PeerRegistry) -> Bytes {
    build_snapshot(registry.iter().map(|session| SnapshotEntry {
        session_id: session.id,
        position: session.position,
    }))
    .finish()
}

/// Build one snapshot and send it to everyone, unreliably.
///
/// Loss is fine: the next tick's snapshot supersedes it.
pub fn broadcast<T: TransportHost>(registry: &PeerRegistry, transport: &mut T) -> usize {
    let data = build(registry);
    transport.send_to_all(data, Channel::SNAPSHOTS, Reliability::Unreliable);
    registry.len()
}
