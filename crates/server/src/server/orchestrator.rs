//! Server state and per-tick work.
//!
//! [`Server`] owns the registry, the chunk queue, the chunk store and the
//! transport host's send side. Everything here runs on one task: transport
//! events and ticks are fed in one at a time, so none of it needs locking.

use crate::config::Config;
use crate::queue::{ChunkQueue, ChunkRequest};
use crate::registry::PeerRegistry;
use crate::snapshot;
use crate::transport::{Channel, ConnectionHandle, Reliability, TransportEvent, TransportHost};
use crate::world::ChunkStore;
use protocol::packets::{
    build_assigned_id, build_chunk_data, build_peer_joined, build_peer_left, ClientPacket,
};
use protocol::{ChunkPosition, ProtocolError, SessionId};
use tracing::{debug, info, warn};

/// What triggered a session removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Disconnected,
    TimedOut,
    Requested,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::TimedOut => "timed out",
            Self::Requested => "requested disconnect",
        }
    }
}

/// Lifecycle position of a session id.
///
/// Removal runs synchronously, so the transitional disconnecting phase is
/// never observable from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never handed out.
    Unassigned,
    Connected,
    Removed,
}

/// Result of servicing one chunk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Sent to the requester.
    Sent {
        position: ChunkPosition,
        session_id: SessionId,
    },
    /// Generated, but the requester was already gone.
    Stale {
        position: ChunkPosition,
        session_id: SessionId,
    },
}

/// Summary of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub chunk: Option<ChunkOutcome>,
    /// Sessions included in this tick's snapshot.
    pub snapshot_entries: usize,
    /// Chunk requests still waiting after this tick.
    pub queue_depth: usize,
}

/// The authoritative server.
pub struct Server<T, C> {
    registry: PeerRegistry,
    queue: ChunkQueue,
    chunks: C,
    transport: T,
    tick_count: u64,
}

impl<T: TransportHost, C: ChunkStore> Server<T, C> {
    pub fn new(config: &Config, transport: T, chunks: C) -> Self {
        Self {
            registry: PeerRegistry::new(config.server.max_connections),
            queue: ChunkQueue::new(
                config.chunks.max_pending,
                config.chunks.max_pending_per_session,
            ),
            chunks,
            transport,
            tick_count: 0,
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(handle) => {
                self.on_connect(handle);
            }
            TransportEvent::Disconnected(handle) => self.on_disconnect(handle),
            TransportEvent::TimedOut(handle) => self.on_timeout(handle),
            TransportEvent::Command { handle, payload } => self.on_command(handle, &payload),
        }
    }

    /// Admit a new connection if there is room.
    ///
    /// The new peer gets its id first, then everyone (the new peer included)
    /// hears about the join. A rejected connection gets no message at all.
    pub fn on_connect(&mut self, handle: ConnectionHandle) -> Option<SessionId> {
        let id = match self.registry.admit(handle) {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    "Connection {} not admitted: {} ({}/{} transport connections)",
                    handle,
                    e,
                    self.transport.connection_count(),
                    self.transport.max_connections()
                );
                return None;
            }
        };
        info!("Session {} connected on {}", id, handle);

        self.transport.send_to_one(
            handle,
            build_assigned_id(id).finish(),
            Channel::CONTROL,
            Reliability::ReliableOrdered,
        );
        self.transport.send_to_all(
            build_peer_joined(id).finish(),
            Channel::CONTROL,
            Reliability::ReliableOrdered,
        );
        Some(id)
    }

    pub fn on_disconnect(&mut self, handle: ConnectionHandle) {
        self.remove_by_handle(handle, RemovalReason::Disconnected);
    }

    pub fn on_timeout(&mut self, handle: ConnectionHandle) {
        self.remove_by_handle(handle, RemovalReason::TimedOut);
    }

    /// Decode and apply one inbound message.
    ///
    /// Unknown opcodes, malformed payloads, and messages naming a session the
    /// sender does not own are dropped without a reply.
    pub fn on_command(&mut self, handle: ConnectionHandle, payload: &[u8]) {
        let packet = match ClientPacket::parse(payload) {
            Ok(packet) => packet,
            Err(ProtocolError::UnknownOpcode(opcode)) => {
                debug!("Ignoring unknown opcode {:#04x} from {}", opcode, handle);
                return;
            }
            Err(e) => {
                warn!("Malformed message from {}: {}", handle, e);
                return;
            }
        };

        let claimed = packet.session_id();
        match self.registry.find_by_handle(handle) {
            Some(session) if session.id == claimed => {}
            Some(session) => {
                debug!(
                    "Session {} on {} sent {:?} for session {}; ignored",
                    session.id,
                    handle,
                    packet.opcode(),
                    claimed
                );
                return;
            }
            None => {
                debug!(
                    "Ignoring {:?} for session {} from {} (no session)",
                    packet.opcode(),
                    claimed,
                    handle
                );
                return;
            }
        }

        match packet {
            ClientPacket::PlayerPosition {
                session_id,
                position,
            } => {
                self.registry.update_position(session_id, position);
            }
            ClientPacket::Disconnect { session_id } => {
                self.remove_session(session_id, RemovalReason::Requested);
            }
            ClientPacket::ChunkRequest {
                session_id,
                position,
            } => {
                let request = ChunkRequest {
                    position,
                    session_id,
                };
                match self.queue.enqueue(request) {
                    Ok(()) => debug!("Session {} requested chunk {}", session_id, position),
                    Err(e) => warn!(
                        "Dropped chunk request {} from session {}: {}",
                        position, session_id, e
                    ),
                }
            }
        }
    }

    fn remove_by_handle(&mut self, handle: ConnectionHandle, reason: RemovalReason) {
        match self.registry.find_by_handle(handle).map(|s| s.id) {
            Some(id) => {
                self.remove_session(id, reason);
            }
            // Never admitted, or already removed by an explicit Disconnect.
            None => debug!("{} {} without a session", handle, reason.as_str()),
        }
    }

    /// Single removal path for every trigger. Returns false if the session
    /// was already gone.
    fn remove_session(&mut self, id: SessionId, reason: RemovalReason) -> bool {
        let Some(session) = self.registry.remove(id) else {
            return false;
        };
        info!("Session {} on {} {}", id, session.handle, reason.as_str());

        self.transport.send_to_all(
            build_peer_left(id).finish(),
            Channel::CONTROL,
            Reliability::ReliableOrdered,
        );
        // The transport already dropped the link on the other paths.
        if reason == RemovalReason::Requested {
            self.transport.close(session.handle);
        }
        true
    }

    /// Run one tick: service at most one chunk request, then broadcast a
    /// snapshot.
    pub fn tick(&mut self) -> TickReport {
        self.tick_count += 1;

        let chunk = self
            .queue
            .drain_one()
            .map(|request| self.stream_chunk(request));

        let snapshot_entries = snapshot::broadcast(&self.registry, &mut self.transport);

        TickReport {
            tick: self.tick_count,
            chunk,
            snapshot_entries,
            queue_depth: self.queue.len(),
        }
    }

    fn stream_chunk(&mut self, request: ChunkRequest) -> ChunkOutcome {
        let ChunkRequest {
            position,
            session_id,
        } = request;

        // Generated even when nobody is left to receive it.
        let chunk = self.chunks.get_or_create(position);

        match self.registry.find(session_id) {
            Some(session) => {
                let data = build_chunk_data(chunk.position(), chunk.blocks()).finish();
                self.transport.send_to_one(
                    session.handle,
                    data,
                    Channel::CHUNKS,
                    Reliability::ReliableOrdered,
                );
                ChunkOutcome::Sent {
                    position,
                    session_id,
                }
            }
            None => {
                debug!(
                    "Chunk {} generated for departed session {}; not sent",
                    position, session_id
                );
                ChunkOutcome::Stale {
                    position,
                    session_id,
                }
            }
        }
    }

    pub fn session_state(&self, id: SessionId) -> SessionState {
        if self.registry.find(id).is_some() {
            SessionState::Connected
        } else if self.registry.was_assigned(id) {
            SessionState::Removed
        } else {
            SessionState::Unassigned
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &ChunkQueue {
        &self.queue
    }

    pub fn chunks(&self) -> &C {
        &self.chunks
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{BlockType, ChunkManager, FlatTerrain};
    use bytes::Bytes;
    use protocol::packets::{ServerPacket, SnapshotEntry};
    use protocol::{Position, CHUNK_VOLUME};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Target {
        One(ConnectionHandle),
        All,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Sent {
        target: Target,
        packet: ServerPacket,
        channel: Channel,
        reliability: Reliability,
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Vec<Sent>,
        closed: Vec<ConnectionHandle>,
    }

    impl RecordingTransport {
        fn record(&mut self, target: Target, data: Bytes, channel: Channel, reliability: Reliability) {
            let packet = ServerPacket::parse(&data).expect("server sent an undecodable packet");
            self.sent.push(Sent {
                target,
                packet,
                channel,
                reliability,
            });
        }

        fn take(&mut self) -> Vec<Sent> {
            std::mem::take(&mut self.sent)
        }
    }

    impl TransportHost for RecordingTransport {
        fn send_to_one(
            &mut self,
            handle: ConnectionHandle,
            data: Bytes,
            channel: Channel,
            reliability: Reliability,
        ) {
            self.record(Target::One(handle), data, channel, reliability);
        }

        fn send_to_all(&mut self, data: Bytes, channel: Channel, reliability: Reliability) {
            self.record(Target::All, data, channel, reliability);
        }

        fn close(&mut self, handle: ConnectionHandle) {
            self.closed.push(handle);
        }

        fn connection_count(&self) -> usize {
            0
        }

        fn max_connections(&self) -> usize {
            usize::MAX
        }
    }

    type TestServer = Server<RecordingTransport, ChunkManager<FlatTerrain>>;

    fn server_with(max_connections: usize) -> TestServer {
        let mut config = Config::default();
        config.server.max_connections = max_connections;
        config.chunks.max_pending = 8;
        config.chunks.max_pending_per_session = 4;
        Server::new(
            &config,
            RecordingTransport::default(),
            ChunkManager::new(FlatTerrain { ground_height: 16 }),
        )
    }

    fn connect(server: &mut TestServer, handle: u64) -> SessionId {
        let id = server.on_connect(ConnectionHandle(handle)).unwrap();
        server.transport_mut().take();
        id
    }

    fn position_msg(session_id: SessionId, position: Position) -> Bytes {
        ClientPacket::PlayerPosition {
            session_id,
            position,
        }
        .build()
        .finish()
    }

    fn chunk_msg(session_id: SessionId, x: i32, y: i32, z: i32) -> Bytes {
        ClientPacket::ChunkRequest {
            session_id,
            position: ChunkPosition::new(x, y, z),
        }
        .build()
        .finish()
    }

    fn disconnect_msg(session_id: SessionId) -> Bytes {
        ClientPacket::Disconnect { session_id }.build().finish()
    }

    fn non_snapshot(sent: Vec<Sent>) -> Vec<Sent> {
        sent.into_iter()
            .filter(|s| !matches!(s.packet, ServerPacket::Snapshot(_)))
            .collect()
    }

    #[test]
    fn test_connect_sends_id_then_join() {
        let mut server = server_with(4);
        let handle = ConnectionHandle(42);

        assert_eq!(server.on_connect(handle), Some(1));
        assert_eq!(
            server.transport_mut().take(),
            vec![
                Sent {
                    target: Target::One(handle),
                    packet: ServerPacket::AssignedId(1),
                    channel: Channel::CONTROL,
                    reliability: Reliability::ReliableOrdered,
                },
                Sent {
                    target: Target::All,
                    packet: ServerPacket::PeerJoined(1),
                    channel: Channel::CONTROL,
                    reliability: Reliability::ReliableOrdered,
                },
            ]
        );
        assert_eq!(server.session_state(1), SessionState::Connected);
    }

    #[test]
    fn test_connect_at_capacity_is_silent() {
        let mut server = server_with(2);
        connect(&mut server, 1);
        connect(&mut server, 2);

        assert_eq!(server.on_connect(ConnectionHandle(3)), None);
        assert!(server.transport().sent.is_empty());
        assert_eq!(server.registry().len(), 2);
        assert!(server.registry().find_by_handle(ConnectionHandle(3)).is_none());
        assert_eq!(server.session_state(3), SessionState::Unassigned);
    }

    #[test]
    fn test_every_removal_path_sends_one_peer_left() {
        for trigger in 0..3 {
            let mut server = server_with(4);
            let id = connect(&mut server, 9);
            let handle = ConnectionHandle(9);

            match trigger {
                0 => server.on_disconnect(handle),
                1 => server.on_timeout(handle),
                _ => server.on_command(handle, &disconnect_msg(id)),
            }
            // Late duplicates of every kind.
            server.on_command(handle, &disconnect_msg(id));
            server.on_disconnect(handle);
            server.on_timeout(handle);

            assert_eq!(
                server.transport_mut().take(),
                vec![Sent {
                    target: Target::All,
                    packet: ServerPacket::PeerLeft(id),
                    channel: Channel::CONTROL,
                    reliability: Reliability::ReliableOrdered,
                }]
            );
            assert!(server.registry().is_empty());
            assert_eq!(server.session_state(id), SessionState::Removed);

            // Only an explicit Disconnect leaves a live link to close.
            let expected_closed = if trigger == 2 { vec![handle] } else { vec![] };
            assert_eq!(server.transport().closed, expected_closed);
        }
    }

    #[test]
    fn test_extreme_chunk_coordinates_are_served() {
        let mut server = server_with(4);
        let id = connect(&mut server, 1);
        let positions = [
            ChunkPosition::new(0, i32::MAX, 0),
            ChunkPosition::new(0, i32::MIN, 0),
            ChunkPosition::new(i32::MIN, 0, i32::MAX),
        ];
        for position in positions {
            let payload = ClientPacket::ChunkRequest {
                session_id: id,
                position,
            }
            .build()
            .finish();
            server.on_command(ConnectionHandle(1), &payload);
        }

        for position in positions {
            let report = server.tick();
            assert_eq!(
                report.chunk,
                Some(ChunkOutcome::Sent {
                    position,
                    session_id: id,
                })
            );
            let sent = non_snapshot(server.transport_mut().take());
            assert!(matches!(
                &sent[..],
                [Sent { packet: ServerPacket::ChunkData { position: p, .. }, .. }] if *p == position
            ));
        }
        assert_eq!(server.chunks().len(), 3);
    }

    #[test]
    fn test_position_after_removal_is_noop() {
        let mut server = server_with(4);
        let a = connect(&mut server, 1);
        let b = connect(&mut server, 2);

        server.on_command(ConnectionHandle(1), &position_msg(a, Position::new(1.0, 2.0, 3.0)));
        assert_eq!(
            server.registry().find(a).unwrap().position,
            Position::new(1.0, 2.0, 3.0)
        );

        server.on_disconnect(ConnectionHandle(1));
        server.on_command(ConnectionHandle(1), &position_msg(a, Position::new(9.0, 9.0, 9.0)));

        assert!(server.registry().find(a).is_none());
        assert_eq!(server.registry().find(b).unwrap().position, Position::ZERO);
        assert_eq!(server.registry().len(), 1);
    }

    #[test]
    fn test_commands_for_foreign_sessions_ignored() {
        let mut server = server_with(4);
        let a = connect(&mut server, 1);
        let b = connect(&mut server, 2);

        // Session b's connection tries to move and disconnect session a.
        server.on_command(ConnectionHandle(2), &position_msg(a, Position::ONE));
        server.on_command(ConnectionHandle(2), &chunk_msg(a, 0, 0, 0));
        server.on_command(ConnectionHandle(2), &disconnect_msg(a));

        assert_eq!(server.registry().find(a).unwrap().position, Position::ZERO);
        assert!(server.registry().find(b).is_some());
        assert!(server.queue().is_empty());
        assert!(server.transport().sent.is_empty());
    }

    #[test]
    fn test_one_chunk_per_tick() {
        let mut server = server_with(4);
        let id = connect(&mut server, 5);
        for x in 0..3 {
            server.on_command(ConnectionHandle(5), &chunk_msg(id, x, 0, 0));
        }
        assert_eq!(server.queue().len(), 3);

        for expected_x in 0..3 {
            let report = server.tick();
            assert_eq!(
                report.chunk,
                Some(ChunkOutcome::Sent {
                    position: ChunkPosition::new(expected_x, 0, 0),
                    session_id: id,
                })
            );
            assert_eq!(report.queue_depth, (2 - expected_x) as usize);

            let chunk_sends: Vec<Sent> = non_snapshot(server.transport_mut().take());
            assert_eq!(chunk_sends.len(), 1);
            let sent = &chunk_sends[0];
            assert_eq!(sent.target, Target::One(ConnectionHandle(5)));
            assert_eq!(sent.channel, Channel::CHUNKS);
            assert_eq!(sent.reliability, Reliability::ReliableOrdered);
            match &sent.packet {
                ServerPacket::ChunkData { position, blocks } => {
                    assert_eq!(*position, ChunkPosition::new(expected_x, 0, 0));
                    assert_eq!(blocks.len(), CHUNK_VOLUME);
                    // Bottom layer of the surface chunk is stone.
                    assert_eq!(blocks[0], BlockType::Stone as u8);
                }
                other => panic!("unexpected packet {:?}", other),
            }
        }

        let report = server.tick();
        assert_eq!(report.chunk, None);
        assert_eq!(report.tick, 4);
    }

    #[test]
    fn test_chunk_for_departed_requester_is_generated_not_sent() {
        let mut server = server_with(8);
        let mut id = 0;
        for handle in 1..=7 {
            id = connect(&mut server, handle);
        }
        assert_eq!(id, 7);

        server.on_command(ConnectionHandle(7), &chunk_msg(7, 2, 0, -1));
        server.on_disconnect(ConnectionHandle(7));
        server.transport_mut().take();

        let report = server.tick();
        assert_eq!(
            report.chunk,
            Some(ChunkOutcome::Stale {
                position: ChunkPosition::new(2, 0, -1),
                session_id: 7,
            })
        );
        assert!(server.chunks().get(ChunkPosition::new(2, 0, -1)).is_some());
        assert!(non_snapshot(server.transport_mut().take()).is_empty());
    }

    #[test]
    fn test_tick_snapshot_contents() {
        let mut server = server_with(4);
        let positions = [
            Position::new(1.0, 0.0, 0.0),
            Position::new(0.0, 2.0, 0.0),
            Position::new(0.0, 0.0, 3.0),
        ];
        for (i, position) in positions.iter().enumerate() {
            let handle = i as u64 + 1;
            let id = connect(&mut server, handle);
            server.on_command(ConnectionHandle(handle), &position_msg(id, *position));
        }

        let report = server.tick();
        assert_eq!(report.snapshot_entries, 3);

        let sent = server.transport_mut().take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, Target::All);
        assert_eq!(sent[0].channel, Channel::SNAPSHOTS);
        assert_eq!(sent[0].reliability, Reliability::Unreliable);
        assert_eq!(
            sent[0].packet,
            ServerPacket::Snapshot(vec![
                SnapshotEntry {
                    session_id: 1,
                    position: positions[0],
                },
                SnapshotEntry {
                    session_id: 2,
                    position: positions[1],
                },
                SnapshotEntry {
                    session_id: 3,
                    position: positions[2],
                },
            ])
        );
    }

    #[test]
    fn test_unknown_and_malformed_messages_change_nothing() {
        let mut server = server_with(4);
        let id = connect(&mut server, 1);
        server.on_command(ConnectionHandle(1), &chunk_msg(id, 0, 0, 0));
        let registry_before: Vec<_> = server.registry().iter().cloned().collect();

        server.on_command(ConnectionHandle(1), &[0xEE, 1, 0, 0, 0]);
        server.on_command(ConnectionHandle(1), &[0x13, 1, 0]);
        server.on_command(ConnectionHandle(1), &[]);
        // Truncated position update.
        server.on_command(ConnectionHandle(1), &[0x01, 1, 0, 0, 0, 0, 0]);

        let registry_after: Vec<_> = server.registry().iter().cloned().collect();
        assert_eq!(registry_before, registry_after);
        assert_eq!(server.queue().len(), 1);
        assert!(server.transport().sent.is_empty());
    }

    #[test]
    fn test_chunk_request_cap() {
        let mut server = server_with(4);
        let id = connect(&mut server, 1);
        for x in 0..6 {
            server.on_command(ConnectionHandle(1), &chunk_msg(id, x, 0, 0));
        }
        // Per-session cap of 4.
        assert_eq!(server.queue().len(), 4);
        assert_eq!(server.queue().pending_for(id), 4);

        let report = server.tick();
        assert_eq!(
            report.chunk,
            Some(ChunkOutcome::Sent {
                position: ChunkPosition::ZERO,
                session_id: id,
            })
        );
    }

    #[test]
    fn test_handle_event_dispatch() {
        let mut server = server_with(4);
        let handle = ConnectionHandle(3);

        server.handle_event(TransportEvent::Connected(handle));
        server.handle_event(TransportEvent::Command {
            handle,
            payload: position_msg(1, Position::new(0.5, 0.5, 0.5)),
        });
        assert_eq!(
            server.registry().find(1).unwrap().position,
            Position::new(0.5, 0.5, 0.5)
        );

        server.handle_event(TransportEvent::TimedOut(handle));
        assert!(server.registry().is_empty());
        let packets: Vec<ServerPacket> = server
            .transport_mut()
            .take()
            .into_iter()
            .map(|s| s.packet)
            .collect();
        assert_eq!(
            packets,
            vec![
                ServerPacket::AssignedId(1),
                ServerPacket::PeerJoined(1),
                ServerPacket::PeerLeft(1),
            ]
        );
    }
}
