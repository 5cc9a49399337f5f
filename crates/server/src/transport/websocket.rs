//! WebSocket transport host.
//!
//! Each accepted socket runs in its own task. Tasks report to the server loop
//! through one unbounded channel of [`LinkEvent`]s; the loop feeds them to
//! [`WebSocketHost::accept_event`], which keeps the handle -> link table and
//! turns them into [`TransportEvent`]s. Only the server loop touches the
//! table.

use super::{Channel, ConnectionHandle, Reliability, TransportEvent, TransportHost};
use crate::config::ServerConfig;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

/// Unreliable messages buffered per peer before new ones are dropped.
const UNRELIABLE_QUEUE_DEPTH: usize = 4;

/// Outgoing queues of one connection.
#[derive(Debug)]
pub struct PeerLink {
    addr: SocketAddr,
    reliable: mpsc::UnboundedSender<Bytes>,
    unreliable: mpsc::Sender<Bytes>,
}

/// What a connection task reports.
#[derive(Debug)]
pub enum LinkEvent {
    Opened {
        handle: ConnectionHandle,
        link: PeerLink,
    },
    Frame {
        handle: ConnectionHandle,
        payload: Bytes,
    },
    Closed {
        handle: ConnectionHandle,
        timed_out: bool,
    },
}

/// Receiving half handed to the server loop.
pub struct HostEvents {
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
    /// Accept loop; finishes only on a listener failure.
    pub accept_task: JoinHandle<anyhow::Result<()>>,
}

/// Connection tracking state (shared across connection handlers).
struct ConnectionState {
    /// Number of connections per IP address.
    ip_connections: HashMap<IpAddr, usize>,
    /// Total number of connections.
    total_connections: usize,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            ip_connections: HashMap::new(),
            total_connections: 0,
        }
    }

    /// Try to add a connection, returns true if allowed.
    fn try_add_connection(&mut self, ip: IpAddr, max_total: usize, max_per_ip: usize) -> bool {
        if self.total_connections >= max_total {
            return false;
        }

        let current = self.ip_connections.get(&ip).copied().unwrap_or(0);
        if current >= max_per_ip {
            return false;
        }

        *self.ip_connections.entry(ip).or_insert(0) += 1;
        self.total_connections += 1;
        true
    }

    /// Remove a connection.
    fn remove_connection(&mut self, ip: IpAddr) {
        if let Some(count) = self.ip_connections.get_mut(&ip) {
            if *count > 0 {
                *count -= 1;
                self.total_connections = self.total_connections.saturating_sub(1);
            }
            if *count == 0 {
                self.ip_connections.remove(&ip);
            }
        }
    }
}

/// Send side of the WebSocket transport.
#[derive(Debug)]
pub struct WebSocketHost {
    links: HashMap<ConnectionHandle, PeerLink>,
    max_connections: usize,
}

impl WebSocketHost {
    /// Bind the listener and start accepting connections.
    pub async fn listen(config: &ServerConfig) -> anyhow::Result<(Self, HostEvents)> {
        let addr: SocketAddr = format!("{}:{}", config.bind, config.port).parse()?;
        let listener = TcpListener::bind(&addr).await?;
        info!("Listening on ws://{}", addr);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            config.max_connections,
            config.ip_limit,
            Duration::from_secs(config.timeout),
            events_tx,
        ));

        let host = Self::new(config.max_connections);
        Ok((
            host,
            HostEvents {
                events: events_rx,
                accept_task,
            },
        ))
    }

    pub fn new(max_connections: usize) -> Self {
        Self {
            links: HashMap::new(),
            max_connections,
        }
    }

    /// Apply a connection task's report and translate it for the server.
    ///
    /// Frames from handles that were never opened, or already closed, are
    /// dropped.
    pub fn accept_event(&mut self, event: LinkEvent) -> Option<TransportEvent> {
        match event {
            LinkEvent::Opened { handle, link } => {
                debug!("{} opened from {}", handle, link.addr);
                self.links.insert(handle, link);
                Some(TransportEvent::Connected(handle))
            }
            LinkEvent::Frame { handle, payload } => {
                if self.links.contains_key(&handle) {
                    Some(TransportEvent::Command { handle, payload })
                } else {
                    None
                }
            }
            LinkEvent::Closed { handle, timed_out } => {
                let link = self.links.remove(&handle)?;
                if timed_out {
                    info!("{} ({}) timed out", handle, link.addr);
                    Some(TransportEvent::TimedOut(handle))
                } else {
                    debug!("{} ({}) closed", handle, link.addr);
                    Some(TransportEvent::Disconnected(handle))
                }
            }
        }
    }

    fn deliver(
        handle: ConnectionHandle,
        link: &PeerLink,
        data: Bytes,
        channel: Channel,
        reliability: Reliability,
    ) {
        match reliability {
            Reliability::ReliableOrdered => {
                if link.reliable.send(data).is_err() {
                    debug!("{} is closing, dropped reliable send on channel {}", handle, channel.0);
                }
            }
            Reliability::Unreliable => match link.unreliable.try_send(data) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!("{} is behind, dropped unreliable send on channel {}", handle, channel.0);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("{} is closing, dropped unreliable send on channel {}", handle, channel.0);
                }
            },
        }
    }
}

impl TransportHost for WebSocketHost {
    fn send_to_one(
        &mut self,
        handle: ConnectionHandle,
        data: Bytes,
        channel: Channel,
        reliability: Reliability,
    ) {
        match self.links.get(&handle) {
            Some(link) => Self::deliver(handle, link, data, channel, reliability),
            None => debug!("Send to unknown {} dropped", handle),
        }
    }

    fn send_to_all(&mut self, data: Bytes, channel: Channel, reliability: Reliability) {
        for (handle, link) in &self.links {
            // Bytes clones share the same buffer.
            Self::deliver(*handle, link, data.clone(), channel, reliability);
        }
    }

    fn close(&mut self, handle: ConnectionHandle) {
        // Dropping the senders ends the connection task once its reliable
        // queue is drained.
        if let Some(link) = self.links.remove(&handle) {
            debug!("Closing {} ({})", handle, link.addr);
        }
    }

    fn connection_count(&self) -> usize {
        self.links.len()
    }

    fn max_connections(&self) -> usize {
        self.max_connections
    }
}

async fn accept_loop(
    listener: TcpListener,
    max_connections: usize,
    ip_limit: usize,
    idle_timeout: Duration,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> anyhow::Result<()> {
    let conn_state = Arc::new(RwLock::new(ConnectionState::new()));
    let mut next_handle = 1u64;

    loop {
        let (stream, addr) = listener.accept().await?;
        let ip = addr.ip();

        {
            let mut state = conn_state.write().await;
            if !state.try_add_connection(ip, max_connections, ip_limit) {
                warn!("Connection rejected (limit reached): {}", addr);
                continue;
            }
        }

        let handle = ConnectionHandle(next_handle);
        next_handle += 1;

        let conn_state = Arc::clone(&conn_state);
        let events = events.clone();
        tokio::spawn(async move {
            let result = handle_connection(stream, addr, handle, idle_timeout, events).await;

            // Always remove from connection tracking when done
            {
                let mut state = conn_state.write().await;
                state.remove_connection(ip);
            }

            if let Err(e) = result {
                error!("Connection error from {}: {}", addr, e);
            }
        });
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: ConnectionHandle,
    idle_timeout: Duration,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    info!("New connection {} from {}", handle, addr);

    let (mut write, mut read) = ws_stream.split();
    let (reliable_tx, mut reliable_rx) = mpsc::unbounded_channel::<Bytes>();
    let (unreliable_tx, mut unreliable_rx) = mpsc::channel::<Bytes>(UNRELIABLE_QUEUE_DEPTH);

    events.send(LinkEvent::Opened {
        handle,
        link: PeerLink {
            addr,
            reliable: reliable_tx,
            unreliable: unreliable_tx,
        },
    })?;

    let mut deadline = Instant::now() + idle_timeout;
    let timed_out = loop {
        tokio::select! {
            msg = timeout_at(deadline, read.next()) => {
                if let Ok(Some(Ok(_))) = &msg {
                    deadline = Instant::now() + idle_timeout;
                }
                match msg {
                    Err(_) => break true,
                    Ok(Some(Ok(Message::Binary(payload)))) => {
                        if events.send(LinkEvent::Frame { handle, payload }).is_err() {
                            break false;
                        }
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break false,
                    Ok(Some(Err(e))) => {
                        warn!("WebSocket error from {}: {}", addr, e);
                        break false;
                    }
                    // Text and control frames still count as activity.
                    Ok(Some(Ok(_))) => {}
                }
            }
            data = reliable_rx.recv() => {
                let Some(data) = data else {
                    // Closed by the server.
                    if let Err(e) = write.close().await {
                        debug!("Close handshake with {} failed: {}", addr, e);
                    }
                    break false;
                };
                if let Err(e) = write.send(Message::Binary(data)).await {
                    warn!("Failed to send to {}: {}", addr, e);
                    break false;
                }
            }
            Some(data) = unreliable_rx.recv() => {
                if let Err(e) = write.send(Message::Binary(data)).await {
                    warn!("Failed to send to {}: {}", addr, e);
                    break false;
                }
            }
        }
    };

    // The server loop may already be gone during shutdown.
    let _ = events.send(LinkEvent::Closed { handle, timed_out });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> (
        PeerLink,
        mpsc::UnboundedReceiver<Bytes>,
        mpsc::Receiver<Bytes>,
    ) {
        let (reliable, reliable_rx) = mpsc::unbounded_channel();
        let (unreliable, unreliable_rx) = mpsc::channel(UNRELIABLE_QUEUE_DEPTH);
        let link = PeerLink {
            addr: "127.0.0.1:4000".parse().unwrap(),
            reliable,
            unreliable,
        };
        (link, reliable_rx, unreliable_rx)
    }

    #[test]
    fn test_connection_limits() {
        let mut state = ConnectionState::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(state.try_add_connection(a, 3, 2));
        assert!(state.try_add_connection(a, 3, 2));
        assert!(!state.try_add_connection(a, 3, 2));
        assert!(state.try_add_connection(b, 3, 2));
        assert!(!state.try_add_connection(b, 3, 2));

        state.remove_connection(a);
        assert_eq!(state.total_connections, 2);
        assert!(state.try_add_connection(b, 3, 2));
    }

    #[test]
    fn test_event_translation() {
        let mut host = WebSocketHost::new(8);
        let handle = ConnectionHandle(1);
        let (link, _reliable_rx, _unreliable_rx) = link();

        // Frames before open are dropped.
        assert_eq!(
            host.accept_event(LinkEvent::Frame {
                handle,
                payload: Bytes::from_static(&[1])
            }),
            None
        );

        assert_eq!(
            host.accept_event(LinkEvent::Opened { handle, link }),
            Some(TransportEvent::Connected(handle))
        );
        assert_eq!(host.connection_count(), 1);

        assert_eq!(
            host.accept_event(LinkEvent::Frame {
                handle,
                payload: Bytes::from_static(&[2])
            }),
            Some(TransportEvent::Command {
                handle,
                payload: Bytes::from_static(&[2])
            })
        );

        assert_eq!(
            host.accept_event(LinkEvent::Closed {
                handle,
                timed_out: true
            }),
            Some(TransportEvent::TimedOut(handle))
        );
        assert_eq!(host.connection_count(), 0);

        // A second close for the same handle is swallowed.
        assert_eq!(
            host.accept_event(LinkEvent::Closed {
                handle,
                timed_out: false
            }),
            None
        );
    }

    #[test]
    fn test_unreliable_sends_drop_when_full() {
        let mut host = WebSocketHost::new(8);
        let handle = ConnectionHandle(3);
        let (link, mut reliable_rx, mut unreliable_rx) = link();
        host.accept_event(LinkEvent::Opened { handle, link });

        for i in 0..(UNRELIABLE_QUEUE_DEPTH as u8 + 3) {
            host.send_to_one(
                handle,
                Bytes::from(vec![i]),
                Channel::SNAPSHOTS,
                Reliability::Unreliable,
            );
        }
        for i in 0..10u8 {
            host.send_to_all(Bytes::from(vec![i]), Channel::CONTROL, Reliability::ReliableOrdered);
        }

        let mut unreliable = Vec::new();
        while let Ok(data) = unreliable_rx.try_recv() {
            unreliable.push(data[0]);
        }
        assert_eq!(unreliable, (0..UNRELIABLE_QUEUE_DEPTH as u8).collect::<Vec<_>>());

        let mut reliable = Vec::new();
        while let Ok(data) = reliable_rx.try_recv() {
            reliable.push(data[0]);
        }
        assert_eq!(reliable, (0..10u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_close_flushes_reliable_then_ends_link() {
        use tokio::sync::mpsc::error::TryRecvError;

        let mut host = WebSocketHost::new(8);
        let handle = ConnectionHandle(4);
        let (link, mut reliable_rx, mut unreliable_rx) = link();
        host.accept_event(LinkEvent::Opened { handle, link });

        host.send_to_one(
            handle,
            Bytes::from_static(&[0x12]),
            Channel::CONTROL,
            Reliability::ReliableOrdered,
        );
        host.close(handle);
        assert_eq!(host.connection_count(), 0);

        // Later broadcasts skip the closed link.
        host.send_to_all(Bytes::from_static(&[0x13]), Channel::SNAPSHOTS, Reliability::Unreliable);

        assert_eq!(reliable_rx.try_recv().unwrap().as_ref(), &[0x12]);
        assert_eq!(reliable_rx.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(unreliable_rx.try_recv(), Err(TryRecvError::Disconnected));

        // The task's own close report produces no event.
        assert_eq!(
            host.accept_event(LinkEvent::Closed {
                handle,
                timed_out: false
            }),
            None
        );
    }
}
