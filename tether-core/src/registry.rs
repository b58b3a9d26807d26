//! Server-side connection registry: one receive buffer and one heartbeat timestamp per
//! accepted connection, keyed by connection identity (never by remote address).
//!
//! Host-driven like the rest of the core: the host passes socket bytes and the current
//! time, and owns whatever handle `H` it needs to write to or close the socket.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::heartbeat::{self, Inbound};
use crate::wire::{FrameCodec, FrameDecodeError, RecvBuffer};

/// Identity of one accepted connection. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One accepted connection.
#[derive(Debug)]
pub struct Connection<H> {
    peer: SocketAddr,
    buffer: RecvBuffer,
    last_heartbeat: Instant,
    handle: H,
}

impl<H> Connection<H> {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    /// Bytes buffered for a frame that has not fully arrived.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn into_handle(self) -> H {
        self.handle
    }
}

/// Outcome of feeding bytes for one connection.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Received {
    /// Application frames, in wire order.
    pub data: Vec<Bytes>,
    /// Heartbeats seen in this batch.
    pub heartbeats: usize,
    /// Set when a bad header stopped decoding; the connection must be closed.
    /// Frames in `data` precede the bad header and are still valid.
    pub error: Option<FrameDecodeError>,
}

#[derive(Debug)]
pub struct Registry<H> {
    codec: FrameCodec,
    connections: HashMap<ConnectionId, Connection<H>>,
    next_id: u64,
}

impl<H> Registry<H> {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            connections: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Register a freshly accepted socket: empty buffer, heartbeat timestamp `now`.
    pub fn insert(&mut self, peer: SocketAddr, handle: H, now: Instant) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.connections.insert(
            id,
            Connection {
                peer,
                buffer: RecvBuffer::new(self.codec),
                last_heartbeat: now,
                handle,
            },
        );
        id
    }

    /// Feed bytes read from `id` and classify every complete frame. Heartbeats move the
    /// liveness timestamp to `now`; everything else is returned for dispatch.
    /// `None` if `id` is no longer registered (closed or evicted meanwhile).
    pub fn on_bytes(&mut self, id: ConnectionId, bytes: &[u8], now: Instant) -> Option<Received> {
        let conn = self.connections.get_mut(&id)?;
        conn.buffer.extend(bytes);
        let mut received = Received::default();
        loop {
            match conn.buffer.next_frame() {
                Ok(Some(frame)) => match heartbeat::classify(frame) {
                    Inbound::Heartbeat => {
                        conn.last_heartbeat = now;
                        received.heartbeats += 1;
                    }
                    Inbound::Data(payload) => received.data.push(payload),
                },
                Ok(None) => break,
                Err(e) => {
                    received.error = Some(e);
                    break;
                }
            }
        }
        Some(received)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection<H>> {
        self.connections.remove(&id)
    }

    /// Evict every connection whose last heartbeat is more than `threshold` before `now`.
    /// Stale ids are collected first and removed afterwards; ids that vanished in
    /// between are skipped. Returned in id order.
    pub fn sweep(&mut self, now: Instant, threshold: Duration) -> Vec<(ConnectionId, Connection<H>)> {
        let mut stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| heartbeat::is_stale(c.last_heartbeat, now, threshold))
            .map(|(id, _)| *id)
            .collect();
        stale.sort_unstable();
        stale
            .into_iter()
            .filter_map(|id| self.connections.remove(&id).map(|c| (id, c)))
            .collect()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection<H>> {
        self.connections.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &Connection<H>)> {
        self.connections.iter().map(|(id, c)| (*id, c))
    }

    /// Remove everything, e.g. on shutdown.
    pub fn drain(&mut self) -> Vec<(ConnectionId, Connection<H>)> {
        let mut all: Vec<_> = self.connections.drain().collect();
        all.sort_unstable_by_key(|(id, _)| *id);
        all
    }
}
