//! Inbound side: accept loop, per-connection reader and writer tasks, stale-connection sweep.
//!
//! The registry is the only state shared between connection tasks and the sweep. Every
//! mutation happens under its lock, and handler events are queued under that same lock,
//! so a connection's data always reaches the handler before its close and the close is
//! reported exactly once no matter who removed the connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tether_core::{ConnectionId, FrameCodec, FrameDecodeError, ProtocolConfig, Registry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::error::{Error, Result};

const READ_CHUNK: usize = 8 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Receives application frames and connection lifecycle events.
/// Called from the server's dispatch task, one call at a time.
pub trait Handler: Send + Sync + 'static {
    fn on_data(&self, id: ConnectionId, payload: Bytes);
    fn on_connection_closed(&self, id: ConnectionId);
    fn on_connection_opened(&self, _id: ConnectionId, _peer: SocketAddr) {}
}

/// Handler callbacks as values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Opened(ConnectionId, SocketAddr),
    Data(ConnectionId, Bytes),
    Closed(ConnectionId),
}

pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl Handler for ChannelHandler {
    fn on_data(&self, id: ConnectionId, payload: Bytes) {
        let _ = self.tx.send(ServerEvent::Data(id, payload));
    }

    fn on_connection_closed(&self, id: ConnectionId) {
        let _ = self.tx.send(ServerEvent::Closed(id));
    }

    fn on_connection_opened(&self, id: ConnectionId, peer: SocketAddr) {
        let _ = self.tx.send(ServerEvent::Opened(id, peer));
    }
}

/// A handler that forwards every callback into an unbounded channel.
pub fn channel_handler() -> (Arc<ChannelHandler>, mpsc::UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelHandler { tx }), rx)
}

/// Registry attachment for one socket. Dropping it closes the connection: the writer
/// drains and shuts down, the reader sees `close` resolve and exits.
struct Peer {
    outbound: mpsc::UnboundedSender<Bytes>,
    _close: oneshot::Sender<()>,
}

struct Shared {
    codec: FrameCodec,
    stale_after: Duration,
    registry: Mutex<Registry<Peer>>,
    events: mpsc::UnboundedSender<ServerEvent>,
    /// Set under the registry lock by `shutdown`; late accepts are refused.
    stopped: AtomicBool,
}

fn now() -> std::time::Instant {
    time::Instant::now().into_std()
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registry<Peer>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, addr: SocketAddr, peer: Peer) -> Option<ConnectionId> {
        let mut registry = self.lock();
        if self.stopped.load(Ordering::Relaxed) {
            return None;
        }
        let id = registry.insert(addr, peer, now());
        let _ = self.events.send(ServerEvent::Opened(id, addr));
        Some(id)
    }

    /// Feed bytes for `id`. `Ok(false)` once `id` is no longer registered.
    fn on_bytes(&self, id: ConnectionId, bytes: &[u8]) -> std::result::Result<bool, FrameDecodeError> {
        let mut registry = self.lock();
        let Some(received) = registry.on_bytes(id, bytes, now()) else {
            return Ok(false);
        };
        if received.heartbeats > 0 {
            tracing::debug!(%id, count = received.heartbeats, "heartbeat");
        }
        for payload in received.data {
            tracing::trace!(%id, len = payload.len(), "frame received");
            let _ = self.events.send(ServerEvent::Data(id, payload));
        }
        match received.error {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    /// Remove `id` and report the close. `false` if someone else already removed it.
    fn close(&self, id: ConnectionId) -> bool {
        let mut registry = self.lock();
        match registry.remove(id) {
            Some(_) => {
                let _ = self.events.send(ServerEvent::Closed(id));
                true
            }
            None => false,
        }
    }

    fn sweep(&self) -> Vec<ConnectionId> {
        let mut registry = self.lock();
        let evicted = registry.sweep(now(), self.stale_after);
        let mut ids = Vec::with_capacity(evicted.len());
        for (id, conn) in evicted {
            tracing::warn!(%id, peer = %conn.peer(), "no heartbeat, evicting");
            let _ = self.events.send(ServerEvent::Closed(id));
            ids.push(id);
        }
        ids
    }
}

/// Listening endpoint plus its accepted connections. Dropping it shuts everything down.
pub struct Server {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Listen on all interfaces at `port`.
    pub async fn listen(
        port: u16,
        protocol: &ProtocolConfig,
        handler: Arc<dyn Handler>,
    ) -> Result<Server> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], port)), protocol, handler).await
    }

    pub async fn bind(
        addr: SocketAddr,
        protocol: &ProtocolConfig,
        handler: Arc<dyn Handler>,
    ) -> Result<Server> {
        let codec = protocol.validate()?;
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            codec,
            stale_after: protocol.stale_after(),
            registry: Mutex::new(Registry::new(codec)),
            events,
            stopped: AtomicBool::new(false),
        });
        tokio::spawn(dispatch(handler, events_rx));
        let tasks = vec![
            tokio::spawn(accept_loop(shared.clone(), listener)),
            tokio::spawn(sweep_loop(shared.clone(), protocol.sweep_interval())),
        ];
        tracing::info!(%local_addr, "listening");
        Ok(Server {
            shared,
            local_addr,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Encode `payload` once and queue it for `id`.
    pub fn send(&self, id: ConnectionId, payload: &[u8]) -> Result<()> {
        let frame = self.shared.codec.encode(payload)?;
        let registry = self.shared.lock();
        let conn = registry.get(id).ok_or(Error::UnknownConnection(id))?;
        conn.handle()
            .outbound
            .send(frame)
            .map_err(|_| Error::UnknownConnection(id))
    }

    /// Encode `payload` once and queue it for every connection. Returns how many got it.
    pub fn broadcast(&self, payload: &[u8]) -> Result<usize> {
        let frame = self.shared.codec.encode(payload)?;
        let registry = self.shared.lock();
        let sent = registry
            .iter()
            .filter(|(_, conn)| conn.handle().outbound.send(frame.clone()).is_ok())
            .count();
        Ok(sent)
    }

    /// Close one connection. `false` if it was not registered.
    pub fn close(&self, id: ConnectionId) -> bool {
        let closed = self.shared.close(id);
        if closed {
            tracing::info!(%id, "connection closed by server");
        }
        closed
    }

    /// Run one stale-connection sweep now instead of waiting for the timer.
    pub fn sweep_now(&self) -> Vec<ConnectionId> {
        self.shared.sweep()
    }

    /// Registered connections and their remote addresses, in id order.
    pub fn connections(&self) -> Vec<(ConnectionId, SocketAddr)> {
        let registry = self.shared.lock();
        let mut out: Vec<_> = registry.iter().map(|(id, c)| (id, c.peer())).collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }

    /// Stop accepting and sweeping, and close every connection. Idempotent.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let mut registry = self.shared.lock();
        self.shared.stopped.store(true, Ordering::Relaxed);
        for (id, _) in registry.drain() {
            let _ = self.shared.events.send(ServerEvent::Closed(id));
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn dispatch(handler: Arc<dyn Handler>, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::Opened(id, peer) => handler.on_connection_opened(id, peer),
            ServerEvent::Data(id, payload) => handler.on_data(id, payload),
            ServerEvent::Closed(id) => handler.on_connection_closed(id),
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(run_connection(shared.clone(), stream, addr));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn sweep_loop(shared: Arc<Shared>, every: Duration) {
    let mut ticker = time::interval_at(time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        shared.sweep();
    }
}

enum ReadEnd {
    PeerClosed,
    Removed,
}

async fn run_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = oneshot::channel();
    let Some(id) = shared.register(
        addr,
        Peer {
            outbound,
            _close: close_tx,
        },
    ) else {
        return;
    };
    tracing::info!(%id, peer = %addr, "connection accepted");
    tokio::spawn(write_loop(id, writer, outbound_rx));
    match read_loop(&shared, id, reader, close_rx).await {
        Ok(ReadEnd::PeerClosed) => {
            if shared.close(id) {
                tracing::info!(%id, "closed by peer");
            }
        }
        Ok(ReadEnd::Removed) => tracing::debug!(%id, "reader stopped after removal"),
        Err(e) => {
            if shared.close(id) {
                tracing::warn!(%id, error = %e, "closing connection");
            }
        }
    }
}

async fn read_loop(
    shared: &Shared,
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    mut close: oneshot::Receiver<()>,
) -> Result<ReadEnd> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            _ = &mut close => return Ok(ReadEnd::Removed),
            n = reader.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    return Ok(ReadEnd::PeerClosed);
                }
                if !shared.on_bytes(id, &buf[..n])? {
                    return Ok(ReadEnd::Removed);
                }
            }
        }
    }
}

async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!(%id, error = %e, "write failed");
            break;
        }
        tracing::trace!(%id, len = frame.len(), "frame written");
    }
    let _ = writer.shutdown().await;
}
