//! Outbound connection: connect, send frames, heartbeat on a timer, surface inbound frames.
//!
//! `connect`, `send` and `disconnect` never block on the network. Status changes and
//! inbound frames are queued in order and handed to the [`Listener`] from a dedicated
//! dispatch task, so a slow listener never stalls the socket and a listener may call
//! back into the client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tether_core::heartbeat::{self, Inbound};
use tether_core::{ClientMachine, ConnectionState, Epoch, FrameCodec, ProtocolConfig, RecvBuffer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::error::{Error, Result};

const READ_CHUNK: usize = 8 * 1024;

/// Receives connection status changes and inbound application frames.
/// Called from the client's dispatch task, one call at a time, in arrival order.
pub trait Listener: Send + Sync + 'static {
    fn on_status_changed(&self, state: ConnectionState);
    fn on_data(&self, payload: Bytes);
    /// Why a connect attempt failed. Followed by `on_status_changed(Disconnected)`.
    fn on_connect_failed(&self, _error: &Error) {}
}

/// Listener callbacks as values, for consumers that prefer a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Status(ConnectionState),
    Data(Bytes),
    ConnectFailed(String),
}

pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl Listener for ChannelListener {
    fn on_status_changed(&self, state: ConnectionState) {
        let _ = self.tx.send(ClientEvent::Status(state));
    }

    fn on_data(&self, payload: Bytes) {
        let _ = self.tx.send(ClientEvent::Data(payload));
    }

    fn on_connect_failed(&self, error: &Error) {
        let _ = self.tx.send(ClientEvent::ConnectFailed(error.to_string()));
    }
}

/// A listener that forwards every callback into an unbounded channel.
pub fn channel_listener() -> (Arc<ChannelListener>, mpsc::UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelListener { tx }), rx)
}

enum Notice {
    Status(ConnectionState),
    Data(Bytes),
    ConnectFailed(Error),
}

/// Everything tied to one connect attempt. Dropping it ends the attempt's dispatch queue.
struct Session {
    outbound: mpsc::UnboundedSender<Bytes>,
    notices: mpsc::UnboundedSender<Notice>,
    task: JoinHandle<()>,
}

struct Inner {
    machine: ClientMachine,
    session: Option<Session>,
}

impl Inner {
    fn notify(&self, notice: Notice) {
        if let Some(s) = &self.session {
            let _ = s.notices.send(notice);
        }
    }
}

struct Shared {
    codec: FrameCodec,
    heartbeat_interval: Duration,
    heartbeat_enabled: AtomicBool,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_connected(&self, epoch: Epoch) -> bool {
        let mut inner = self.lock();
        match inner.machine.on_connected(epoch) {
            Some(state) => {
                inner.notify(Notice::Status(state));
                true
            }
            None => false,
        }
    }

    fn mark_connect_failed(&self, epoch: Epoch, error: Error) {
        let mut inner = self.lock();
        if let Some(state) = inner.machine.on_connect_failed(epoch) {
            inner.notify(Notice::ConnectFailed(error));
            inner.notify(Notice::Status(state));
            inner.session = None;
        }
    }

    fn mark_closed(&self, epoch: Epoch) {
        let mut inner = self.lock();
        if let Some(state) = inner.machine.on_closed(epoch) {
            inner.notify(Notice::Status(state));
            inner.session = None;
        }
    }

    fn deliver(&self, epoch: Epoch, payload: Bytes) {
        let inner = self.lock();
        if inner.machine.is_current(epoch) {
            inner.notify(Notice::Data(payload));
        }
    }

    fn heartbeat_due(&self, epoch: Epoch) -> bool {
        self.heartbeat_enabled.load(Ordering::Relaxed) && self.lock().machine.is_current(epoch)
    }
}

/// One outbound connection. Owned by whoever drives it; dropping it disconnects.
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub fn new(protocol: &ProtocolConfig) -> Result<Self> {
        let codec = protocol.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                codec,
                heartbeat_interval: protocol.heartbeat_interval(),
                heartbeat_enabled: AtomicBool::new(true),
                inner: Mutex::new(Inner {
                    machine: ClientMachine::new(),
                    session: None,
                }),
            }),
        })
    }

    /// Bind `listener` and start connecting to `host:port`. Returns immediately; the
    /// outcome arrives through the listener. An existing session is disconnected first.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, listener: Arc<dyn Listener>, host: &str, port: u16) {
        self.disconnect();
        let addr = format!("{host}:{port}");
        let mut inner = self.shared.lock();
        let epoch = match inner.machine.start_connect() {
            Ok(epoch) => epoch,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "connect ignored");
                return;
            }
        };
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let _ = notices.send(Notice::Status(ConnectionState::Connecting));
        tokio::spawn(dispatch(listener, notices_rx));
        tracing::info!(%addr, "connecting");
        let task = tokio::spawn(run_session(self.shared.clone(), epoch, addr, outbound_rx));
        inner.session = Some(Session {
            outbound,
            notices,
            task,
        });
    }

    /// Encode `payload` as one frame and queue it for writing.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let frame = self.shared.codec.encode(payload)?;
        let inner = self.shared.lock();
        if !inner.machine.is_connected() {
            return Err(Error::NotConnected);
        }
        let session = inner.session.as_ref().ok_or(Error::NotConnected)?;
        session.outbound.send(frame).map_err(|_| Error::NotConnected)
    }

    /// Close the connection or abandon the attempt in progress. Safe from any state;
    /// only a real transition is reported to the listener.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        if let Some(state) = inner.machine.disconnect() {
            inner.notify(Notice::Status(state));
            tracing::info!("disconnected");
        }
        if let Some(session) = inner.session.take() {
            session.task.abort();
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().machine.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().machine.is_connected()
    }

    /// Suspend or resume heartbeat emission without touching the connection.
    pub fn set_heartbeat_enabled(&self, enabled: bool) {
        self.shared.heartbeat_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.shared.heartbeat_enabled.load(Ordering::Relaxed)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn dispatch(listener: Arc<dyn Listener>, mut notices: mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            Notice::Status(state) => listener.on_status_changed(state),
            Notice::Data(payload) => listener.on_data(payload),
            Notice::ConnectFailed(error) => listener.on_connect_failed(&error),
        }
    }
}

async fn run_session(
    shared: Arc<Shared>,
    epoch: Epoch,
    addr: String,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    let stream = match TcpStream::connect(addr.as_str()).await {
        Ok(s) => s,
        Err(source) => {
            tracing::warn!(%addr, error = %source, "connect failed");
            shared.mark_connect_failed(epoch, Error::Connect { addr, source });
            return;
        }
    };
    if !shared.mark_connected(epoch) {
        return;
    }
    tracing::info!(%addr, "connected");
    let _ = stream.set_nodelay(true);
    match drive(&shared, epoch, stream, &mut outbound).await {
        Ok(()) => tracing::info!(%addr, "connection closed by server"),
        Err(e) => tracing::warn!(%addr, error = %e, "connection lost"),
    }
    shared.mark_closed(epoch);
}

/// Read, write and heartbeat on one established socket until it closes.
async fn drive(
    shared: &Shared,
    epoch: Epoch,
    stream: TcpStream,
    outbound: &mut mpsc::UnboundedReceiver<Bytes>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut recv = RecvBuffer::new(shared.codec);
    let heartbeat = heartbeat::heartbeat_frame(&shared.codec)?;
    let period = shared.heartbeat_interval;
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            n = reader.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    return Ok(());
                }
                recv.extend(&buf[..n]);
                while let Some(frame) = recv.next_frame()? {
                    match heartbeat::classify(frame) {
                        Inbound::Heartbeat => tracing::debug!("heartbeat from server"),
                        Inbound::Data(payload) => shared.deliver(epoch, payload),
                    }
                }
            }
            _ = ticker.tick() => {
                if shared.heartbeat_due(epoch) {
                    writer.write_all(&heartbeat).await?;
                    tracing::debug!("heartbeat sent");
                }
            }
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    writer.write_all(&frame).await?;
                    tracing::trace!(len = frame.len(), "frame written");
                }
                None => return Ok(()),
            },
        }
    }
}
