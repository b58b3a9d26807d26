//! Helpers shared by the loopback integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tether_net::{channel_handler, ConnectionId, ProtocolConfig, Server, ServerEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;

pub const WAIT: Duration = Duration::from_secs(5);

/// Short intervals so liveness tests finish in well under a second.
pub fn fast_protocol() -> ProtocolConfig {
    ProtocolConfig {
        heartbeat_interval_ms: 100,
        sweep_interval_ms: 100,
        stale_after_ms: 500,
        ..Default::default()
    }
}

pub async fn start_server(protocol: &ProtocolConfig) -> (Server, UnboundedReceiver<ServerEvent>) {
    let (handler, events) = channel_handler();
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), protocol, handler)
        .await
        .unwrap();
    (server, events)
}

/// Next event, failing the test if none arrives in time.
pub async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Assert that nothing else arrives within `quiet`.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut UnboundedReceiver<T>, quiet: Duration) {
    match tokio::time::timeout(quiet, rx.recv()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(ev)) => panic!("unexpected event {ev:?}"),
    }
}

pub async fn expect_opened(rx: &mut UnboundedReceiver<ServerEvent>) -> (ConnectionId, SocketAddr) {
    match next(rx).await {
        ServerEvent::Opened(id, peer) => (id, peer),
        other => panic!("expected Opened, got {other:?}"),
    }
}

/// Plain socket speaking the wire format by hand.
pub async fn raw_client(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

pub async fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(&frame(payload)).await.unwrap();
}

/// Read one frame; `None` on EOF or reset.
pub async fn read_frame(stream: &mut TcpStream) -> Option<Bytes> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.ok()?;
    let mut payload = vec![0u8; u32::from_le_bytes(header) as usize];
    stream.read_exact(&mut payload).await.ok()?;
    Some(Bytes::from(payload))
}

/// Wait until the peer closes the socket, discarding anything it still sends.
pub async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    tokio::time::timeout(WAIT, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await
    .expect("socket was not closed");
}
