//! Error types for the tether client and server.

use tether_core::{ConfigError, ConnectionId, FrameDecodeError, FrameEncodeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Server could not open its listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Client could not reach the server.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Peer sent a frame header declaring an over-limit length.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameDecodeError),

    #[error("not connected")]
    NotConnected,

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
