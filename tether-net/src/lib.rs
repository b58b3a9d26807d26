//! Tether over TCP: a [`Client`] that heartbeats and a [`Server`] that evicts silent peers.

pub mod client;
pub mod config;
pub mod error;
pub mod server;

pub use client::{channel_listener, ChannelListener, Client, ClientEvent, Listener};
pub use config::Config;
pub use error::{Error, Result};
pub use server::{channel_handler, ChannelHandler, Handler, Server, ServerEvent};
pub use tether_core::{ConnectionId, ConnectionState, ProtocolConfig};
