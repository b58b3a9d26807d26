//! Tether protocol core: length-prefixed framing, heartbeat liveness, connection state.
//! Host-driven: no I/O; the host feeds socket bytes and timestamps in and acts on what comes back.

pub mod config;
pub mod heartbeat;
pub mod registry;
pub mod state;
pub mod wire;

pub use config::{ConfigError, ProtocolConfig};
pub use heartbeat::{classify, is_heartbeat, Inbound, HEARTBEAT_PAYLOAD};
pub use registry::{Connection, ConnectionId, Received, Registry};
pub use state::{ClientMachine, ConnectionState, Epoch, TransitionError};
pub use wire::{encode_frame, FrameCodec, FrameDecodeError, FrameEncodeError, RecvBuffer};
