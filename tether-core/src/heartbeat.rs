//! Liveness: a reserved payload sent on a fixed interval, tracked by time only.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::wire::{FrameCodec, FrameEncodeError};

/// Heartbeat sentinel. A frame whose payload is exactly these bytes is never
/// handed to the application.
pub const HEARTBEAT_PAYLOAD: [u8; 4] = [0xab, 0xcd, 0x00, 0x00];

/// A decoded frame, sorted by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Heartbeat,
    Data(Bytes),
}

pub fn is_heartbeat(payload: &[u8]) -> bool {
    payload == HEARTBEAT_PAYLOAD
}

pub fn classify(payload: Bytes) -> Inbound {
    if is_heartbeat(&payload) {
        Inbound::Heartbeat
    } else {
        Inbound::Data(payload)
    }
}

/// The full heartbeat frame (header + sentinel) for `codec`.
pub fn heartbeat_frame(codec: &FrameCodec) -> Result<Bytes, FrameEncodeError> {
    codec.encode(&HEARTBEAT_PAYLOAD)
}

/// True once more than `threshold` has passed since `last_heartbeat`.
pub fn is_stale(last_heartbeat: Instant, now: Instant, threshold: Duration) -> bool {
    now.saturating_duration_since(last_heartbeat) > threshold
}
