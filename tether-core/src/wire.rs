//! Framing: little-endian length prefix (4 bytes unless configured) + opaque payload.
//!
//! Both endpoints use the same byte order. The header is decoded into a plain
//! integer and checked against the configured maximum before it is ever used
//! as a slicing bound, so an adversarial length cannot trigger a huge allocation.

use bytes::{Buf, Bytes, BytesMut};

pub const DEFAULT_HEADER_SIZE: usize = 4;
pub const MAX_HEADER_SIZE: usize = 8;
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Header width and payload limit shared by encoder and decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    header_size: usize,
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            header_size: DEFAULT_HEADER_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN as usize,
        }
    }
}

/// Invalid codec parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("header size {0} is not in 1..={MAX_HEADER_SIZE}")]
    HeaderSize(usize),
    #[error("max frame length {max} does not fit in a {header_size}-byte header")]
    MaxLenUnrepresentable { max: u64, header_size: usize },
}

impl FrameCodec {
    pub fn new(header_size: usize, max_frame_len: u32) -> Result<Self, CodecError> {
        if header_size == 0 || header_size > MAX_HEADER_SIZE {
            return Err(CodecError::HeaderSize(header_size));
        }
        if u64::from(max_frame_len) > header_limit(header_size) {
            return Err(CodecError::MaxLenUnrepresentable {
                max: u64::from(max_frame_len),
                header_size,
            });
        }
        Ok(Self {
            header_size,
            max_frame_len: max_frame_len as usize,
        })
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Encode `payload` into one frame: header (payload length) followed by the payload.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, FrameEncodeError> {
        if payload.len() > self.max_frame_len {
            return Err(FrameEncodeError::TooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        let mut out = BytesMut::with_capacity(self.header_size + payload.len());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes()[..self.header_size]);
        out.extend_from_slice(payload);
        Ok(out.freeze())
    }

    /// Peek the declared payload length at the front of `bytes`.
    /// `Ok(None)` while fewer than a header's worth of bytes are present.
    pub fn peek_len(&self, bytes: &[u8]) -> Result<Option<usize>, FrameDecodeError> {
        if bytes.len() < self.header_size {
            return Ok(None);
        }
        let mut le = [0u8; MAX_HEADER_SIZE];
        le[..self.header_size].copy_from_slice(&bytes[..self.header_size]);
        let len = u64::from_le_bytes(le);
        if len > self.max_frame_len as u64 {
            return Err(FrameDecodeError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        Ok(Some(len as usize))
    }

    /// Remove one complete frame from the front of `buffer`, if there is one.
    /// An incomplete frame leaves `buffer` untouched.
    pub fn take_frame(&self, buffer: &mut BytesMut) -> Result<Option<Bytes>, FrameDecodeError> {
        let Some(len) = self.peek_len(buffer)? else {
            return Ok(None);
        };
        if buffer.len() < self.header_size + len {
            return Ok(None);
        }
        buffer.advance(self.header_size);
        Ok(Some(buffer.split_to(len).freeze()))
    }

    /// Append `new_bytes` to `buffer` and drain every complete frame, in wire order.
    /// On error the connection is unusable; frames decoded before the bad header are dropped,
    /// use [`RecvBuffer::next_frame`] when they must still be dispatched.
    pub fn feed(
        &self,
        buffer: &mut BytesMut,
        new_bytes: &[u8],
    ) -> Result<Vec<Bytes>, FrameDecodeError> {
        buffer.extend_from_slice(new_bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.take_frame(buffer)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

fn header_limit(header_size: usize) -> u64 {
    if header_size >= MAX_HEADER_SIZE {
        u64::MAX
    } else {
        (1u64 << (8 * header_size)) - 1
    }
}

/// Encode with the default codec (4-byte header, 16 MiB limit).
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameEncodeError> {
    FrameCodec::default().encode(payload)
}

/// Error encoding a payload into a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("payload of {len} bytes exceeds frame limit of {max}")]
    TooLarge { len: usize, max: usize },
}

/// Protocol violation found while decoding. Fatal for the connection it came from.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("declared frame length {len} exceeds limit of {max}")]
    TooLarge { len: u64, max: usize },
}

/// Per-connection accumulator of not-yet-framed bytes.
#[derive(Debug)]
pub struct RecvBuffer {
    codec: FrameCodec,
    buf: BytesMut,
}

impl RecvBuffer {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buf: BytesMut::new(),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameDecodeError> {
        self.codec.take_frame(&mut self.buf)
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>, FrameDecodeError> {
        self.codec.feed(&mut self.buf, bytes)
    }

    /// Bytes still waiting for the rest of their frame.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
