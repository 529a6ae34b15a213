//! Framed codec for worker communication.
//!
//! Fixed 16-byte header (command, state, sequence, length as native-endian
//! `i32`, no padding, no checksum) followed by exactly `length` payload bytes.
//! Works over any AsyncRead/AsyncWrite (FIFOs in production, duplex in tests).

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{Frame, HEADER_LEN};

/// Upper bound on a single payload. A corrupt header must not make us buffer gigabytes.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("negative payload length {0}")]
    NegativeLength(i32),
    #[error("payload of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Codec that frames requests and responses with the fixed header.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }

    pub fn with_max_payload_len(mut self, max: usize) -> Self {
        self.max_payload_len = max;
        self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let command = header.get_i32_ne();
        let state = header.get_i32_ne();
        let sequence = header.get_i32_ne();
        let length = header.get_i32_ne();

        let len = usize::try_from(length).map_err(|_| FrameError::NegativeLength(length))?;
        if len > self.max_payload_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_payload_len,
            });
        }

        let frame_len = HEADER_LEN + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        Ok(Some(Frame {
            command,
            state,
            sequence,
            payload,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(FrameError::Truncated {
                buffered: buf.len(),
            }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame.payload.len();
        if len > self.max_payload_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_payload_len,
            });
        }
        let length = i32::try_from(len).map_err(|_| FrameError::TooLarge {
            len,
            max: i32::MAX as usize,
        })?;

        tracing::trace!(
            command = frame.command,
            sequence = frame.sequence,
            payload_bytes = len,
            "Encoding frame"
        );

        dst.reserve(HEADER_LEN + len);
        dst.put_i32_ne(frame.command);
        dst.put_i32_ne(frame.state);
        dst.put_i32_ne(frame.sequence);
        dst.put_i32_ne(length);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
