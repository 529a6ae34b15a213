//! Primitive payload encoding shared with apt-worker.
//!
//! Every value is a sequence of native-endian `i32` words:
//! - int/bool: one word
//! - string: a length word (`-1` for an absent string), then the bytes padded
//!   with zeros to the next 4-byte boundary
//!
//! The domain payloads built from these primitives are opaque to this crate.

use std::borrow::Cow;

use bytes::{Buf, BufMut, Bytes, BytesMut};

const WORD: usize = 4;

fn padded(len: usize) -> usize {
    len.div_ceil(WORD) * WORD
}

/// Builds a request payload.
#[derive(Debug, Default)]
pub struct RequestEncoder {
    buf: BytesMut,
}

impl RequestEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode_int(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_ne(value);
        self
    }

    pub fn encode_bool(&mut self, value: bool) -> &mut Self {
        self.encode_int(i32::from(value))
    }

    pub fn encode_string(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(s) => self.encode_bytes(s.as_bytes()),
            None => self.encode_int(-1),
        }
    }

    /// Length-prefixed, zero-padded raw bytes.
    ///
    /// Buffers longer than `i32::MAX` cannot be represented on the wire; the
    /// frame codec rejects payloads of that size long before this matters.
    pub fn encode_bytes(&mut self, value: &[u8]) -> &mut Self {
        let len = i32::try_from(value.len()).unwrap_or(i32::MAX);
        self.buf.put_i32_ne(len);
        self.buf.extend_from_slice(value);
        self.buf.put_bytes(0, padded(value.len()) - value.len());
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads primitives from a response payload.
///
/// Reading past the end never panics: it yields a zero value and marks the
/// decoder corrupted. The flag is sticky, so callers may decode a whole
/// record and check `corrupted()` once.
#[derive(Debug, Clone)]
pub struct ResponseDecoder<'a> {
    buf: &'a [u8],
    corrupted: bool,
}

impl<'a> ResponseDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            corrupted: false,
        }
    }

    pub fn decode_int(&mut self) -> i32 {
        if self.corrupted || self.buf.len() < WORD {
            self.corrupted = true;
            return 0;
        }
        self.buf.get_i32_ne()
    }

    pub fn decode_bool(&mut self) -> bool {
        self.decode_int() != 0
    }

    /// `None` for an absent string or when the payload is corrupted.
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn decode_string(&mut self) -> Option<Cow<'a, str>> {
        self.decode_bytes().map(String::from_utf8_lossy)
    }

    pub fn decode_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.decode_int();
        if self.corrupted || len < 0 {
            return None;
        }
        let len = len as usize;
        let span = padded(len);
        if self.buf.len() < span {
            self.corrupted = true;
            return None;
        }
        let (value, rest) = self.buf.split_at(span);
        self.buf = rest;
        Some(&value[..len])
    }

    pub fn at_end(&self) -> bool {
        self.corrupted || self.buf.is_empty()
    }

    pub fn corrupted(&self) -> bool {
        self.corrupted
    }
}
