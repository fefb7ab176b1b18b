//! Variable-length integer and byte-array primitives for the wire format.
//!
//! Layout matches the lib0 encoding used by Yjs peers:
//! ```text
//! varuint   : LEB128, 7 bits per byte, high bit = continuation
//! varbytes  : varuint length | bytes
//! varstring : varbytes of UTF-8
//! ```

use crate::protocol::ProtocolError;

/// Growable buffer writer for the protocol primitives.
#[derive(Debug, Default)]
pub struct BytesWriter {
    buf: Vec<u8>,
}

impl BytesWriter {
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(32) }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    #[inline]
    pub fn push_byte(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    #[inline]
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Encode an unsigned LEB128 integer.
    pub fn push_var_uint(&mut self, mut n: u64) {
        loop {
            let byte = (n & 0x7f) as u8;
            n >>= 7;
            if n == 0 {
                self.push_byte(byte);
                break;
            }
            self.push_byte(byte | 0x80);
        }
    }

    #[inline]
    pub fn push_var_bytes(&mut self, bytes: &[u8]) {
        self.push_var_uint(bytes.len() as u64);
        self.push_bytes(bytes);
    }

    #[inline]
    pub fn push_var_string(&mut self, s: &str) {
        self.push_var_bytes(s.as_bytes());
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a borrowed byte slice.
///
/// Every read either advances past a complete value or fails without
/// consuming anything meaningful; callers drop the whole message on error.
#[derive(Debug, Clone)]
pub struct BytesReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BytesReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unread tail of the buffer.
    #[must_use]
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        let byte = *self.buf.get(self.pos).ok_or(ProtocolError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.buf[start..self.pos])
    }

    pub fn read_var_uint(&mut self) -> Result<u64, ProtocolError> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_byte()?;
            let low = u64::from(byte & 0x7f);
            if shift >= 64 || (shift == 63 && low > 1) {
                return Err(ProtocolError::VarintOverflow);
            }
            result |= low << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_var_uint()?;
        let len = usize::try_from(len).map_err(|_| ProtocolError::UnexpectedEof)?;
        self.read_bytes(len)
    }

    pub fn read_var_string(&mut self) -> Result<&'a str, ProtocolError> {
        let bytes = self.read_var_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }
}
