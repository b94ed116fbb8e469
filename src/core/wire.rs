//! Checked big-endian primitive encoding.
//!
//! All multi-byte integers on the wire are big-endian. A `bytes` field is a
//! `u32` length prefix followed by that many raw bytes; a `string` is the
//! same with the payload required to be UTF-8 (no terminator). Nullable
//! fields are a `u8` flag followed by the encoded value only when the flag
//! is non-zero. The flag byte is read and written at the call sites, since
//! its presence is part of each packet's layout.
//!
//! Reads are bounds-checked: running off the end of a body is a
//! [`ProxyError::ShortBody`], which is fatal to the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProxyError, Result};

/// Cursor over a packet body with checked reads.
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left unread in the body.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(ProxyError::ShortBody);
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    /// Length-prefixed byte field.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        self.ensure(len)?;
        let mut out = vec![0u8; len];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Length-prefixed UTF-8 string field.
    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw).map_err(|_| ProxyError::InvalidString)
    }

    /// Assert the whole body has been consumed. Packet layouts are exact;
    /// trailing bytes mean the peer encoded something we do not understand.
    pub fn finish(&self) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(ProxyError::TrailingBody);
        }
        Ok(())
    }
}

/// Growable packet-body writer. The frame length prefix is added by the
/// codec, not here.
#[derive(Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_bytes(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.buf.put_slice(value);
    }

    pub fn put_string(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}
