use crate::error::{Error, Result};
use std::fmt;

/// Largest frame exchanged in one read or write
pub const MSG_MAX: usize = 4096;

/// Byte range inside a [`Buffer`], handed out by decoders instead of a copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Fixed-capacity linear buffer with a read cursor and a write cursor.
///
/// Bytes between `sp` and `ep` are readable, bytes after `ep` are free.
/// Nothing is ever moved; [`Buffer::clear`] rewinds both cursors.
pub struct Buffer {
    data: Box<[u8]>,
    sp: usize,
    ep: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(MSG_MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            sp: 0,
            ep: 0,
        }
    }

    /// Buffer holding a copy of `bytes`, ready to be decoded
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = Self::with_capacity(bytes.len().max(MSG_MAX));
        buf.data[..bytes.len()].copy_from_slice(bytes);
        buf.ep = bytes.len();
        buf
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Unread bytes
    pub fn len(&self) -> usize {
        self.ep - self.sp
    }

    pub fn is_empty(&self) -> bool {
        self.sp == self.ep
    }

    /// Bytes still writable
    pub fn free(&self) -> usize {
        self.data.len() - self.ep
    }

    /// Read cursor offset
    pub fn position(&self) -> usize {
        self.sp
    }

    pub fn clear(&mut self) {
        self.sp = 0;
        self.ep = 0;
    }

    pub fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.free() {
            return Err(Error::InvalidArgument("buffer full"));
        }
        self.data[self.ep..self.ep + bytes.len()].copy_from_slice(bytes);
        self.ep += bytes.len();
        Ok(())
    }

    pub fn put_u8(&mut self, byte: u8) -> Result<()> {
        self.put(&[byte])
    }

    /// Writable tail, to be filled directly by a socket read
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.ep..]
    }

    /// Mark `n` bytes of the writable tail as filled.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.free());
        self.ep = (self.ep + n).min(self.data.len());
    }

    pub fn readable(&self) -> &[u8] {
        &self.data[self.sp..self.ep]
    }

    /// Byte at `offset` past the read cursor
    pub fn peek(&self, offset: usize) -> Option<u8> {
        self.readable().get(offset).copied()
    }

    /// Consume `n` readable bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.sp = (self.sp + n).min(self.ep);
    }

    /// Drop everything still unread.
    pub fn discard(&mut self) {
        self.sp = self.ep;
    }

    pub fn slice(&self, span: Span) -> &[u8] {
        &self.data[span.start..span.end()]
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.data.len())
            .field("sp", &self.sp)
            .field("ep", &self.ep)
            .finish()
    }
}
