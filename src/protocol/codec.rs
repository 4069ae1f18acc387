//! Length-prefixed token codec.
//!
//! A token is `#:<payload>~`. Integers travel as a token holding their
//! decimal digits; byte strings travel as an integer token with the length
//! followed by a token holding the raw bytes:
//!
//! ```text
//! 42        => #:42~
//! b"ab"     => #:2~#:ab~
//! ```

use crate::error::{Error, Result};
use crate::io::{Buffer, Span};
use memchr::memchr;

pub const PREFIX: [u8; 2] = *b"#:";
pub const SUFFIX: u8 = b'~';

/// Prefix and suffix bytes around every payload
const FRAMING: usize = PREFIX.len() + 1;

/// Longest decimal rendering accepted by [`encode_int`]
pub const MAX_DIGITS: usize = 16;

/// Single byte sent back for a frame whose command cannot be dispatched
pub const FAILURE_MARKER: u8 = 0xFF;

fn put_token(buf: &mut Buffer, payload: &[u8]) -> Result<()> {
    if buf.free() < payload.len() + FRAMING {
        return Err(Error::InvalidArgument("no room for token"));
    }

    buf.put(&PREFIX)?;
    buf.put(payload)?;
    buf.put_u8(SUFFIX)
}

pub fn encode_int(buf: &mut Buffer, val: u64) -> Result<()> {
    let mut digits = itoa::Buffer::new();
    let digits = digits.format(val);

    if digits.len() > MAX_DIGITS {
        return Err(Error::InvalidArgument("integer too wide"));
    }

    put_token(buf, digits.as_bytes())
}

/// Encode `bytes` as a length token plus a payload token. Nothing is written
/// unless both fit.
pub fn encode_str(buf: &mut Buffer, bytes: &[u8]) -> Result<()> {
    let mut digits = itoa::Buffer::new();
    let need = digits.format(bytes.len()).len() + bytes.len() + 2 * FRAMING;

    if buf.free() < need {
        return Err(Error::InvalidArgument("no room for string"));
    }

    encode_int(buf, bytes.len() as u64)?;
    put_token(buf, bytes)
}

pub fn decode_int(buf: &mut Buffer) -> Result<u64> {
    let rem = buf.readable();

    if rem.len() <= FRAMING {
        return Err(Error::InvalidArgument("truncated integer token"));
    }

    if rem[..2] != PREFIX {
        return Err(Error::InvalidArgument("bad token prefix"));
    }

    let end = memchr(SUFFIX, &rem[2..])
        .ok_or(Error::InvalidArgument("missing token suffix"))?
        + 2;

    let digits = &rem[2..end];
    if digits.is_empty() {
        return Err(Error::InvalidArgument("empty integer token"));
    }

    let mut val: u64 = 0;
    for &d in digits {
        if !d.is_ascii_digit() {
            return Err(Error::InvalidArgument("non-digit in integer token"));
        }

        val = val
            .checked_mul(10)
            .and_then(|v| v.checked_add(u64::from(d - b'0')))
            .ok_or(Error::InvalidArgument("integer token overflow"))?;
    }

    buf.advance(end + 1);
    Ok(val)
}

/// Decode a string and return where its bytes sit inside `buf`.
pub fn decode_str(buf: &mut Buffer) -> Result<Span> {
    let len = usize::try_from(decode_int(buf)?)
        .map_err(|_| Error::InvalidArgument("string length overflow"))?;

    let rem = buf.readable();
    let total = len
        .checked_add(FRAMING)
        .ok_or(Error::InvalidArgument("string length overflow"))?;

    if rem.len() < total {
        return Err(Error::InvalidArgument("truncated string token"));
    }

    if rem[..2] != PREFIX {
        return Err(Error::InvalidArgument("bad token prefix"));
    }

    if rem[len + 2] != SUFFIX {
        return Err(Error::InvalidArgument("missing token suffix"));
    }

    let span = Span {
        start: buf.position() + 2,
        len,
    };
    buf.advance(total);

    Ok(span)
}
