use super::executor::send;
use super::CommandCode;
use crate::error::{Error, Result};
use crate::io::Buffer;
use crate::protocol::codec::{self, FAILURE_MARKER};
use bytes::Bytes;
use std::io::{ErrorKind, Read, Write};
use tracing::trace;

/// Send a SET frame and wait for its status.
pub fn request_set<S: Read + Write>(stream: &mut S, key: &[u8], value: &[u8]) -> Result<()> {
    let mut request = Buffer::new();
    codec::encode_int(&mut request, CommandCode::SET)?;
    codec::encode_str(&mut request, key)?;
    codec::encode_str(&mut request, value)?;

    trace!("request set: {} bytes", request.len());

    exchange(stream, &request, CommandCode::SET, false).map(|_| ())
}

/// Send a GET frame and return the stored value.
///
/// A missing key comes back as [`Error::Status`] carrying the server's code.
pub fn request_get<S: Read + Write>(stream: &mut S, key: &[u8]) -> Result<Bytes> {
    let mut request = Buffer::new();
    codec::encode_int(&mut request, CommandCode::GET)?;
    codec::encode_str(&mut request, key)?;

    trace!("request get: {} bytes", request.len());

    exchange(stream, &request, CommandCode::GET, true).map(Option::unwrap_or_default)
}

fn exchange<S: Read + Write>(
    stream: &mut S,
    request: &Buffer,
    code: u64,
    with_value: bool,
) -> Result<Option<Bytes>> {
    send(stream, request.readable())?;

    let mut response = Buffer::new();

    loop {
        let n = match stream.read(response.spare_mut()) {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        response.commit(n);

        if response.peek(0) == Some(FAILURE_MARKER) {
            return Err(Error::UnknownCommand(code));
        }

        // decode a copy so a short read can be topped up
        let mut probe = Buffer::from_slice(response.readable());
        match decode_response(&mut probe, with_value) {
            Err(Error::InvalidArgument(_)) if response.free() > 0 => continue,
            result => return result,
        }
    }
}

fn decode_response(response: &mut Buffer, with_value: bool) -> Result<Option<Bytes>> {
    let status = codec::decode_int(response)?;

    if status != 0 {
        return Err(Error::Status(status));
    }

    if !with_value {
        return Ok(None);
    }

    let span = codec::decode_str(response)?;
    Ok(Some(Bytes::copy_from_slice(response.slice(span))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Replays canned server bytes and records what the client wrote
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Scripted {
        fn new(input: &[u8]) -> Self {
            Self {
                input: Cursor::new(input.to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            // hand out at most three bytes per read
            let len = buf.len().min(3);
            self.input.read(&mut buf[..len])
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_get_reassembles_short_reads() {
        let mut stream = Scripted::new(b"#:0~#:3~#:abc~");
        let value = request_get(&mut stream, b"key").unwrap();
        assert_eq!(&value[..], b"abc");
        assert_eq!(stream.output, b"#:1~#:3~#:key~");
    }

    #[test]
    fn test_set_status() {
        let mut stream = Scripted::new(b"#:0~");
        request_set(&mut stream, b"k", b"v").unwrap();
        assert_eq!(stream.output, b"#:2~#:1~#:k~#:1~#:v~");

        let mut stream = Scripted::new(b"#:12~");
        assert!(matches!(
            request_set(&mut stream, b"k", b"v"),
            Err(Error::Status(12))
        ));
    }

    #[test]
    fn test_get_failures() {
        let mut stream = Scripted::new(b"#:22~");
        assert!(matches!(
            request_get(&mut stream, b"k"),
            Err(Error::Status(22))
        ));

        let mut stream = Scripted::new(&[FAILURE_MARKER]);
        assert!(matches!(
            request_get(&mut stream, b"k"),
            Err(Error::UnknownCommand(1))
        ));

        let mut stream = Scripted::new(b"#:0~#:5~#:ab");
        assert!(matches!(
            request_get(&mut stream, b"k"),
            Err(Error::ConnectionClosed)
        ));
    }
}
