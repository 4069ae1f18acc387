use super::CommandCode;
use crate::error::{Error, Result};
use crate::io::{Buffer, MSG_MAX};
use crate::protocol::codec::{self, FAILURE_MARKER};
use crate::store::HashTable;
use crate::sync::LockMode;
use std::io::{self, ErrorKind, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Room for the status token and the length token of a GET response
const RESPONSE_HEADROOM: usize = 64;

/// First pause after the socket buffer fills up
const SEND_BACKOFF_START: Duration = Duration::from_micros(50);
const SEND_BACKOFF_MAX: Duration = Duration::from_millis(10);

/// A peer that accepts nothing for this long is given up on
const SEND_STALL_LIMIT: Duration = Duration::from_secs(5);

/// Executes wire frames against the table
///
/// Every frame gets exactly one response: a status token (plus the value
/// for a successful GET), or the single failure byte when the command code
/// itself cannot be read.
#[derive(Clone)]
pub struct CommandExecutor {
    table: Arc<HashTable>,
}

impl CommandExecutor {
    pub fn new(table: Arc<HashTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<HashTable> {
        &self.table
    }

    /// Execute the frame at the read cursor of `frame` and send the response.
    ///
    /// `Ok` means the frame was consumed and answered, whatever its status.
    /// An error means the rest of `frame` cannot be trusted and should be
    /// dropped; I/O errors additionally leave `sink` unusable.
    pub fn dispatch<W: Write>(&self, frame: &mut Buffer, sink: &mut W) -> Result<()> {
        let code = match codec::decode_int(frame) {
            Ok(code) => code,
            Err(e) => {
                debug!("dispatch: unreadable command code: {}", e);
                send(sink, &[FAILURE_MARKER])?;
                return Err(e);
            }
        };

        trace!("dispatch: cmd = {}", code);

        match CommandCode::from_code(code) {
            CommandCode::Get => self.process_get(frame, sink),
            CommandCode::Set => self.process_set(frame, sink),
            _ => {
                debug!("dispatch: unknown command {}", code);
                send(sink, &[FAILURE_MARKER])?;
                Err(Error::UnknownCommand(code))
            }
        }
    }

    fn process_get<W: Write>(&self, frame: &mut Buffer, sink: &mut W) -> Result<()> {
        let key = match codec::decode_str(frame) {
            Ok(key) => key,
            Err(e) => {
                send_status(sink, e.code())?;
                return Err(e);
            }
        };
        let key = frame.slice(key);

        match self.table.get(key, LockMode::Shared) {
            Ok(entry) => {
                let value = entry.value();
                let mut out = Buffer::with_capacity(MSG_MAX.max(value.len() + RESPONSE_HEADROOM));
                let encoded =
                    codec::encode_int(&mut out, 0).and_then(|_| codec::encode_str(&mut out, value));
                entry.release()?;

                match encoded {
                    Ok(()) => send(sink, out.readable()),
                    Err(e) => send_status(sink, e.code()),
                }
            }
            Err(e) => {
                trace!("process get: {}", e);
                send_status(sink, e.code())
            }
        }
    }

    fn process_set<W: Write>(&self, frame: &mut Buffer, sink: &mut W) -> Result<()> {
        let (key, value) = match codec::decode_str(frame)
            .and_then(|key| codec::decode_str(frame).map(|value| (key, value)))
        {
            Ok(spans) => spans,
            Err(e) => {
                send_status(sink, e.code())?;
                return Err(e);
            }
        };

        let status = match self.table.set(
            frame.slice(key),
            frame.slice(value),
            LockMode::Exclusive,
        ) {
            Ok(entry) => entry.release().map(|_| 0).unwrap_or_else(|e| e.code()),
            Err(e) => {
                debug!("process set: {}", e);
                e.code()
            }
        };

        send_status(sink, status)
    }
}

fn send_status<W: Write>(sink: &mut W, status: u64) -> Result<()> {
    let mut out = Buffer::new();
    codec::encode_int(&mut out, status)?;
    send(sink, out.readable())
}

/// Write all of `bytes`, retrying transient failures.
///
/// A full socket buffer backs off exponentially. A peer that takes nothing
/// for [`SEND_STALL_LIMIT`] fails the send with `TimedOut`.
pub(crate) fn send<W: Write>(sink: &mut W, bytes: &[u8]) -> Result<()> {
    send_within(sink, bytes, SEND_STALL_LIMIT)
}

fn send_within<W: Write>(sink: &mut W, bytes: &[u8], stall_limit: Duration) -> Result<()> {
    let mut sent = 0;
    let mut backoff = SEND_BACKOFF_START;
    let mut stalled_since: Option<Instant> = None;

    while sent < bytes.len() {
        match sink.write(&bytes[sent..]) {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(n) => {
                sent += n;
                backoff = SEND_BACKOFF_START;
                stalled_since = None;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                let since = *stalled_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= stall_limit {
                    debug!("send: peer took nothing for {:?}", stall_limit);
                    return Err(io::Error::from(ErrorKind::TimedOut).into());
                }
                thread::sleep(backoff);
                backoff = (backoff * 2).min(SEND_BACKOFF_MAX);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
