use crate::error::Result;
use crate::protocol::command::{request_get, request_set};
use bytes::Bytes;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use tracing::debug;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:22000";

/// Blocking client for a yari server
///
/// # Example
///
/// ```no_run
/// use yari::Client;
///
/// # fn main() -> yari::Result<()> {
/// let mut client = Client::connect("127.0.0.1:22000")?;
/// client.set(b"xyz", b"1234")?;
/// assert_eq!(&client.get(b"xyz")?[..], b"1234");
/// client.close()?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;

        debug!("connected to {:?}", stream.peer_addr().ok());

        Ok(Self { stream })
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        request_set(&mut self.stream, key, value)
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Bytes> {
        request_get(&mut self.stream, key)
    }

    pub fn close(self) -> Result<()> {
        self.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }
}
