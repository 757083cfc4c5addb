//! Byte-stream transports shared by the instrument drivers.
//!
//! Every session-based driver talks to its instrument through a [`Link`]: a buffered,
//! type-erased stream that may be a serial port, a TCP socket, a USB-TMC character
//! device, or an in-memory duplex stream in tests.
//!
//! # Types
//!
//! - [`StreamIO`]: trait alias combining `AsyncRead + AsyncWrite`
//! - [`DynStream`]: type-erased boxed stream
//! - [`Link`]: buffered stream with the query helpers drivers need
//!
//! # Utilities
//!
//! - [`serial::open_serial`]: open a serial port with spawn_blocking
//! - [`connect_tcp`]: open a TCP socket
//! - [`resource::resolve`]: map VISA-style resource strings to native transports

pub mod resource;
pub mod serial;

use crate::error::DeviceError;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::trace;

/// Trait alias for async byte-stream I/O.
///
/// This includes `tokio_serial::SerialStream`, `tokio::net::TcpStream`,
/// `tokio::fs::File` and `tokio::io::DuplexStream` (testing).
pub trait StreamIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIO for T {}

/// Type-erased boxed stream.
pub type DynStream = Box<dyn StreamIO>;

/// Buffered instrument connection.
pub struct Link {
    inner: BufReader<DynStream>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("buffered", &self.inner.buffer().len())
            .finish()
    }
}

impl Link {
    /// Wrap a stream.
    pub fn new(stream: DynStream) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    /// Write the whole buffer and flush.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        trace!(tx = ?String::from_utf8_lossy(bytes), "send");
        let stream = self.inner.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read up to and including `delimiter`.
    ///
    /// A closed stream is a transient error; the session is reopened after enough
    /// failed cycles.
    pub async fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>, DeviceError> {
        let mut buf = Vec::new();
        let n = self.inner.read_until(delimiter, &mut buf).await?;
        if n == 0 {
            return Err(DeviceError::transient("connection closed by instrument"));
        }
        trace!(rx = ?String::from_utf8_lossy(&buf), "recv");
        Ok(buf)
    }

    /// Read one `\n`-terminated line as text, terminator included.
    pub async fn read_line(&mut self) -> Result<String, DeviceError> {
        let bytes = self.read_until(b'\n').await?;
        String::from_utf8(bytes)
            .map_err(|_| DeviceError::malformed("response is not valid UTF-8"))
    }

    /// Send `command` and read one line; the returned text is trimmed.
    pub async fn query_line(&mut self, command: &str) -> Result<String, DeviceError> {
        self.send(command.as_bytes()).await?;
        Ok(self.read_line().await?.trim().to_string())
    }

    /// Read exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, DeviceError> {
        let mut buf = vec![0u8; n];
        self.inner.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                DeviceError::transient(format!("short response, expected {} bytes", n))
            } else {
                DeviceError::from(e)
            }
        })?;
        trace!(rx = ?buf, "recv");
        Ok(buf)
    }

    /// Collect whatever arrives until the line stays quiet for `idle`.
    ///
    /// Returns as soon as `limit` bytes are collected. Used for instruments that stream
    /// frames continuously or answer with a variable number of bytes.
    pub async fn read_available(&mut self, idle: Duration, limit: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 256];
        while out.len() < limit {
            match tokio::time::timeout(idle, self.inner.read(&mut chunk)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => out.extend_from_slice(&chunk[..n]),
            }
        }
        out
    }

    /// Discard stale input, buffered or still arriving.
    ///
    /// Needed before every query on RS-485 multidrop lines and after a cycle that was
    /// cut off mid-response.
    pub async fn drain(&mut self, timeout: Duration) -> usize {
        let buffered = self.inner.buffer().len();
        self.inner.consume(buffered);
        let discarded = buffered + drain_stream(self.inner.get_mut(), timeout).await;
        if discarded > 0 {
            trace!(bytes = discarded, "Discarded stale input");
        }
        discarded
    }

    /// Shut down the write half so the peer sees a clean close.
    pub async fn shutdown(&mut self) -> Result<(), DeviceError> {
        self.inner.get_mut().shutdown().await?;
        Ok(())
    }
}

/// Drain stale data from a stream until nothing arrives within `timeout`.
pub async fn drain_stream<R: AsyncRead + Unpin>(port: &mut R, timeout: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + timeout;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break, // no more immediate data
        }
    }

    total_discarded
}

/// Open a TCP connection to an instrument.
pub async fn connect_tcp(host: &str, port: u16) -> Result<DynStream, DeviceError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| DeviceError::connection(format!("{}:{}: {}", host, port, e)))?;
    stream
        .set_nodelay(true)
        .map_err(|e| DeviceError::connection(e.to_string()))?;
    Ok(Box::new(stream))
}
