//! # Connection
//!
//! Purpose: Wrap one byte stream with the buffers the codec needs, and keep
//! the transport details (timeouts, shutdown, dialing) out of the codec.
//!
//! ## Design Principles
//! 1. **Buffer Reuse**: Line and request buffers live on the connection.
//! 2. **One In Flight**: A request is fully answered before the next is sent.
//! 3. **Transport Seam**: The codec only needs `Transport`; TCP is one impl.
//! 4. **Fail Fast**: Short reads and missing CRLFs surface immediately.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};
use crate::meta::FlagRegistry;

pub(crate) const CRLF: &[u8] = b"\r\n";

/// Byte stream a `Connection` runs on.
pub trait Transport: Read + Write + Send + 'static {
    /// Applies a read/write timeout to subsequent I/O; `None` blocks forever.
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Shuts the stream down. Called when the pool drops the connection.
    fn close(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Creates connections for the pool.
pub trait ConnectionFactory<T: Transport>: Send + Sync + 'static {
    fn connect(&self) -> ClientResult<Connection<T>>;
}

impl<T, F> ConnectionFactory<T> for F
where
    T: Transport,
    F: Fn() -> ClientResult<Connection<T>> + Send + Sync + 'static,
{
    fn connect(&self) -> ClientResult<Connection<T>> {
        self()
    }
}

/// Dials TCP connections to a single server.
pub struct TcpConnector {
    addr: String,
    connect_timeout: Option<Duration>,
    registry: Arc<FlagRegistry>,
}

impl TcpConnector {
    pub fn new(
        addr: impl Into<String>,
        connect_timeout: Option<Duration>,
        registry: Arc<FlagRegistry>,
    ) -> Self {
        TcpConnector {
            addr: addr.into(),
            connect_timeout,
            registry,
        }
    }
}

impl ConnectionFactory<TcpStream> for TcpConnector {
    fn connect(&self) -> ClientResult<Connection<TcpStream>> {
        let addrs = self
            .addr
            .to_socket_addrs()
            .map_err(|_| ClientError::InvalidAddress(self.addr.clone()))?;

        let mut last_err = None;
        for addr in addrs {
            let attempt = match self.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    // Disable Nagle to keep request latency low for small payloads.
                    stream.set_nodelay(true)?;
                    debug!(%addr, "dialed memcache server");
                    return Ok(Connection::new(stream, Arc::clone(&self.registry)));
                }
                Err(err) => last_err = Some(err),
            }
        }

        match last_err {
            Some(err) => Err(err.into()),
            None => Err(ClientError::InvalidAddress(self.addr.clone())),
        }
    }
}

/// Longest status or `VALUE` line accepted from the server, CRLF included.
pub(crate) const MAX_LINE_LEN: usize = 8 * 1024;

/// Single server session with reusable buffers.
pub struct Connection<T: Transport = TcpStream> {
    // Writes go through `get_mut`, so one buffered wrapper serves both directions.
    reader: BufReader<T>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    // Bounds the whole exchange; every syscall gets only the time left.
    deadline: Option<Instant>,
    registry: Arc<FlagRegistry>,
}

impl<T: Transport> Connection<T> {
    /// Wraps a transport; `registry` parses meta response flags.
    pub fn new(transport: T, registry: Arc<FlagRegistry>) -> Self {
        Connection {
            reader: BufReader::new(transport),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            deadline: None,
            registry,
        }
    }

    /// Bounds every later read and write by `deadline` until cleared.
    ///
    /// Fails with `Timeout` if the deadline has already passed.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) -> ClientResult<()> {
        self.deadline = deadline;
        if deadline.is_none() {
            self.reader.get_ref().set_timeout(None)?;
            return Ok(());
        }
        self.arm()
    }

    /// Resets the transport to blocking I/O with no timeout.
    pub fn clear_deadline(&mut self) -> ClientResult<()> {
        self.deadline = None;
        self.reader.get_ref().set_timeout(None)?;
        Ok(())
    }

    /// Shuts the transport down.
    pub fn close(&self) {
        if let Err(err) = self.reader.get_ref().close() {
            trace!(error = %err, "closing memcache connection");
        }
    }

    pub(crate) fn registry(&self) -> &FlagRegistry {
        &self.registry
    }

    /// Clears and returns the request buffer.
    pub(crate) fn request(&mut self) -> &mut Vec<u8> {
        self.write_buf.clear();
        &mut self.write_buf
    }

    /// Writes the request buffer to the transport.
    pub(crate) fn send(&mut self) -> ClientResult<()> {
        if tracing::enabled!(tracing::Level::TRACE) {
            let end = self
                .write_buf
                .windows(2)
                .position(|w| w == CRLF)
                .unwrap_or(self.write_buf.len());
            trace!(command = %String::from_utf8_lossy(&self.write_buf[..end]), "send");
        }
        let mut written = 0;
        while written < self.write_buf.len() {
            self.arm()?;
            match self.reader.get_mut().write(&self.write_buf[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.arm()?;
        self.reader.get_mut().flush()?;
        Ok(())
    }

    /// Reads one CRLF-terminated line and returns it without the terminator.
    pub(crate) fn read_line(&mut self) -> ClientResult<&[u8]> {
        self.line_buf.clear();
        loop {
            if self.fill()? == 0 {
                if self.line_buf.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed connection",
                    )
                    .into());
                }
                break;
            }
            let available = self.reader.buffer();
            let (used, done) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            self.line_buf.extend_from_slice(&available[..used]);
            self.reader.consume(used);
            if self.line_buf.len() > MAX_LINE_LEN {
                return Err(ClientError::CorruptResponse(format!(
                    "response line longer than {MAX_LINE_LEN} bytes"
                )));
            }
            if done {
                break;
            }
        }
        if !self.line_buf.ends_with(CRLF) {
            return Err(ClientError::CorruptResponse(format!(
                "line not terminated by CRLF: {:?}",
                String::from_utf8_lossy(&self.line_buf)
            )));
        }
        let len = self.line_buf.len() - CRLF.len();
        Ok(&self.line_buf[..len])
    }

    /// Reads a `size`-byte data block plus its trailing CRLF.
    ///
    /// The buffer grows with the bytes actually received, so an announced
    /// size never allocates ahead of the data.
    pub(crate) fn read_payload(&mut self, size: usize) -> ClientResult<Vec<u8>> {
        let total = size.checked_add(CRLF.len()).ok_or_else(|| {
            ClientError::CorruptResponse(format!("data block size {size} out of range"))
        })?;
        let mut data = Vec::with_capacity(total.min(self.reader.capacity()));
        while data.len() < total {
            if self.fill()? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed connection inside a data block",
                )
                .into());
            }
            let available = self.reader.buffer();
            let used = available.len().min(total - data.len());
            data.extend_from_slice(&available[..used]);
            self.reader.consume(used);
        }
        if !data.ends_with(CRLF) {
            return Err(ClientError::CorruptResponse(
                "data block not terminated by CRLF".to_string(),
            ));
        }
        data.truncate(size);
        Ok(data)
    }

    /// Makes buffered bytes available, reading under the deadline when the
    /// buffer is empty. Returns the buffered length; zero means EOF.
    fn fill(&mut self) -> ClientResult<usize> {
        loop {
            if !self.reader.buffer().is_empty() {
                return Ok(self.reader.buffer().len());
            }
            self.arm()?;
            match self.reader.fill_buf() {
                Ok(buf) => return Ok(buf.len()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Pushes the time left until the deadline onto the transport.
    fn arm(&mut self) -> ClientResult<()> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ClientError::Timeout);
        }
        self.reader.get_ref().set_timeout(Some(remaining))?;
        Ok(())
    }
}

/// Appends the decimal form of `value`.
pub(crate) fn push_u64(out: &mut Vec<u8>, mut value: u64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

/// Appends the decimal form of a signed `value`.
pub(crate) fn push_i64(out: &mut Vec<u8>, value: i64) {
    if value < 0 {
        out.push(b'-');
    }
    push_u64(out, value.unsigned_abs());
}

/// Parses an ASCII decimal token.
pub(crate) fn parse_ascii<N: FromStr>(data: &[u8]) -> Option<N> {
    std::str::from_utf8(data).ok()?.parse().ok()
}


#[cfg(test)]
mod tests {
    use super::testing::{scripted, TricklingStream};
    use super::*;

    #[test]
    fn pushes_decimals() {
        let mut buf = Vec::new();
        push_u64(&mut buf, 0);
        buf.push(b' ');
        push_u64(&mut buf, u64::MAX);
        buf.push(b' ');
        push_i64(&mut buf, -1);
        buf.push(b' ');
        push_i64(&mut buf, i64::MIN);
        assert_eq!(
            buf,
            b"0 18446744073709551615 -1 -9223372036854775808".to_vec()
        );
    }

    #[test]
    fn reads_lines_and_payloads() {
        let (mut conn, _) = scripted(b"VALUE k 0 3\r\nabc\r\nEND\r\n");
        assert_eq!(conn.read_line().unwrap(), b"VALUE k 0 3");
        assert_eq!(conn.read_payload(3).unwrap(), b"abc");
        assert_eq!(conn.read_line().unwrap(), b"END");
    }

    #[test]
    fn rejects_unterminated_payload() {
        let (mut conn, _) = scripted(b"abcXY");
        assert!(matches!(
            conn.read_payload(3),
            Err(ClientError::CorruptResponse(_))
        ));
    }

    #[test]
    fn eof_is_io_error() {
        let (mut conn, _) = scripted(b"");
        assert!(matches!(conn.read_line(), Err(ClientError::Io(_))));
    }

    #[test]
    fn deadline_is_pushed_and_cleared() {
        let (mut conn, tap) = scripted(b"");
        conn.set_deadline(Some(Instant::now() + Duration::from_secs(5)))
            .unwrap();
        let timeout = tap.timeout().expect("timeout applied");
        assert!(timeout > Duration::from_secs(4));

        conn.clear_deadline().unwrap();
        assert_eq!(tap.timeout(), None);
    }

    #[test]
    fn elapsed_deadline_fails_before_io() {
        let (mut conn, tap) = scripted(b"");
        let now = Instant::now();
        assert!(matches!(conn.set_deadline(Some(now)), Err(ClientError::Timeout)));
        assert!(tap.written().is_empty());
    }

    #[test]
    fn deadline_bounds_the_whole_read_not_each_syscall() {
        let stream = TricklingStream::new(
            b"VALUE foo 0 3\r\nbar\r\nEND\r\n",
            Duration::from_millis(20),
        );
        let mut conn = Connection::new(stream, Arc::new(FlagRegistry::standard()));
        let start = Instant::now();
        conn.set_deadline(Some(start + Duration::from_millis(100)))
            .unwrap();

        assert!(matches!(conn.read_line(), Err(ClientError::Timeout)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(300), "took {elapsed:?}");
    }

    #[test]
    fn slow_reply_within_deadline_succeeds() {
        let stream = TricklingStream::new(b"END\r\n", Duration::from_millis(1));
        let mut conn = Connection::new(stream, Arc::new(FlagRegistry::standard()));
        conn.set_deadline(Some(Instant::now() + Duration::from_secs(5)))
            .unwrap();
        assert_eq!(conn.read_line().unwrap(), b"END");
    }

    #[test]
    fn oversized_payload_length_is_corrupt() {
        let (mut conn, _) = scripted(b"bar\r\n");
        assert!(matches!(
            conn.read_payload(usize::MAX),
            Err(ClientError::CorruptResponse(_))
        ));
    }

    #[test]
    fn payload_grows_with_received_bytes() {
        // Announced size far beyond what arrives: EOF, not an allocation failure.
        let (mut conn, _) = scripted(b"bar\r\n");
        assert!(matches!(conn.read_payload(1 << 40), Err(ClientError::Io(_))));
    }

    #[test]
    fn overlong_line_is_corrupt() {
        let reply = vec![b'x'; MAX_LINE_LEN + 64];
        let (mut conn, _) = scripted(&reply);
        assert!(matches!(
            conn.read_line(),
            Err(ClientError::CorruptResponse(_))
        ));
    }

    #[test]
    fn line_split_across_reads_is_reassembled() {
        let stream = TricklingStream::new(b"STORED\r\nEND\r\n", Duration::ZERO);
        let mut conn = Connection::new(stream, Arc::new(FlagRegistry::standard()));
        assert_eq!(conn.read_line().unwrap(), b"STORED");
        assert_eq!(conn.read_line().unwrap(), b"END");
    }

    #[test]
    fn invalid_address_is_reported() {
        let connector = TcpConnector::new(
            "not an address",
            None,
            Arc::new(FlagRegistry::standard()),
        );
        assert!(matches!(
            connector.connect(),
            Err(ClientError::InvalidAddress(_))
        ));
    }
}
