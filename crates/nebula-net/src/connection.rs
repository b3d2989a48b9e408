//! Byte-stream connection over a non-blocking TCP socket.
//!
//! A [`Connection`] owns exactly one socket and is driven by a single owning
//! thread. It exposes both blocking (`read_all`, `write_all`, `flush`) and
//! non-blocking (`read_no_int`, `read_ready`) primitives, plus a one-way
//! switch into zlib-compressed mode. Framing is left to the caller.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::compression::CompressionAdapter;
use crate::error::{NetError, NetResult, OpenError};
use crate::platform::{SocketConfig, configure_stream};
use crate::poll_group::{PollHandle, Pollable, TransportKind};
use crate::sys;

/// Pending compressed output above which `write_all` writes without waiting for `flush`.
const COMPRESSED_HIGH_WATER: usize = 64 * 1024;

/// Byte counts for one stream-level operation.
///
/// `bytes` is what the caller sees (after decompression / before
/// compression); `raw_bytes` is what crossed the wire during the call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    /// Stream-level bytes read or accepted.
    pub bytes: usize,
    /// On-wire bytes received or written.
    pub raw_bytes: usize,
}

impl Transferred {
    /// Build a count pair.
    pub const fn new(bytes: usize, raw_bytes: usize) -> Self {
        Self { bytes, raw_bytes }
    }

    /// Whether nothing moved in either direction.
    pub const fn is_empty(&self) -> bool {
        self.bytes == 0 && self.raw_bytes == 0
    }
}

/// Outcome of a single non-blocking `recv`.
enum Recv {
    Data(usize),
    WouldBlock,
    Eof,
}

/// A reliable, ordered byte stream to one peer.
pub struct Connection {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    compression: Option<Box<CompressionAdapter>>,
    /// The peer has shut down its sending side.
    eof: bool,
    write_timeout: Option<Duration>,
}

impl Connection {
    /// Wrap a connected stream, switching it to non-blocking mode.
    pub(crate) fn from_stream(stream: TcpStream, config: &SocketConfig) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        configure_stream(&stream, config)?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            stream,
            peer,
            compression: None,
            eof: false,
            write_timeout: config.write_timeout,
        })
    }

    /// Connect to the first reachable address in `addrs`, each attempt bounded by `timeout`.
    ///
    /// Returns the error of the last attempt when none succeeds.
    pub fn open_any(
        addrs: &[SocketAddr],
        timeout: Duration,
        config: &SocketConfig,
    ) -> io::Result<Self> {
        let mut last_err =
            io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to");
        for addr in addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(stream) => {
                    tracing::debug!("Connected to {addr}");
                    return Self::from_stream(stream, config);
                }
                Err(e) => {
                    tracing::debug!("Connect to {addr} failed: {e}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Resolve `host` and connect synchronously.
    ///
    /// Blocks the calling thread; see [`AsyncConnector`](crate::AsyncConnector)
    /// for the non-blocking variant.
    pub fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        config: &SocketConfig,
    ) -> NetResult<Self> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| OpenError::resolve(host, &e))?
            .collect();
        if addrs.is_empty() {
            let err = io::Error::new(io::ErrorKind::NotFound, "no addresses found");
            return Err(OpenError::resolve(host, &err).into());
        }
        Self::open_any(&addrs, timeout, config)
            .map_err(|e| OpenError::connect(host, port, &e).into())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Read exactly `buf.len()` stream-level bytes.
    ///
    /// Waits at most `timeout` in total (`None` waits indefinitely). Returns
    /// `buf.len()` on success; [`NetError::TimedOut`] or [`NetError::Closed`]
    /// otherwise. Bytes read before a failure are discarded.
    pub fn read_all(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> NetResult<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut filled = 0;

        while filled < buf.len() {
            let got = self.read_no_int(&mut buf[filled..])?;
            if got.bytes > 0 {
                filled += got.bytes;
                continue;
            }
            if self.read_disconnected() {
                return Err(NetError::Closed);
            }
            if got.raw_bytes > 0 {
                // The decoder swallowed wire bytes without output yet; try again
                // before sleeping on the socket.
                continue;
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(NetError::TimedOut);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            if !sys::wait_readable(self.raw_socket(), remaining)? {
                return Err(NetError::TimedOut);
            }
        }

        Ok(filled)
    }

    /// One uninterrupted, non-blocking read of up to `buf.len()` stream-level bytes.
    ///
    /// `Ok` with `bytes == 0` means nothing is available right now; at end of
    /// stream it additionally marks the connection disconnected.
    pub fn read_no_int(&mut self, buf: &mut [u8]) -> NetResult<Transferred> {
        if buf.is_empty() {
            return Ok(Transferred::default());
        }

        let Some(adapter) = self.compression.as_deref_mut() else {
            return match recv(&self.stream, buf)? {
                Recv::Data(n) => {
                    tracing::trace!("read {n} bytes");
                    Ok(Transferred::new(n, n))
                }
                Recv::WouldBlock => Ok(Transferred::default()),
                Recv::Eof => {
                    self.eof = true;
                    Ok(Transferred::default())
                }
            };
        };

        let mut raw = 0;
        loop {
            if adapter.decompression_need_input() {
                if raw > 0 || self.eof {
                    return Ok(Transferred::new(0, raw));
                }
                match recv(&self.stream, adapter.decompression_input_window())? {
                    Recv::Data(n) => {
                        adapter.reset_decompression_stream_input_size(n);
                        raw = n;
                    }
                    Recv::WouldBlock => return Ok(Transferred::default()),
                    Recv::Eof => {
                        self.eof = true;
                        return Ok(Transferred::default());
                    }
                }
            }

            let produced = adapter.decompress(buf)?;
            if produced > 0 || !adapter.decompression_need_input() {
                tracing::trace!("read {produced} bytes ({raw} on wire)");
                return Ok(Transferred::new(produced, raw));
            }
        }
    }

    /// Whether a read would return immediately.
    pub fn read_ready(&self) -> bool {
        if let Some(adapter) = self.compression.as_deref()
            && !adapter.decompression_need_input()
        {
            return true;
        }
        sys::wait_readable(self.raw_socket(), Some(Duration::ZERO)).unwrap_or(false)
    }

    /// True once the peer closed its side and every received byte was drained.
    pub fn read_disconnected(&self) -> bool {
        self.eof
            && self
                .compression
                .as_deref()
                .is_none_or(|adapter| adapter.decompression_need_input())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Hand all of `buf` to the stream, blocking until it is accepted.
    ///
    /// In compressed mode the bytes are compressed and held until
    /// [`flush`](Self::flush) unless the pending output grows past a
    /// high-water mark.
    ///
    /// With a [write timeout](Self::set_write_timeout) set, a peer that stops
    /// draining yields [`NetError::TimedOut`]. Part of `buf` may already be on
    /// the wire by then, so the stream is no longer usable.
    pub fn write_all(&mut self, buf: &[u8]) -> NetResult<Transferred> {
        let deadline = self.write_deadline();
        let Some(adapter) = self.compression.as_deref_mut() else {
            send_all(&self.stream, buf, deadline)?;
            tracing::trace!("wrote {} bytes", buf.len());
            return Ok(Transferred::new(buf.len(), buf.len()));
        };

        adapter.compress(buf)?;
        let mut raw = 0;
        if adapter.compression_out_buffer().len() >= COMPRESSED_HIGH_WATER {
            raw = send_pending(&self.stream, adapter, deadline)?;
        }
        Ok(Transferred::new(buf.len(), raw))
    }

    /// Emit every buffered compressed byte; returns the bytes physically written.
    ///
    /// Plain connections write through immediately, so this returns 0 for them.
    pub fn flush(&mut self) -> NetResult<usize> {
        let deadline = self.write_deadline();
        let Some(adapter) = self.compression.as_deref_mut() else {
            return Ok(0);
        };
        adapter.flush_compression_stream()?;
        let raw = send_pending(&self.stream, adapter, deadline)?;
        tracing::trace!("flushed {raw} compressed bytes");
        Ok(raw)
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// Switch every later read and write into compressed mode.
    ///
    /// Irreversible. Calling it again has no effect beyond a warning.
    pub fn enable_compression(&mut self) -> NetResult<()> {
        if self.compression.is_some() {
            tracing::warn!("Compression already enabled for {}", self.text_address());
            return Ok(());
        }
        let mut adapter = Box::new(CompressionAdapter::new());
        adapter.initialize()?;
        self.compression = Some(adapter);
        tracing::debug!("Compression enabled for {}", self.text_address());
        Ok(())
    }

    /// Whether [`enable_compression`](Self::enable_compression) has been called.
    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    /// Bound every later `write_all` / `flush` call; `None` waits indefinitely.
    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    /// Current bound on blocking writes.
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    /// Enable (`true`) or disable write coalescing.
    pub fn use_nagle_algorithm(&mut self, enable: bool) -> NetResult<()> {
        self.stream.set_nodelay(!enable)?;
        Ok(())
    }

    /// Peer IP as text, or an empty string when unknown.
    pub fn text_address(&self) -> String {
        self.peer
            .map(|addr| addr.ip().to_canonical().to_string())
            .unwrap_or_default()
    }

    /// Full peer socket address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Transport family of this connection.
    pub fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn raw_socket(&self) -> sys::RawSocket {
        sys::raw_socket(&self.stream)
    }

    fn write_deadline(&self) -> Option<Instant> {
        self.write_timeout.map(|t| Instant::now() + t)
    }
}

impl Pollable for Connection {
    fn poll_handle(&self) -> PollHandle {
        PollHandle::new(self.kind(), self.raw_socket())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("compressed", &self.is_compressed())
            .field("eof", &self.eof)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::trace!("Closing connection to {}", self.text_address());
    }
}

fn recv(mut stream: &TcpStream, buf: &mut [u8]) -> io::Result<Recv> {
    loop {
        match stream.read(buf) {
            Ok(0) => return Ok(Recv::Eof),
            Ok(n) => return Ok(Recv::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Recv::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write all of `buf` on a non-blocking socket, waiting for writability until `deadline`.
fn send_all(mut stream: &TcpStream, mut buf: &[u8], deadline: Option<Instant>) -> NetResult<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                if !sys::wait_writable(sys::raw_socket(stream), remaining)? {
                    return Err(NetError::TimedOut);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn send_pending(
    stream: &TcpStream,
    adapter: &mut CompressionAdapter,
    deadline: Option<Instant>,
) -> NetResult<usize> {
    let pending = adapter.compression_out_buffer().len();
    if pending == 0 {
        return Ok(0);
    }
    send_all(stream, adapter.compression_out_buffer(), deadline)?;
    adapter.consume_compressed(pending);
    Ok(pending)
}
