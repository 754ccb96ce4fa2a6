//! Client side terminal relay
//!
//! [`Relay`] holds the two direction buffers and reacts to one readiness
//! event at a time; it never blocks and never assumes a full read or write.
//! [`TerminalProxy`] drives it from a single-threaded loop that waits on the
//! socket and local input together. The loop ends once the remote side has
//! closed *and* everything it sent has reached local output.

use crate::config::ClientParams;
use crate::error::{RdbError, Result};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Largest single read from the socket
pub const CHUNK_SIZE: usize = 1024;

/// Byte counters for one relay run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub sent: u64,
    pub received: u64,
}

/// Per-direction buffers plus the remote-closed flag
#[derive(Debug, Default)]
pub struct Relay {
    outbound: Vec<u8>,
    inbound: Vec<u8>,
    /// Bytes handed to local output that it has not flushed yet
    unflushed: bool,
    closed: bool,
    stats: RelayStats,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn has_inbound(&self) -> bool {
        !self.inbound.is_empty()
    }

    /// Inbound bytes not yet written, or written but not yet flushed
    pub fn has_pending_output(&self) -> bool {
        !self.inbound.is_empty() || self.unflushed
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Remote closed and nothing left to show locally
    pub fn is_finished(&self) -> bool {
        self.closed && !self.has_pending_output()
    }

    /// Socket readable: take up to one chunk. A zero-length read means the peer closed.
    pub fn on_socket_readable<R: Read>(&mut self, socket: &mut R) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let mut chunk = [0u8; CHUNK_SIZE];
        match socket.read(&mut chunk) {
            Ok(0) => {
                self.mark_closed();
                Ok(0)
            }
            Ok(n) => {
                self.inbound.extend_from_slice(&chunk[..n]);
                self.stats.received += n as u64;
                Ok(n)
            }
            Err(e) if is_transient(&e) => Ok(0),
            Err(e) if is_disconnect(&e) => {
                debug!("Socket read failed, treating as closed: {}", e);
                self.mark_closed();
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Socket writable: send what the socket accepts and keep the rest
    pub fn on_socket_writable<W: Write>(&mut self, socket: &mut W) -> io::Result<usize> {
        if self.outbound.is_empty() {
            return Ok(0);
        }
        match socket.write(&self.outbound) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                self.outbound.drain(..n);
                self.stats.sent += n as u64;
                Ok(n)
            }
            Err(e) if is_transient(&e) => Ok(0),
            Err(e) if is_disconnect(&e) => {
                debug!("Socket write failed, treating as closed: {}", e);
                self.mark_closed();
                self.outbound.clear();
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Local input produced bytes for the remote side
    pub fn queue_outbound(&mut self, data: &[u8]) {
        self.outbound.extend_from_slice(data);
    }

    /// Local output writable: write what it accepts and keep the rest.
    ///
    /// A flush that would block is retried on the next call; the bytes the
    /// writer already took stay with it.
    pub fn on_output_writable<W: Write>(&mut self, output: &mut W) -> io::Result<usize> {
        if !self.has_pending_output() {
            return Ok(0);
        }

        let mut written = 0;
        if !self.inbound.is_empty() {
            match output.write(&self.inbound) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.inbound.drain(..n);
                    self.unflushed = true;
                    written = n;
                }
                Err(e) if is_transient(&e) => return Ok(0),
                Err(e) => return Err(e),
            }
        }

        match output.flush() {
            Ok(()) => self.unflushed = false,
            Err(e) if is_transient(&e) => {}
            Err(e) => return Err(e),
        }
        Ok(written)
    }

    fn mark_closed(&mut self) {
        if !self.closed {
            debug!("Remote side closed the connection");
            self.closed = true;
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

/// Non-blocking `Read`/`Write` view of a tokio socket
struct SocketIo<'a>(&'a TcpStream);

impl Read for SocketIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SocketIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Raw descriptor read without taking ownership of it
#[derive(Debug)]
struct RawInput(RawFd);

impl RawInput {
    fn read_raw(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl AsRawFd for RawInput {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Read for RawInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_raw(buf)
    }
}

/// Puts `O_NONBLOCK` on a descriptor and takes it off again on drop
struct NonBlocking {
    fd: RawFd,
    original: libc::c_int,
}

impl NonBlocking {
    fn enable(fd: RawFd) -> io::Result<Self> {
        let original = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if original == -1 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, original | libc::O_NONBLOCK) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd, original })
    }
}

impl Drop for NonBlocking {
    fn drop(&mut self) {
        unsafe {
            libc::fcntl(self.fd, libc::F_SETFL, self.original);
        }
    }
}

/// Writes to a descriptor as if it were blocking, whatever its flags say.
///
/// On a terminal stdin and stdout usually share one open file description,
/// so `O_NONBLOCK` set for stdin shows up on stdout too. Writes that would
/// block wait for `POLLOUT` and go again.
#[derive(Debug)]
pub struct BlockingOutput {
    fd: RawFd,
}

impl BlockingOutput {
    pub fn stdout() -> Self {
        Self {
            fd: libc::STDOUT_FILENO,
        }
    }

    fn wait_writable(&self) -> io::Result<()> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        if unsafe { libc::poll(&mut pfd, 1, -1) } == -1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Write for BlockingOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => {}
                io::ErrorKind::WouldBlock => self.wait_writable()?,
                _ => return Err(err),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum InputSource {
    Polled(AsyncFd<RawInput>),
    /// Never blocks (regular files, in-memory readers)
    Ready(Box<dyn Read + Send>),
}

/// Where the operator's keystrokes come from
pub struct LocalInput {
    source: InputSource,
    _flags: Option<NonBlocking>,
}

impl LocalInput {
    /// The process's stdin, switched to non-blocking mode for the life of the value.
    ///
    /// Must be called inside a tokio runtime.
    pub fn stdin() -> io::Result<Self> {
        Self::polled(libc::STDIN_FILENO)
    }

    fn polled(fd: RawFd) -> io::Result<Self> {
        let flags = NonBlocking::enable(fd)?;
        let source = match AsyncFd::with_interest(RawInput(fd), Interest::READABLE) {
            Ok(polled) => InputSource::Polled(polled),
            // epoll refuses regular files; reading them never blocks anyway
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
                debug!("Input fd {} is not pollable, reading it directly", fd);
                InputSource::Ready(Box::new(RawInput(fd)))
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            source,
            _flags: Some(flags),
        })
    }

    /// Input from a reader that never blocks
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            source: InputSource::Ready(Box::new(reader)),
            _flags: None,
        }
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            InputSource::Polled(fd) => loop {
                let mut guard = fd.readable().await?;
                match guard.try_io(|inner| inner.get_ref().read_raw(buf)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            },
            InputSource::Ready(reader) => reader.read(buf),
        }
    }
}

/// Relays a local terminal to a remote debug session
pub struct TerminalProxy {
    socket: TcpStream,
    peer: SocketAddr,
    relay: Relay,
}

impl TerminalProxy {
    /// One connection attempt, no retries
    pub async fn connect(params: &ClientParams) -> Result<Self> {
        let addr = params.addr();
        let socket = TcpStream::connect(&addr)
            .await
            .map_err(|source| RdbError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let peer = socket.peer_addr()?;
        info!("Connected to remote debugger at {}", peer);
        Ok(Self {
            socket,
            peer,
            relay: Relay::new(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Pump bytes both ways until the remote closes and its output is drained
    pub async fn run<W: Write>(mut self, mut input: LocalInput, output: &mut W) -> Result<RelayStats> {
        let mut chunk = [0u8; CHUNK_SIZE];
        let mut input_open = true;
        let mut write_shut = false;

        while !self.relay.is_finished() {
            if !input_open && !write_shut && !self.relay.has_outbound() && !self.relay.is_closed() {
                // local EOF becomes remote EOF once everything typed has gone out
                if let Err(e) = self.socket.shutdown().await {
                    debug!("Half-close of {} failed: {}", self.peer, e);
                }
                write_shut = true;
            }

            tokio::select! {
                ready = self.socket.readable(), if !self.relay.is_closed() => {
                    ready?;
                    self.relay.on_socket_readable(&mut SocketIo(&self.socket))?;
                }
                ready = self.socket.writable(), if self.relay.has_outbound() && !write_shut && !self.relay.is_closed() => {
                    ready?;
                    self.relay.on_socket_writable(&mut SocketIo(&self.socket))?;
                }
                read = input.read_chunk(&mut chunk), if input_open => {
                    match read {
                        Ok(0) => {
                            debug!("Local input reached EOF");
                            input_open = false;
                        }
                        Ok(n) => self.relay.queue_outbound(&chunk[..n]),
                        Err(e) if is_transient(&e) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                _ = std::future::ready(()), if self.relay.has_pending_output() => {
                    let written = self.relay.on_output_writable(output)?;
                    if written == 0 && self.relay.has_pending_output() {
                        // output is backed up; let the socket side make progress
                        tokio::task::yield_now().await;
                    }
                }
            }
        }

        let stats = self.relay.stats();
        info!(
            "Connection to {} closed ({} bytes sent, {} received)",
            self.peer, stats.sent, stats.received
        );
        Ok(stats)
    }
}

/// Connect to `params` and relay the process's own stdin/stdout on a
/// current-thread runtime
pub fn run_blocking(params: &ClientParams) -> Result<RelayStats> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    runtime.block_on(async {
        let proxy = TerminalProxy::connect(params).await?;
        let input = LocalInput::stdin()?;
        let mut stdout = BlockingOutput::stdout();
        proxy.run(input, &mut stdout).await
    })
}
