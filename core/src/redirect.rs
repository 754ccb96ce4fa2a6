//! Scoped redirection of the process-wide standard streams
//!
//! [`StreamRedirector`] only records and swaps endpoints through the
//! [`ProcessStreams`] abstraction, so it can be exercised against a fake.
//! [`StdioStreams`] is the real implementation and swaps file descriptors
//! 0, 1 and 2 with `dup2`.

use crate::error::{RdbError, Result};
use std::fmt;
use std::io::{self, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use tracing::warn;

/// Logical name of a standard stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamName {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamName {
    pub const ALL: [StreamName; 3] = [StreamName::Stdin, StreamName::Stdout, StreamName::Stderr];

    pub fn raw_fd(self) -> RawFd {
        match self {
            StreamName::Stdin => libc::STDIN_FILENO,
            StreamName::Stdout => libc::STDOUT_FILENO,
            StreamName::Stderr => libc::STDERR_FILENO,
        }
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamName::Stdin => write!(f, "stdin"),
            StreamName::Stdout => write!(f, "stdout"),
            StreamName::Stderr => write!(f, "stderr"),
        }
    }
}

/// Get/set access to the endpoints behind the standard streams
pub trait ProcessStreams: Send {
    type Endpoint: Send;

    /// Capture the endpoint currently installed for `name`
    fn get(&mut self, name: StreamName) -> io::Result<Self::Endpoint>;

    /// Install `endpoint` for `name`
    fn set(&mut self, name: StreamName, endpoint: &Self::Endpoint) -> io::Result<()>;

    /// Endpoint that routes a stream through the debug channel
    fn channel_endpoint(&mut self, channel: &TcpStream) -> io::Result<Self::Endpoint>;

    /// Push out anything buffered in front of `name`
    fn flush(&mut self, _name: StreamName) -> io::Result<()> {
        Ok(())
    }
}

/// Swaps a set of streams to one endpoint and puts them back exactly once
pub struct StreamRedirector<S: ProcessStreams> {
    streams: S,
    saved: Vec<(StreamName, S::Endpoint)>,
}

impl<S: ProcessStreams> StreamRedirector<S> {
    pub fn new(streams: S) -> Self {
        Self {
            streams,
            saved: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.saved.is_empty()
    }

    pub fn streams_mut(&mut self) -> &mut S {
        &mut self.streams
    }

    /// Record the current endpoint of every stream in `names`, then point them at `endpoint`.
    ///
    /// If any swap fails the streams already swapped are put back before the
    /// error is returned.
    pub fn apply(&mut self, names: &[StreamName], endpoint: &S::Endpoint) -> Result<()> {
        if self.is_active() {
            return Err(RdbError::AlreadyRedirected);
        }

        for &name in names {
            if self.saved.iter().any(|(saved, _)| *saved == name) {
                continue;
            }
            let swapped = self.streams.flush(name).and_then(|_| {
                let original = self.streams.get(name)?;
                self.streams.set(name, endpoint)?;
                Ok(original)
            });
            match swapped {
                Ok(original) => self.saved.push((name, original)),
                Err(e) => {
                    if let Err(restore_err) = self.restore() {
                        warn!("Failed to roll back stream redirection: {}", restore_err);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Put every recorded stream back and forget the record. No-op when nothing was applied.
    ///
    /// All streams are attempted even if one fails; the first failure is returned.
    pub fn restore(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some((name, original)) = self.saved.pop() {
            let restored = self
                .streams
                .flush(name)
                .and_then(|_| self.streams.set(name, &original));
            if let Err(e) = restored {
                warn!("Failed to restore {}: {}", name, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Flush every standard stream, redirected or not
    pub fn flush_all(&mut self) {
        for name in StreamName::ALL {
            if let Err(e) = self.streams.flush(name) {
                warn!("Failed to flush {}: {}", name, e);
            }
        }
    }
}

/// The real standard streams of this process, swapped at the descriptor level
#[derive(Debug, Default)]
pub struct StdioStreams;

impl StdioStreams {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessStreams for StdioStreams {
    type Endpoint = OwnedFd;

    fn get(&mut self, name: StreamName) -> io::Result<OwnedFd> {
        // SAFETY: the standard descriptors stay open for the life of the process.
        let fd = unsafe { BorrowedFd::borrow_raw(name.raw_fd()) };
        fd.try_clone_to_owned()
    }

    fn set(&mut self, name: StreamName, endpoint: &OwnedFd) -> io::Result<()> {
        let rc = unsafe { libc::dup2(endpoint.as_raw_fd(), name.raw_fd()) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn channel_endpoint(&mut self, channel: &TcpStream) -> io::Result<OwnedFd> {
        channel.as_fd().try_clone_to_owned()
    }

    fn flush(&mut self, name: StreamName) -> io::Result<()> {
        match name {
            StreamName::Stdin => Ok(()),
            StreamName::Stdout => io::stdout().flush(),
            StreamName::Stderr => io::stderr().flush(),
        }
    }
}
