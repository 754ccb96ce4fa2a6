//! Server side transport: one listening socket, exactly one accepted peer
//!
//! Binding and accepting run on a throwaway current-thread tokio runtime so
//! the wait for a client can be bounded by a timeout. The accepted
//! connection is handed out as a plain blocking `std::net::TcpStream`.

use crate::config::ServerParams;
use crate::error::{RdbError, Result};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Bound and listening, waiting for its single peer
pub struct PendingChannel {
    runtime: Runtime,
    listener: TcpListener,
    local_addr: SocketAddr,
}

/// The accepted connection carrying the debugging interaction
#[derive(Debug)]
pub struct DebugChannel {
    stream: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    closed: bool,
}

impl DebugChannel {
    /// Bind with address reuse and listen with a backlog of one
    pub fn listen(params: &ServerParams) -> Result<PendingChannel> {
        let addr = resolve(&params.host, params.port)?;
        let bind_err = |source: io::Error| RdbError::Bind {
            addr: params.addr(),
            source,
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        let listener = {
            let _guard = runtime.enter();
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }
            .map_err(bind_err)?;
            socket.set_reuseaddr(true).map_err(bind_err)?;
            socket.bind(addr).map_err(bind_err)?;
            socket.listen(1).map_err(bind_err)?
        };
        let local_addr = listener.local_addr()?;

        info!(
            "Started remote debug session on {}. Waiting for connection...",
            local_addr
        );
        Ok(PendingChannel {
            runtime,
            listener,
            local_addr,
        })
    }

    /// Bind, listen and block until one peer connects
    pub fn open(params: &ServerParams) -> Result<Self> {
        Self::listen(params)?.accept(params.accept_timeout)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Buffered reading half for the engine
    pub fn reader(&self) -> Result<Box<dyn BufRead + Send>> {
        Ok(Box::new(BufReader::new(self.stream.try_clone()?)))
    }

    /// Writing half for the engine
    pub fn writer(&self) -> Result<Box<dyn Write + Send>> {
        Ok(Box::new(self.stream.try_clone()?))
    }

    /// Shut the connection down. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // The peer may already be gone; the connection is finished either way.
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("Shutdown of {} reported: {}", self.peer_addr, e);
        }
        info!("Closed debug connection from {}", self.peer_addr);
    }
}

impl PendingChannel {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the one peer, then stop listening.
    ///
    /// `None` waits indefinitely.
    pub fn accept(self, timeout: Option<Duration>) -> Result<DebugChannel> {
        let PendingChannel {
            runtime,
            listener,
            local_addr,
        } = self;

        let accepted = runtime.block_on(async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, listener.accept()).await {
                    Ok(accepted) => accepted.map_err(RdbError::from),
                    Err(_) => Err(RdbError::AcceptTimeout {
                        addr: local_addr.to_string(),
                        timeout: limit,
                    }),
                },
                None => listener.accept().await.map_err(RdbError::from),
            }
        });
        let (stream, peer_addr) = accepted?;
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        drop(listener);

        info!("New connection from {}", peer_addr);
        Ok(DebugChannel {
            stream,
            local_addr,
            peer_addr,
            closed: false,
        })
    }
}

impl Drop for DebugChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let unresolved = || RdbError::Resolve {
        host: host.to_string(),
        port,
    };
    let mut addrs = (host, port).to_socket_addrs().map_err(|e| {
        debug!("Lookup of {}:{} failed: {}", host, port, e);
        unresolved()
    })?;
    addrs.next().ok_or_else(unresolved)
}
