//! Structured error types for rdb
//!
//! Socket failures keep their original `std::io::Error` as the source so
//! callers can inspect the exact kind (address in use, permission denied,
//! connection refused) without string matching.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Primary error type for rdb operations
#[derive(Error, Debug)]
pub enum RdbError {
    // =========================================================================
    // Channel Errors (server side)
    // =========================================================================
    /// Binding or listening on the debug port failed
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Nobody attached within the configured accept timeout
    #[error("no client connected to {addr} within {timeout:?}")]
    AcceptTimeout { addr: String, timeout: Duration },

    /// Host name did not resolve to any socket address
    #[error("could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    // =========================================================================
    // Proxy Errors (client side)
    // =========================================================================
    /// Dialing the remote debugger failed
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Streams were redirected twice without an intervening restore
    #[error("process streams are already redirected")]
    AlreadyRedirected,

    /// The line-debugger engine failed mid-interaction
    #[error("debugger engine failed: {0}")]
    Engine(#[source] anyhow::Error),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A config file exists but could not be parsed
    #[error("invalid configuration in {path}: {message}")]
    InvalidConfig { path: PathBuf, message: String },

    /// An environment override holds a value of the wrong type
    #[error("invalid value {value:?} for environment variable {var}")]
    InvalidEnv { var: String, value: String },

    // =========================================================================
    // External Error Wrappers (transparent)
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RdbError {
    /// Underlying I/O error kind, if this error wraps one
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Bind { source, .. } | Self::Connect { source, .. } => Some(source.kind()),
            Self::Io(err) => Some(err.kind()),
            Self::AcceptTimeout { .. } => Some(io::ErrorKind::TimedOut),
            _ => None,
        }
    }

    /// True when a client dialed an address nothing is listening on
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Self::Connect { source, .. } if source.kind() == io::ErrorKind::ConnectionRefused)
    }

    /// True for errors raised by the engine rather than by the transport
    pub fn is_engine_failure(&self) -> bool {
        matches!(self, Self::Engine(_))
    }
}

/// Result type alias using RdbError
pub type Result<T> = std::result::Result<T, RdbError>;
