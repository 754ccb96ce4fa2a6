//! Remote interactive debugging over TCP
//!
//! The server half ([`session`]) pauses the host at a breakpoint, waits for
//! one operator to connect and hands the connection to a line-debugger
//! engine. The client half ([`proxy`]) relays the operator's terminal to
//! that connection.

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod proxy;
pub mod redirect;
pub mod session;

// Re-exports for convenience
pub use config::{ClientParams, Config, ServerParams, TraceOptions};
pub use engine::{CommandLoop, LineDebugger, Resume};
pub use error::{RdbError, Result};
pub use session::{set_trace, DebugSession, SessionRegistry};
