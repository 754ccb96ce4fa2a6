//! CLI argument parsing using clap 4.x derive macros

use clap::{Parser, Subcommand};

/// Remote interactive debugging over TCP
///
/// `rdb client` attaches the local terminal to a paused program, `rdb server`
/// runs a small demo host that stops at breakpoints and waits for a client.
#[derive(Parser, Debug)]
#[command(name = "rdb")]
#[command(author, version, about, long_about = None)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"))]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect the terminal to a waiting debug session
    Client {
        /// Host the debugger listens on (env RDB_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port the debugger listens on (env RDB_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a demo program that pauses at remote breakpoints
    Server {
        /// Interface to bind (env RDB_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (env RDB_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Route the program's stdio through the debug connection (env RDB_PATCH_STDIO)
        #[arg(long)]
        patch_stdio: Option<bool>,

        /// Give up waiting for a client after this many seconds, 0 waits forever (env RDB_ACCEPT_TIMEOUT)
        #[arg(long, value_name = "SECS")]
        accept_timeout: Option<u64>,

        /// Number of breakpoints the demo program hits
        #[arg(short, long, default_value_t = 3)]
        breakpoints: usize,
    },

    /// Print the effective configuration
    Config,
}
