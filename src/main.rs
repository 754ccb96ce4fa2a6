//! `rdb` - remote interactive debugging over TCP
//!
//! The client subcommand relays the local terminal to a paused program. The
//! server subcommand is a demo host built on [`rdb_core::set_trace`].

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{Cli, Commands};
use rdb_core::config::params::process_env;
use rdb_core::proxy;
use rdb_core::{ClientParams, CommandLoop, Config, LineDebugger, TraceOptions};

mod cli;

/// Exit status when the debugger refused the connection
const EXIT_REFUSED: i32 = 2;

fn main() -> Result<()> {
    // stdout belongs to the relayed session, so logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_env("RDB_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Client { host, port } => handle_client(host.as_deref(), port),
        Commands::Server {
            host,
            port,
            patch_stdio,
            accept_timeout,
            breakpoints,
        } => {
            let mut options = TraceOptions::new();
            options.host = host;
            options.port = port;
            options.patch_stdio = patch_stdio;
            options.accept_timeout = accept_timeout.map(Duration::from_secs);
            handle_server(&options, breakpoints)
        }
        Commands::Config => {
            let config = Config::load().context("Failed to load configuration")?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn handle_client(host: Option<&str>, port: Option<u16>) -> Result<()> {
    let config = Config::load_or_default();
    let params = ClientParams::resolve(host, port, &config.rdb, process_env)?;
    let dim = Style::new().dim();
    let red = Style::new().red().bold();

    eprintln!(
        "{}",
        dim.apply_to(format!("trying to connect to remote debugger at {}...", params.addr()))
    );
    match proxy::run_blocking(&params) {
        Ok(stats) => {
            info!(
                "Session closed ({} bytes sent, {} bytes received)",
                stats.sent, stats.received
            );
            Ok(())
        }
        Err(e) if e.is_connection_refused() => {
            eprintln!("{}", red.apply_to(format!("connection to {} refused", params.addr())));
            std::process::exit(EXIT_REFUSED);
        }
        Err(e) => {
            eprintln!("{} {}", red.apply_to("error:"), e);
            std::process::exit(1);
        }
    }
}

fn handle_server(options: &TraceOptions, breakpoints: usize) -> Result<()> {
    let engine = || -> Box<dyn LineDebugger> { Box::new(CommandLoop::new("demo")) };
    let red = Style::new().red().bold();
    let mut total = 0u64;

    for round in 1..=breakpoints {
        total += round as u64 * round as u64;
        println!("round {}: running total {}", round, total);

        // a failed breakpoint ends the interaction, not the program
        match rdb_core::set_trace(options, engine) {
            Ok(resume) if resume.ends_session() && round < breakpoints => {
                info!("Session ended ({:?}); the next breakpoint waits for a new client", resume);
            }
            Ok(_) => {}
            Err(e) => eprintln!("{} breakpoint {}: {}", red.apply_to("error:"), round, e),
        }
    }

    println!("demo finished with total {}", total);
    Ok(())
}
