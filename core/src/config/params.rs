//! Connection parameter resolution
//!
//! Every setting is resolved with the same precedence: explicit argument,
//! then environment variable, then config file, then built-in default (the
//! last two are already folded together in [`RdbConfig`]).

use super::RdbConfig;
use crate::error::{RdbError, Result};
use std::str::FromStr;
use std::time::Duration;

/// Overrides the server bind interface / the client target host
pub const ENV_HOST: &str = "RDB_HOST";
/// Overrides the port on both sides
pub const ENV_PORT: &str = "RDB_PORT";
/// Older spelling of [`ENV_HOST`], consulted when it is unset
pub const ENV_HOST_ALIAS: &str = "REMOTE_PDB_HOST";
/// Older spelling of [`ENV_PORT`], consulted when it is unset
pub const ENV_PORT_ALIAS: &str = "REMOTE_PDB_PORT";
/// Overrides whether the server redirects stdio
pub const ENV_PATCH_STDIO: &str = "RDB_PATCH_STDIO";
/// Overrides the accept timeout, in seconds
pub const ENV_ACCEPT_TIMEOUT: &str = "RDB_ACCEPT_TIMEOUT";

/// Read an override from the real process environment
pub fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

/// Explicit call-time arguments for a breakpoint
#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub patch_stdio: Option<bool>,
    pub accept_timeout: Option<Duration>,
}

impl TraceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_patch_stdio(mut self, patch_stdio: bool) -> Self {
        self.patch_stdio = Some(patch_stdio);
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }
}

/// Fully resolved settings for opening a debug channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerParams {
    pub host: String,
    pub port: u16,
    pub patch_stdio: bool,
    /// `None` waits for a client indefinitely
    pub accept_timeout: Option<Duration>,
}

impl ServerParams {
    pub fn resolve<E>(options: &TraceOptions, config: &RdbConfig, env: E) -> Result<Self>
    where
        E: Fn(&str) -> Option<String>,
    {
        let host = match &options.host {
            Some(host) => host.clone(),
            None => first_env(&env, &[ENV_HOST, ENV_HOST_ALIAS])
                .map(|(_, value)| value)
                .unwrap_or_else(|| config.bind_to.clone()),
        };
        let port = match options.port {
            Some(port) => port,
            None => parse_env(&env, &[ENV_PORT, ENV_PORT_ALIAS])?.unwrap_or(config.port),
        };
        let patch_stdio = match options.patch_stdio {
            Some(patch) => patch,
            None => match env(ENV_PATCH_STDIO) {
                Some(value) => parse_bool(ENV_PATCH_STDIO, &value)?,
                None => config.patch_stdio,
            },
        };
        let accept_timeout = match options.accept_timeout {
            Some(timeout) => Some(timeout).filter(|t| !t.is_zero()),
            None => {
                let secs = parse_env::<u64, _>(&env, &[ENV_ACCEPT_TIMEOUT])?.or(config.accept_timeout_secs);
                secs.filter(|s| *s > 0).map(Duration::from_secs)
            }
        };

        Ok(Self {
            host,
            port,
            patch_stdio,
            accept_timeout,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Fully resolved target for the terminal proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientParams {
    pub host: String,
    pub port: u16,
}

impl ClientParams {
    pub fn resolve<E>(host: Option<&str>, port: Option<u16>, config: &RdbConfig, env: E) -> Result<Self>
    where
        E: Fn(&str) -> Option<String>,
    {
        let host = match host {
            Some(host) => host.to_string(),
            None => first_env(&env, &[ENV_HOST, ENV_HOST_ALIAS])
                .map(|(_, value)| value)
                .unwrap_or_else(|| config.host.clone()),
        };
        let port = match port {
            Some(port) => port,
            None => parse_env(&env, &[ENV_PORT, ENV_PORT_ALIAS])?.unwrap_or(config.port),
        };
        Ok(Self { host, port })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// First variable in `vars` that is set, with its name
fn first_env<E>(env: &E, vars: &[&'static str]) -> Option<(&'static str, String)>
where
    E: Fn(&str) -> Option<String>,
{
    vars.iter().find_map(|&var| env(var).map(|value| (var, value)))
}

fn parse_env<T, E>(env: &E, vars: &[&'static str]) -> Result<Option<T>>
where
    T: FromStr,
    E: Fn(&str) -> Option<String>,
{
    match first_env(env, vars) {
        None => Ok(None),
        Some((var, value)) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RdbError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
    }
}

/// Accepts the usual spellings of a boolean flag
fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RdbError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}
