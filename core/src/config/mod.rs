//! Configuration management
//!
//! Settings live in the `[rdb]` table of TOML files. Files are layered: the
//! user config (`~/.config/rdb/config.toml`) first, then every `.rdb.toml`
//! from the filesystem root down to the working directory. A more specific
//! file overrides individual keys of a less specific one.

pub mod params;

pub use params::{ClientParams, ServerParams, TraceOptions};

use crate::error::{RdbError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the per-directory config file
pub const CONFIG_FILE_NAME: &str = ".rdb.toml";

/// Effective rdb configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rdb: RdbConfig,
}

/// Remote debugger settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdbConfig {
    /// Port the server listens on and the client dials
    #[serde(default = "default_port")]
    pub port: u16,

    /// Interface the server binds to
    #[serde(default = "default_bind_to")]
    pub bind_to: String,

    /// Host the client connects to
    #[serde(default = "default_host")]
    pub host: String,

    /// Redirect the host's stdio to the attached client
    #[serde(default = "default_patch_stdio")]
    pub patch_stdio: bool,

    /// Give up waiting for a client after this many seconds (0 or unset waits forever)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_timeout_secs: Option<u64>,
}

fn default_port() -> u16 {
    8268
}

fn default_bind_to() -> String {
    "0.0.0.0".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_patch_stdio() -> bool {
    true
}

impl Default for RdbConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_to: default_bind_to(),
            host: default_host(),
            patch_stdio: default_patch_stdio(),
            accept_timeout_secs: None,
        }
    }
}

/// One config file; every key is optional so it only overrides what it names
#[derive(Debug, Default, Deserialize)]
struct ConfigLayer {
    #[serde(default)]
    rdb: RdbLayer,
}

#[derive(Debug, Default, Deserialize)]
struct RdbLayer {
    port: Option<u16>,
    bind_to: Option<String>,
    host: Option<String>,
    patch_stdio: Option<bool>,
    accept_timeout_secs: Option<u64>,
}

impl RdbConfig {
    fn merge(&mut self, layer: RdbLayer) {
        if let Some(port) = layer.port {
            self.port = port;
        }
        if let Some(bind_to) = layer.bind_to {
            self.bind_to = bind_to;
        }
        if let Some(host) = layer.host {
            self.host = host;
        }
        if let Some(patch_stdio) = layer.patch_stdio {
            self.patch_stdio = patch_stdio;
        }
        if layer.accept_timeout_secs.is_some() {
            self.accept_timeout_secs = layer.accept_timeout_secs;
        }
    }
}

impl Config {
    /// Load the layered configuration as seen from the working directory
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Self::load_from(&config_file_locations(&cwd))
    }

    /// Load configuration, falling back to built-in defaults on any error
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Apply `paths` in order on top of the defaults. Missing files are skipped.
    pub fn load_from(paths: &[PathBuf]) -> Result<Self> {
        let mut config = Self::default();
        for path in paths {
            if !path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(path)?;
            let layer: ConfigLayer = toml::from_str(&content).map_err(|e| RdbError::InvalidConfig {
                path: path.clone(),
                message: e.to_string(),
            })?;
            debug!("Loaded config from {}", path.display());
            config.rdb.merge(layer.rdb);
        }
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RdbError::InvalidConfig {
            path: PathBuf::from("<effective>"),
            message: e.to_string(),
        })
    }
}

/// Get the user configuration directory path
pub fn get_config_dir() -> Option<PathBuf> {
    if let Some(dir) = dirs::config_dir() {
        return Some(dir.join("rdb"));
    }
    dirs::home_dir().map(|home| home.join(".config").join("rdb"))
}

/// Candidate config files, least specific first.
///
/// The user config comes first, followed by `.rdb.toml` in every directory
/// from the root of `start` down to `start` itself.
pub fn config_file_locations(start: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .collect();
    if let Some(dir) = get_config_dir() {
        paths.push(dir.join("config.toml"));
    }
    paths.reverse();
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.rdb.port, 8268);
        assert_eq!(config.rdb.bind_to, "0.0.0.0");
        assert_eq!(config.rdb.host, "127.0.0.1");
        assert!(config.rdb.patch_stdio);
        assert!(config.rdb.accept_timeout_secs.is_none());
    }

    #[test]
    fn test_locations_order() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let paths = config_file_locations(&nested);

        assert_eq!(paths.last().unwrap(), &nested.join(CONFIG_FILE_NAME));
        let parent = paths.iter().position(|p| p == &dir.path().join("a").join(CONFIG_FILE_NAME)).unwrap();
        let child = paths.iter().position(|p| p == &nested.join(CONFIG_FILE_NAME)).unwrap();
        let root = paths.iter().position(|p| p == &PathBuf::from("/").join(CONFIG_FILE_NAME)).unwrap();
        assert!(root < parent && parent < child);
    }

    #[test]
    fn test_layering_overrides_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let outer = dir.path().join("outer.toml");
        let inner = dir.path().join("inner.toml");
        fs::write(&outer, "[rdb]\nport = 9000\nhost = \"10.0.0.1\"\n").unwrap();
        fs::write(&inner, "[rdb]\nport = 9001\npatch_stdio = false\n").unwrap();

        let missing = dir.path().join("missing.toml");
        let config = Config::load_from(&[outer, missing, inner]).unwrap();
        assert_eq!(config.rdb.port, 9001);
        assert_eq!(config.rdb.host, "10.0.0.1");
        assert!(!config.rdb.patch_stdio);
        assert_eq!(config.rdb.bind_to, "0.0.0.0");
    }

    #[test]
    fn test_malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[rdb]\nport = \"not a number\"\n").unwrap();

        let err = Config::load_from(&[path.clone()]).unwrap_err();
        match err {
            RdbError::InvalidConfig { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unrelated_sections_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[notify]\nsmtp_port = 25\n\n[rdb]\naccept_timeout_secs = 30\n").unwrap();

        let config = Config::load_from(&[path]).unwrap();
        assert_eq!(config.rdb.accept_timeout_secs, Some(30));
    }

    #[test]
    fn test_to_toml_renders_values() {
        let mut config = Config::default();
        config.rdb.port = 1234;
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[rdb]"));
        assert!(rendered.contains("port = 1234"));
    }
}
