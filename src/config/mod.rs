//! Management configuration
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional file (format picked from its extension), then `SCTP_*`
//! environment variables such as `SCTP_CONNECT_DELAY_MS` or
//! `SCTP_PERSIST_DIR`.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::{default_worker_threads, DEFAULT_CONNECT_DELAY_MS};

/// Environment prefix for every setting
pub const ENV_PREFIX: &str = "SCTP";

/// Configuration for one [`Management`](crate::Management) instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    /// Instance name; also names the persistence file
    pub name: String,
    /// Directory of the JSON snapshot; current directory when unset
    pub persist_dir: Option<PathBuf>,
    /// Backoff before a client association reconnects
    pub connect_delay_ms: u64,
    /// Worker pool size; 0 selects the default
    pub worker_threads: usize,
    /// Run listener callbacks on the selector thread
    pub single_thread: bool,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            name: "sctp".to_string(),
            persist_dir: None,
            connect_delay_ms: DEFAULT_CONNECT_DELAY_MS,
            worker_threads: default_worker_threads(),
            single_thread: false,
        }
    }
}

impl ManagementConfig {
    /// Load defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&Self::default()).context("Invalid default configuration")?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .with_context(|| match path {
                Some(path) => format!("Failed to load configuration from {}", path.display()),
                None => "Failed to load configuration from environment".to_string(),
            })?;

        let mut loaded: Self = config
            .try_deserialize()
            .context("Failed to parse management configuration")?;
        if loaded.worker_threads < 1 {
            loaded.worker_threads = default_worker_threads();
        }
        Ok(loaded)
    }

    /// Connect delay as a [`Duration`]
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }
}

/// Persist directory from the layered settings, else the current directory
pub fn default_persist_dir() -> PathBuf {
    let configured = match ManagementConfig::load(None) {
        Ok(config) => config.persist_dir,
        Err(e) => {
            warn!("Ignoring environment configuration: {:#}", e);
            None
        }
    };
    configured
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ManagementConfig::default();
        assert_eq!(config.connect_delay_ms, 30_000);
        assert_eq!(config.connect_delay(), Duration::from_secs(30));
        assert!(config.worker_threads >= 2);
        assert!(!config.single_thread);
        assert!(config.persist_dir.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "name = \"gnb-sctp\"").unwrap();
        writeln!(file, "connect_delay_ms = 500").unwrap();
        writeln!(file, "worker_threads = 0").unwrap();
        writeln!(file, "single_thread = true").unwrap();
        writeln!(file, "persist_dir = \"/var/lib/sctp\"").unwrap();
        file.flush().unwrap();

        let config = ManagementConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.name, "gnb-sctp");
        assert_eq!(config.connect_delay_ms, 500);
        assert_eq!(config.worker_threads, default_worker_threads());
        assert!(config.single_thread);
        assert_eq!(config.persist_dir, Some(PathBuf::from("/var/lib/sctp")));
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = ManagementConfig::load(Some(Path::new("/nonexistent/sctp.toml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/sctp.toml"));
    }
}
