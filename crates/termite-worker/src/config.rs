//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use termite_store::StoreOptions;

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Shared secret for connection handshakes.
    pub secret: String,
    /// Directory holding per-mirror job views.
    pub temp_dir: PathBuf,
    /// Total job slots granted across all mirrors.
    pub jobs: u32,
    /// Coordinator registration interval, in milliseconds.
    pub report_interval_ms: u64,
    /// Coordinator address to register with.
    pub coordinator: String,
    /// First port to try binding the mirror listener on.
    pub port: u16,
    /// Consecutive ports to try after `port` is taken.
    pub port_retry: u16,
    /// Content store configuration.
    pub store: StoreOptions,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            secret: String::new(),
            temp_dir: std::env::temp_dir().join("termite-worker"),
            jobs: 1,
            report_interval_ms: 10_000,
            coordinator: String::new(),
            port: 1235,
            port_retry: 10,
            store: StoreOptions::default(),
        }
    }
}

impl WorkerOptions {
    /// Loads configuration from a file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("TERMITE_WORKER_"))
            .extract()
    }

    /// Coordinator registration interval.
    #[must_use]
    pub const fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}
