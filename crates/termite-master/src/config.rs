//! Master configuration.
//!
//! Loaded from multiple sources with the following priority:
//!
//! 1. Environment variables (`TERMITE_MASTER_*`)
//! 2. Configuration file (TOML)
//! 3. Default values

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use termite_store::StoreOptions;

/// Master configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterOptions {
    /// The directory job results are replayed into. Required.
    pub writable_root: PathBuf,
    /// Coordinator address for worker discovery.
    pub coordinator: String,
    /// Transport failures tolerated per job before giving up.
    pub retry_count: u32,
    /// Shared secret for connection handshakes.
    pub secret: String,
    /// Total job slots wanted across all workers.
    pub max_jobs: u32,
    /// Idle time after which all mirrors are dropped, in milliseconds.
    pub keep_alive_ms: u64,
    /// Housekeeping period, in milliseconds.
    pub period_ms: u64,
    /// Expose files that are not group/other readable.
    pub expose_private: bool,
    /// Unix socket the local RPC listens on.
    pub socket: PathBuf,
    /// Content store configuration.
    pub store: StoreOptions,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            writable_root: PathBuf::new(),
            coordinator: String::new(),
            retry_count: 2,
            secret: String::new(),
            max_jobs: 4,
            keep_alive_ms: 60_000,
            period_ms: 60_000,
            expose_private: false,
            socket: PathBuf::new(),
            store: StoreOptions::default(),
        }
    }
}

impl MasterOptions {
    /// Loads configuration from a file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("TERMITE_MASTER_"))
            .extract()
    }

    /// Idle window before the pool reaps its mirrors.
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Housekeeping period.
    #[must_use]
    pub const fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}
