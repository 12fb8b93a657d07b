//! ORM and connection settings.

use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Settings applied when opening connections and decoding rows.
///
/// Every field has a default so hosts can deserialize partial JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrmConfig {
    /// Fail decoding when a fetched column matches no entity field.
    pub strict_decoding: bool,
    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// Run `PRAGMA foreign_keys = ON` on open.
    pub foreign_keys: bool,
    /// File logging; `None` leaves logging to the host.
    pub logging: Option<LoggingConfig>,
}

impl OrmConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Parses settings from JSON; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Default for OrmConfig {
    fn default() -> Self {
        Self {
            strict_decoding: false,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            foreign_keys: true,
            logging: None,
        }
    }
}
