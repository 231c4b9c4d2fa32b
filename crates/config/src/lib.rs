//! Gatekeeper configuration structures to map the gatekeeper.toml configuration.

#![deny(missing_docs)]

mod database;
mod loader;
mod rate_limit;
mod server;
mod sync;
mod telemetry;

use std::path::Path;

pub use database::DatabaseConfig;
pub use rate_limit::*;
use serde::Deserialize;
pub use server::{HealthConfig, ServerConfig};
pub use sync::{MaintenanceConfig, SyncConfig};
pub use telemetry::{MetricsExporterConfig, OtlpProtocol, TelemetryConfig};

/// Main configuration structure for the Gatekeeper application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Admission control settings.
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    /// Durable store holding API keys, limits, weights and usage statistics.
    pub database: Option<DatabaseConfig>,
    /// Background synchronization settings.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Metrics export settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates cross-section constraints that serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}
