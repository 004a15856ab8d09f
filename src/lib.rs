pub mod config;
pub mod db;
pub mod edit_counter;
pub mod errors;
pub mod links;
pub mod models;
pub mod outbox;
pub mod service;
pub mod stats;
pub mod telemetry;

pub use crate::config::{CoreConfig, LogConfig, OutboxConfig, StatsConfig};
pub use crate::db::{Collection, Database};
pub use crate::errors::{AppError, AppResult};
pub use crate::service::PlatformCore;

use std::path::Path;

/// Loads the YAML config, installs tracing and starts the core.
/// Returns an error outside a tokio runtime because the outbox worker is spawned here.
pub fn bootstrap(config_path: &Path) -> AppResult<PlatformCore> {
    let config = CoreConfig::load(config_path)?;
    telemetry::init_tracing(&config.log)?;

    let core = PlatformCore::new(config)?;
    core.start()?;
    Ok(core)
}
