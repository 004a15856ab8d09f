use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CoreConfig {
    pub database_path: PathBuf,
    pub log: LogConfig,
    pub stats: StatsConfig,
    pub outbox: OutboxConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/bi-platform.sqlite"),
            log: LogConfig::default(),
            stats: StatsConfig::default(),
            outbox: OutboxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_prefix: "bi-platform.log".to_string(),
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub recent_limit: u32,
    pub activity_limit: u32,
    pub usage_months: u32,
    pub queries_per_chart: i64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            recent_limit: 5,
            activity_limit: 5,
            usage_months: 6,
            queries_per_chart: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub capacity: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl CoreConfig {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw).context("failed to parse core config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.stats.usage_months == 0 {
            anyhow::bail!("stats.usage_months must be at least 1");
        }
        if self.outbox.capacity == 0 {
            anyhow::bail!("outbox.capacity must be at least 1");
        }
        if self.outbox.max_attempts == 0 {
            anyhow::bail!("outbox.max_attempts must be at least 1");
        }
        Ok(())
    }
}
