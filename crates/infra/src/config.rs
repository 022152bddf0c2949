//! Rebuild worker configuration, read from environment variables.

use std::time::Duration;

use sheetcache_core::WorkerId;

use crate::workers::DEFAULT_BATCH_SIZE;

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const BATCH_SIZE_ENV: &str = "SNAPSHOT_REBUILD_BATCH_SIZE";
pub const POLL_INTERVAL_ENV: &str = "SNAPSHOT_REBUILD_POLL_INTERVAL_MS";
pub const WORKER_ID_ENV: &str = "SNAPSHOT_REBUILD_WORKER_ID";
pub const MAX_CONNECTIONS_ENV: &str = "SNAPSHOT_REBUILD_MAX_CONNECTIONS";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5_000);
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings for the rebuild binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildConfig {
    pub database_url: Option<String>,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub worker_id: WorkerId,
    pub max_connections: u32,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            worker_id: WorkerId::generate(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl RebuildConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();
        config.database_url = get(DATABASE_URL_ENV);

        if let Some(raw) = get(BATCH_SIZE_ENV) {
            config.batch_size = parse_positive(BATCH_SIZE_ENV, &raw)?;
        }
        if let Some(raw) = get(POLL_INTERVAL_ENV) {
            config.poll_interval = Duration::from_millis(parse_positive(POLL_INTERVAL_ENV, &raw)?);
        }
        if let Some(raw) = get(WORKER_ID_ENV) {
            config.worker_id = WorkerId::new(raw);
        }
        if let Some(raw) = get(MAX_CONNECTIONS_ENV) {
            config.max_connections = parse_positive(MAX_CONNECTIONS_ENV, &raw)?;
        }

        Ok(config)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing(DATABASE_URL_ENV))
    }
}

fn parse_positive<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let invalid = |reason: String| ConfigError::Invalid {
        name,
        value: raw.to_string(),
        reason,
    };
    let value = raw.parse::<T>().map_err(|e| invalid(e.to_string()))?;
    if value == T::default() {
        return Err(invalid("must be greater than zero".to_string()));
    }
    Ok(value)
}
