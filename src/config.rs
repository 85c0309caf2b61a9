//! Configuration for workers and the operator CLI.
//!
//! Values come from `kairan.toml` and are overridden by `KAIRAN_`-prefixed
//! environment variables, with `__` separating sections
//! (`KAIRAN_DATABASE__URL`, `KAIRAN_WORKER__CONCURRENCY`).

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use kairan_core::utils::Ticker;
use kairan_core::{IdempotencyScope, QueueOptions, RequestType, StoreBackEnd, WorkerBuilder};
use serde::{Deserialize, Serialize};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "kairan.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "KAIRAN_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KairanConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Database configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `postgres://` connection string.
    pub url: String,
    /// Maximum connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Stable worker identity. Generated per process when unset.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Jobs processed at once by one worker process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: None,
            lease_seconds: default_lease_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            concurrency: default_concurrency(),
        }
    }
}

impl WorkerConfig {
    pub fn worker_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(kairan_core::worker::generate_worker_id)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Worker builder polling at the configured interval and concurrency.
    pub fn builder(&self) -> WorkerBuilder<Ticker> {
        WorkerBuilder::new(self.poll_interval()).concurrent(self.concurrency)
    }

    /// Claim jobs of `request_types` from `store` under this worker's
    /// identity and lease.
    pub fn backend<S, T, I>(
        &self,
        store: S,
        request_types: I,
    ) -> Result<StoreBackEnd<S, T>, kairan_core::Error>
    where
        I: IntoIterator<Item = RequestType>,
    {
        StoreBackEnd::new(store, self.worker_id(), request_types).lease(self.lease())
    }

    fn validate(&self) -> Result<(), figment::Error> {
        if self.lease_seconds == 0 {
            return Err(figment::Error::from("worker.lease_seconds must be at least 1".to_owned()));
        }
        if self.poll_interval_ms == 0 {
            return Err(figment::Error::from("worker.poll_interval_ms must be at least 1".to_owned()));
        }
        if self.concurrency == 0 {
            return Err(figment::Error::from("worker.concurrency must be at least 1".to_owned()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u16,
    #[serde(default)]
    pub idempotency_scope: IdempotencyScope,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            idempotency_scope: IdempotencyScope::default(),
        }
    }
}

impl From<QueueConfig> for QueueOptions {
    fn from(value: QueueConfig) -> Self {
        QueueOptions {
            default_max_attempts: value.default_max_attempts,
            idempotency_scope: value.idempotency_scope,
        }
    }
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_lease_seconds() -> u64 {
    30
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

const fn default_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u16 {
    kairan_core::job::DEFAULT_MAX_ATTEMPTS
}

impl KairanConfig {
    /// Configuration sources: the TOML file at `path`, then the environment.
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load from [`DEFAULT_CONFIG_FILE`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Self::from_figment(&Self::figment(path))
    }

    /// Extract from `figment` and reject values no worker can run with.
    pub fn from_figment(figment: &Figment) -> Result<Self, figment::Error> {
        let config: Self = figment.extract()?;
        config.worker.validate()?;
        Ok(config)
    }
}

#[cfg(feature = "postgres")]
impl DatabaseConfig {
    /// Build a connection pool from these settings.
    pub async fn connect(&self) -> Result<sqlx::PgPool, sqlx::Error> {
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.connect_timeout_seconds))
            .connect(&self.url)
            .await
    }
}
