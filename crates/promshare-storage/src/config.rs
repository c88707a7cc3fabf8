use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use promshare_common::error::{PromshareError, Result};
use serde::{Deserialize, Serialize};

use crate::cas::{CasAdapter, MemoryCasStore};
use crate::memory::MemoryAdapter;
use crate::sqlite::SqliteAdapter;
use crate::traits::Adapter;

pub const DEFAULT_SQLITE_PATH: &str = "./promshare.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    /// The CAS engine over a store private to this process. Exercises the
    /// shared-storage code path but aggregates nothing across processes.
    Shared,
    Sqlite,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Shared => "shared",
            Self::Sqlite => "sqlite",
        }
    }
}

impl FromStr for BackendKind {
    type Err = PromshareError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Self::Memory),
            "shared" | "cas" => Ok(Self::Shared),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(PromshareError::InvalidArgument(format!(
                "unknown storage backend: {other}"
            ))),
        }
    }
}

/// Retry policy of the compare-and-swap engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasConfig {
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            max_retries: 64,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub sqlite_path: PathBuf,
    pub cas: CasConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            sqlite_path: PathBuf::from(DEFAULT_SQLITE_PATH),
            cas: CasConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(backend) = env_value("PROMSHARE_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(path) = env_value("PROMSHARE_SQLITE_PATH") {
            config.sqlite_path = PathBuf::from(path);
        }
        if let Some(retries) = env_value("PROMSHARE_CAS_MAX_RETRIES") {
            config.cas.max_retries = retries.parse().map_err(|_| {
                PromshareError::InvalidArgument(format!(
                    "PROMSHARE_CAS_MAX_RETRIES must be an integer, got {retries:?}"
                ))
            })?;
        }

        Ok(config)
    }

    pub fn build(&self) -> Result<Arc<dyn Adapter>> {
        let adapter: Arc<dyn Adapter> = match self.backend {
            BackendKind::Memory => Arc::new(MemoryAdapter::new()),
            BackendKind::Shared => Arc::new(CasAdapter::new(
                Arc::new(MemoryCasStore::new()),
                self.cas,
            )),
            BackendKind::Sqlite => Arc::new(SqliteAdapter::open(&self.sqlite_path)?),
        };
        Ok(adapter)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
