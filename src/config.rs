use std::{env, path::PathBuf, str::FromStr, time::Duration};

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BatcherError;

pub const BATCH_TIMEOUT_KEY: &str = "BATCH_TIMEOUT_SECS";
pub const MAX_BATCH_SIZE_KEY: &str = "MAX_BATCH_SIZE";
pub const CLEANUP_INTERVAL_KEY: &str = "CLEANUP_INTERVAL_SECS";
pub const URGENT_KEYWORDS_KEY: &str = "URGENT_KEYWORDS";

/// Keywords that make a message skip batching unless overridden by config.
/// `help` is absent because it matches ordinary openers like "I need help".
pub const DEFAULT_URGENT_KEYWORDS: &[&str] =
    &["cancel", "stop", "urgent", "emergency", "report", "status"];

/// Key/value source the coalescer reads its settings from.
#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Reads process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        match &env_file {
            Some(path) if path.exists() => {
                dotenvy::from_path(path).ok();
                info!("Loaded .env from {}", path.display());
            }
            Some(path) => warn!("No .env found at {}, using process environment", path.display()),
            None => {}
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait::async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, _value: &str) -> Result<(), String> {
        Err(format!("environment config is read-only, cannot set `{key}`"))
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        match &self.env_file {
            Some(path) => format!("EnvConfigManager({})", path.display()),
            None => "EnvConfigManager".to_string(),
        }
    }
}

/// In-memory config, used by tests and embedders that build config in code.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            map: DashMap::new(),
        })
    }
}

#[typetag::serde]
#[async_trait::async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Tuning knobs of the batcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatcherConfig {
    /// Fixed window, measured from batch creation.
    #[serde(with = "secs_f64")]
    #[schemars(with = "f64")]
    pub batch_timeout: Duration,
    pub max_batch_size: usize,
    /// How often the sweeper looks for batches a timer missed.
    #[serde(with = "secs_f64")]
    #[schemars(with = "f64")]
    pub cleanup_interval: Duration,
    pub urgent_keywords: Vec<String>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_secs(3),
            max_batch_size: 5,
            cleanup_interval: Duration::from_secs(60),
            urgent_keywords: DEFAULT_URGENT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl BatcherConfig {
    /// Defaults overlaid with whatever keys the config manager provides.
    pub async fn load(config: &ConfigManager) -> Result<Self, BatcherError> {
        let mut cfg = Self::default();

        if let Some(raw) = config.0.get(BATCH_TIMEOUT_KEY).await {
            cfg.batch_timeout = parse_secs(BATCH_TIMEOUT_KEY, &raw)?;
        }
        if let Some(raw) = config.0.get(MAX_BATCH_SIZE_KEY).await {
            cfg.max_batch_size = parse_value(MAX_BATCH_SIZE_KEY, &raw)?;
        }
        if let Some(raw) = config.0.get(CLEANUP_INTERVAL_KEY).await {
            cfg.cleanup_interval = parse_secs(CLEANUP_INTERVAL_KEY, &raw)?;
        }
        if let Some(raw) = config.0.get(URGENT_KEYWORDS_KEY).await {
            cfg.urgent_keywords = raw
                .split(',')
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), BatcherError> {
        if self.batch_timeout.is_zero() {
            return Err(BatcherError::invalid_config(BATCH_TIMEOUT_KEY, "must be greater than zero"));
        }
        if self.max_batch_size == 0 {
            return Err(BatcherError::invalid_config(MAX_BATCH_SIZE_KEY, "must be at least 1"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(BatcherError::invalid_config(CLEANUP_INTERVAL_KEY, "must be greater than zero"));
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, BatcherError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| BatcherError::invalid_config(key, format!("`{raw}`: {e}")))
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration, BatcherError> {
    let secs: f64 = parse_value(key, raw)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| BatcherError::invalid_config(key, format!("`{raw}`: {e}")))
}

mod secs_f64 {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
