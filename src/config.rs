//! Configuration loaded from an optional TOML file and `ACCOUNTGEO_*` environment variables.
//!
//! Durations accept either a bare number of seconds or a unit-suffixed string
//! such as `200ms`, `5s`, `2m` or `30d`.

use crate::cache::store::StoreConfig;
use crate::coordinator::CoordinatorConfig;
use crate::peer::graphql::GraphqlConfig;
use anyhow::{Context, bail};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Prefix for environment overrides, e.g. `ACCOUNTGEO_MAX_CONCURRENT=4`.
pub const ENV_PREFIX: &str = "ACCOUNTGEO_";

/// Read from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "accountgeo.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base level for this crate's targets; everything else logs at `warn`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding the persisted cache blob.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    #[serde(default = "default_storage_key")]
    pub storage_key: String,

    #[serde(
        default = "default_cache_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub cache_ttl: Duration,
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,
    #[serde(
        default = "default_save_debounce",
        deserialize_with = "deserialize_duration"
    )]
    pub save_debounce: Duration,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(
        default = "default_min_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub min_interval: Duration,
    #[serde(
        default = "default_drain_cooldown",
        deserialize_with = "deserialize_duration"
    )]
    pub drain_cooldown: Duration,
    #[serde(
        default = "default_bridge_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub bridge_timeout: Duration,
    #[serde(
        default = "default_max_backoff_check",
        deserialize_with = "deserialize_duration"
    )]
    pub max_backoff_check: Duration,
    #[serde(
        default = "default_rate_limit_wait",
        deserialize_with = "deserialize_duration"
    )]
    pub default_rate_limit_wait: Duration,

    #[serde(default)]
    pub graphql_url: Option<Url>,
    #[serde(default)]
    pub graphql_bearer: Option<String>,
    #[serde(default)]
    pub graphql_csrf: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_storage_key() -> String {
    "twitter_location_cache".to_string()
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn default_max_cache_size() -> usize {
    5000
}

fn default_save_debounce() -> Duration {
    Duration::from_secs(5)
}

fn default_max_concurrent() -> usize {
    2
}

fn default_min_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_drain_cooldown() -> Duration {
    Duration::from_millis(200)
}

fn default_bridge_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_backoff_check() -> Duration {
    Duration::from_secs(60)
}

fn default_rate_limit_wait() -> Duration {
    Duration::from_secs(60)
}

impl Config {
    /// Load from `file` (or `accountgeo.toml` if present) and the environment,
    /// environment winning.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let path = match file {
            Some(path) if !path.exists() => {
                bail!("config file {} does not exist", path.display())
            }
            Some(path) => path,
            None => Path::new(DEFAULT_CONFIG_FILE),
        };
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment.extract().context("Failed to load config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent == 0 {
            bail!("max_concurrent must be at least 1");
        }
        if self.max_cache_size == 0 {
            bail!("max_cache_size must be at least 1");
        }
        if self.max_backoff_check.is_zero() {
            bail!("max_backoff_check must be greater than zero");
        }
        if self.storage_key.trim().is_empty() {
            bail!("storage_key must not be empty");
        }
        Ok(())
    }

    pub fn store(&self) -> StoreConfig {
        StoreConfig {
            storage_key: self.storage_key.clone(),
            ttl: self.cache_ttl,
            save_debounce: self.save_debounce,
        }
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_concurrent: self.max_concurrent,
            min_interval: self.min_interval,
            drain_cooldown: self.drain_cooldown,
            max_backoff_check: self.max_backoff_check,
        }
    }

    /// `None` when no endpoint is configured.
    pub fn graphql(&self) -> Option<GraphqlConfig> {
        let url = self.graphql_url.clone()?;
        Some(GraphqlConfig {
            url,
            bearer: self.graphql_bearer.clone(),
            csrf_token: self.graphql_csrf.clone(),
            default_rate_limit_wait: self.default_rate_limit_wait,
            // Outlives the bridge timeout so late answers are still drained.
            request_timeout: self.bridge_timeout * 2,
        })
    }
}

fn duration_parser() -> DurationParser<'static> {
    DurationParser::with_time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
        TimeUnit::Day,
    ])
}

/// Parse a human duration like `5s` or `30d`; a bare number is seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let parsed = duration_parser()
        .parse(value.trim())
        .map_err(|e| format!("invalid duration '{value}': {e}"))?;
    Duration::try_from(parsed).map_err(|e| format!("invalid duration '{value}': {e}"))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration string like '5s' or a number of seconds")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            parse_duration(value).map_err(E::custom)
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}
