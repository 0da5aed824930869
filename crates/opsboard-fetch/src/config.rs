use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the engine.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: match env::var("STATSD_SERVER") {
                Ok(metrics_statsd) => Some(metrics_statsd),
                Err(_) => None,
            },
            prefix: "opsboard".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the in-memory fetch cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum number of entries held at once.
    ///
    /// Past this the least-recently-touched entry is evicted.
    pub capacity: usize,

    /// Time-to-live applied to entries whose fetch did not specify one.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// How often the background sweeper purges expired entries.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 100,
            default_ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Fine-tuning of the change-notification subscription pool.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SubscriptionSettings {
    /// Maximum number of concurrently open subscriptions.
    ///
    /// Subscribing past this forcibly closes the earliest-created one.
    pub max_active: usize,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self { max_active: 10 }
    }
}

/// Fine-tuning of the activity recorder.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ActivitySettings {
    /// Maximum number of events retained; the oldest are dropped first.
    pub max_events: usize,

    /// The sliding window over which rolling statistics are computed.
    #[serde(with = "humantime_serde")]
    pub stats_window: Duration,
}

impl Default for ActivitySettings {
    fn default() -> Self {
        Self {
            max_events: 1000,
            stats_window: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which log level and format to use.
    pub logging: Logging,

    /// Whether and where to report metrics.
    pub metrics: Metrics,

    /// Capacity and expiry of the fetch cache.
    pub cache: CacheSettings,

    /// Bounds on the subscription pool.
    pub subscriptions: SubscriptionSettings,

    /// Retention of the activity recorder.
    pub activity: ActivitySettings,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::invalid_value(de::Unexpected::Str(v), &self)),
        }
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_limits() {
        let config = Config::default();
        assert_eq!(config.cache.capacity, 100);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(300));
        assert_eq!(config.cache.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.subscriptions.max_active, 10);
        assert_eq!(config.activity.max_events, 1000);
    }

    #[test]
    fn test_parse_durations_and_level() {
        let yaml = r#"
            logging:
              level: debug
            cache:
              capacity: 3
              default_ttl: 10s
              sweep_interval: 1m
        "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.logging.level, LevelFilter::DEBUG);
        assert_eq!(config.cache.capacity, 3);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(10));
        assert_eq!(config.cache.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.subscriptions.max_active, 10);
    }

    #[test]
    fn test_empty_config_file_is_rejected() {
        assert!(Config::from_reader("  \n".as_bytes()).is_err());
    }
}
