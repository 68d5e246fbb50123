use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
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
    /// The log level filter.
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
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "walletdata".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the pull-model cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CoalescerConfig {
    /// Maximum age of a cached member before a fetch referencing it goes back
    /// to the remote source.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
        }
    }
}

/// Fine-tuning of the push-model distributor.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SharingConfig {
    /// How long a shared subscription stays alive after its last observer
    /// detaches.
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// How long the replayed value stays valid for newly-attaching observers
    /// once a subscription has gone idle.
    #[serde(with = "humantime_serde")]
    pub replay_expiry: Duration,

    /// Fixed delay before a failed upstream is resubscribed.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Capacity of the fan-out channel between the upstream driver and the
    /// attached observers.
    pub channel_capacity: usize,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            replay_expiry: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(2),
            channel_capacity: 16,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration of the logging system.
    pub logging: Logging,

    /// Configuration of the metrics system.
    pub metrics: Metrics,

    /// Configuration of [`CoalescingCache`](crate::caching::CoalescingCache)
    /// instances.
    pub coalescer: CoalescerConfig,

    /// Configuration of
    /// [`SharedFlowDistributor`](crate::sharing::SharedFlowDistributor)
    /// instances.
    pub sharing: SharingConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Config::default());
        };

        let source = fs::read_to_string(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        serde_yaml::from_str(&source)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}
