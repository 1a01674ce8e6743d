use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::refresh::Backoff;

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
    /// The log level.
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
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A tag name to report the environment to, for each metric. Defaults to not sending such a tag.
    pub environment_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "metricator".into(),
            hostname_tag: None,
            environment_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Where and how the dataset is fetched from.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Base URL of the remote server. The dataset is read from `{url}/api/data`.
    pub url: Option<Url>,
    /// Bearer token sent with every request.
    ///
    /// Defaults to the `METRICATOR_SOURCE_TOKEN` environment variable.
    pub token: Option<String>,
    /// Upper bound for one fetch, including reading the body.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: env::var("METRICATOR_SOURCE_TOKEN").ok(),
            timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Cache entry settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// The key the dataset is stored under.
    pub dataset_key: String,
    /// How long a fetched payload stays fresh.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Capacity of the in-memory store in bytes. Ignored when `cache_dir` is set.
    pub in_memory_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dataset_key: "dataset".into(),
            ttl: Duration::from_secs(3600),
            in_memory_capacity: 512 * 1024 * 1024,
        }
    }
}

/// Background refresh settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Keys the scheduler refreshes periodically.
    pub tracked_keys: Vec<String>,
    /// Period of the scheduler.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Fire the first scheduler tick right away instead of after one `interval`.
    pub refresh_on_startup: bool,
    /// Total number of fetch attempts per job, including the first one.
    pub max_attempts: u32,
    /// Delay between failed attempts.
    pub backoff: Backoff,
    /// How long a refresh lease may be held before the scheduler reclaims it.
    ///
    /// When unset, it is derived from the fetch timeout and the retry policy.
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Option<Duration>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            tracked_keys: vec!["dataset".into()],
            interval: Duration::from_secs(3600),
            refresh_on_startup: false,
            max_attempts: 3,
            backoff: Backoff::default(),
            lease_ttl: None,
        }
    }
}

/// Metric task group settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TasksConfig {
    /// The maximum number of task groups computing at the same time.
    pub max_concurrent_groups: Option<usize>,
    /// How long a completed group can still be polled.
    #[serde(with = "humantime_serde")]
    pub poll_window: Duration,
    /// How often completed groups past their poll window are dropped.
    #[serde(with = "humantime_serde")]
    pub eviction_interval: Duration,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent_groups: Some(200),
            poll_window: Duration::from_secs(90),
            eviction_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use when caching files.
    ///
    /// When unset, entries are kept in memory only.
    pub cache_dir: Option<PathBuf>,

    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The remote data source.
    pub source: SourceConfig,

    /// Cache entry settings.
    pub cache: CacheConfig,

    /// Background refresh of cached keys.
    pub refresh: RefreshConfig,

    /// Metric task groups.
    pub tasks: TasksConfig,
}

impl Config {
    /// The lease TTL to use, derived from the fetch settings unless configured.
    ///
    /// The derived value covers every attempt timing out and waiting the longest backoff, twice.
    pub fn lease_ttl(&self) -> Duration {
        if let Some(ttl) = self.refresh.lease_ttl {
            return ttl;
        }
        let attempts = self.refresh.max_attempts.max(1);
        let longest_backoff = (1..=attempts)
            .map(|attempt| self.refresh.backoff.ceiling(attempt))
            .max()
            .unwrap_or_default();
        let per_attempt = self.source.timeout.saturating_add(longest_backoff);
        per_attempt.saturating_mul(attempts.saturating_mul(2))
    }

    /// Rejects settings that would break the background loops or every cache write.
    fn validate(&self) -> Result<()> {
        if self.cache.ttl.is_zero() {
            anyhow::bail!("cache.ttl must be positive");
        }
        if self.refresh.interval.is_zero() {
            anyhow::bail!("refresh.interval must be positive");
        }
        if self.tasks.eviction_interval.is_zero() {
            anyhow::bail!("tasks.eviction_interval must be positive");
        }
        Ok(())
    }
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:3021".to_owned()
    } else {
        "127.0.0.1:3021".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            source: SourceConfig::default(),
            cache: CacheConfig::default(),
            refresh: RefreshConfig::default(),
            tasks: TasksConfig::default(),
        }
    }
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

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.validate().context("invalid configuration")?;
        Ok(config)
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
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::BackoffStrategy;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache, CacheConfig::default());
        assert_eq!(cfg.cache.ttl, Duration::from_secs(3600));
        assert_eq!(cfg.refresh.max_attempts, 3);
        assert_eq!(cfg.refresh.backoff.strategy, BackoffStrategy::Fixed);
        assert_eq!(cfg.refresh.backoff.delay, Duration::from_secs(60));
        assert_eq!(cfg.tasks, TasksConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
            source:
              url: http://localhost:8080
              timeout: 30s
            cache:
              ttl: 10m
            refresh:
              backoff:
                strategy: exponential
                delay: 1s
            tasks:
              max_concurrent_groups: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(
            cfg.source.url.as_ref().map(Url::as_str),
            Some("http://localhost:8080/")
        );
        assert_eq!(cfg.source.timeout, Duration::from_secs(30));
        assert_eq!(cfg.source.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.cache.ttl, Duration::from_secs(600));
        assert_eq!(cfg.cache.dataset_key, "dataset");
        assert_eq!(cfg.refresh.backoff.strategy, BackoffStrategy::Exponential);
        assert_eq!(cfg.refresh.backoff.delay, Duration::from_secs(1));
        assert_eq!(cfg.refresh.backoff.max_delay, Duration::from_secs(600));
        assert_eq!(cfg.tasks.max_concurrent_groups, None);
        assert_eq!(cfg.tasks.poll_window, Duration::from_secs(90));
    }

    #[test]
    fn test_lease_ttl() {
        let yaml = r#"
            source:
              timeout: 10s
            refresh:
              max_attempts: 3
              backoff:
                strategy: exponential
                delay: 1s
                max_delay: 5s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        // attempts wait at most 1s, 2s and 4s
        assert_eq!(cfg.lease_ttl(), Duration::from_secs(84));

        // a fixed backoff waits `delay`, no matter the `max_delay`
        let yaml = r#"
            source:
              timeout: 10s
            refresh:
              max_attempts: 3
              backoff:
                delay: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.lease_ttl(), Duration::from_secs((10 + 3600) * 6));

        let yaml = r#"
            refresh:
              lease_ttl: 2m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.lease_ttl(), Duration::from_secs(120));
    }

    #[test]
    fn test_empty_file() {
        assert!(Config::from_reader("  \n".as_bytes()).is_err());
    }

    #[test]
    fn test_zero_durations() {
        for yaml in [
            "cache:\n  ttl: 0s\n",
            "refresh:\n  interval: 0s\n",
            "tasks:\n  eviction_interval: 0s\n",
        ] {
            let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
            assert!(
                format!("{err:#}").contains("must be positive"),
                "{yaml:?} was accepted"
            );
        }
    }

    #[test]
    fn test_level_filter() {
        let cfg = Config::from_reader("logging:\n  level: debug\n".as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert!(Config::from_reader("logging:\n  level: loud\n".as_bytes()).is_err());
    }
}
