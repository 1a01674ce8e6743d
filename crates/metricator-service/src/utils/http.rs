use std::time::Duration;

use crate::config::SourceConfig;

pub const USER_AGENT: &str = concat!("metricator/", env!("CARGO_PKG_VERSION"));

/// Timeouts applied to requests against the remote data source.
#[derive(Copy, Clone, Debug)]
pub struct SourceTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one fetch, including reading the body.
    pub fetch: Duration,
}

impl SourceTimeouts {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            fetch: config.timeout,
        }
    }
}

impl Default for SourceTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            fetch: Duration::from_secs(600),
        }
    }
}

/// Creates a [`reqwest::Client`] for talking to the remote data source.
pub fn create_client(timeouts: &SourceTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(USER_AGENT)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.fetch)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}
