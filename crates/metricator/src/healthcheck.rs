use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use metricator_service::config::Config;

/// Asks a running server for `GET /healthcheck`, failing unless it answers with a success.
pub fn healthcheck(config: Config, addr: Option<SocketAddr>, timeout: u64) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout))
        .build()?;

    let addr = match addr {
        Some(addr) => addr,
        None => config
            .bind
            .parse()
            .with_context(|| format!("invalid bind address `{}`", config.bind))?,
    };

    let url = format!("http://{addr}/healthcheck");
    tracing::debug!("Sending request to: {url}");

    match client.get(url).send() {
        Ok(response) if response.status().is_success() => {
            println!("OK");
            Ok(())
        }
        Ok(response) => {
            println!("ERROR");
            bail!("Metricator ({addr}) is unhealthy. Status: {}", response.status())
        }
        Err(error) => {
            println!("ERROR");
            bail!("Failed to check Metricator ({addr}) health: {error}")
        }
    }
}
