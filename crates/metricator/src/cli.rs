//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metricator_service::config::Config;
use metricator_service::metrics;

use crate::healthcheck;
use crate::logging;
use crate::server;

/// Metricator commands.
#[derive(Subcommand)]
enum Command {
    /// Run the web server.
    Run,

    /// Refresh every tracked key once and report the outcome.
    Refresh,

    /// Check the health of a running Metricator.
    Healthcheck {
        /// The address to check, defaults to the configured `bind`.
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "metricator", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        ..Default::default()
    });

    // SAFETY: We are at the start of the program and no other threads exist at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();

        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if tags.contains_key(&hostname_tag) {
                tracing::warn!(
                    "tag {} defined both as hostname tag and as a custom tag",
                    hostname_tag
                );
            }
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            } else {
                tracing::error!("could not read host name");
            }
        };
        if let Some(environment_tag) = config.metrics.environment_tag.clone() {
            if tags.contains_key(&environment_tag) {
                tracing::warn!(
                    "tag {} defined both as environment tag and as a custom tag",
                    environment_tag
                );
            }
            if let Some(environment) = sentry.options().environment.as_ref() {
                tags.insert(environment_tag, environment.to_string());
            } else {
                tracing::error!("environment name not available");
            }
        };

        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Refresh => server::refresh(config).context("failed to refresh tracked keys")?,
        Command::Healthcheck { addr, timeout } => healthcheck::healthcheck(config, addr, timeout)?,
    }

    Ok(())
}
