use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use metricator_service::config::Config;
use metricator_service::metric;
use metricator_service::refresh::{RefreshTrigger, Trigger};
use metricator_service::services::SharedServices;
use metricator_service::tasks::TaskCoordinator;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::endpoints;

fn build_runtime(name: &str) -> Result<tokio::runtime::Runtime> {
    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name(name)
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;
    Ok(runtime)
}

/// Drops completed task groups past their poll window until `shutdown` fires.
async fn evict_task_groups(
    coordinator: TaskCoordinator,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticks.tick() => {
                let evicted = coordinator.evict_expired();
                metric!(counter("tasks.group.evicted") += evicted as i64);
            }
        }
    }
}

/// Starts all services and the HTTP server based on loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let io_pool = build_runtime("metricator-io")?;
    let cpu_pool = build_runtime("metricator-cpu")?;
    let web_pool = build_runtime("metricator-web")?;

    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{}`", config.bind))?;
    let eviction_interval = config.tasks.eviction_interval;

    let services = SharedServices::new(
        config,
        io_pool.handle().to_owned(),
        cpu_pool.handle().to_owned(),
    )
    .context("failed to create services")?;

    let warming = web_pool.block_on(services.warm_up());
    if warming > 0 {
        tracing::info!(keys = warming, "refreshing uncached keys in the background");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    io_pool.spawn(services.scheduler().run(shutdown_rx.clone()));
    io_pool.spawn(evict_task_groups(
        services.coordinator.clone(),
        eviction_interval,
        shutdown_rx,
    ));

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        web_pool.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal");
                handle.graceful_shutdown(Some(Duration::from_secs(10)));
            }
        });
    }

    let server = axum_server::bind(socket)
        .handle(handle)
        .serve(endpoints::create_app(services).into_make_service());
    tracing::info!("Starting HTTP server on {}", socket);

    let result = web_pool.block_on(server);
    shutdown_tx.send_replace(true);
    result?;

    tracing::info!("System shutdown complete");
    Ok(())
}

/// Refreshes every tracked key once, waiting for all fetch jobs to finish.
pub fn refresh(config: Config) -> Result<()> {
    let io_pool = build_runtime("metricator-io")?;
    let keys = config.refresh.tracked_keys.clone();

    let services = SharedServices::new(
        config,
        io_pool.handle().to_owned(),
        io_pool.handle().to_owned(),
    )
    .context("failed to create services")?;

    let mut failed = vec![];
    for key in &keys {
        let RefreshTrigger::Started(job) = services.refresh.request_refresh(key, Trigger::Manual)
        else {
            tracing::warn!(key, "refresh already in progress");
            continue;
        };

        match io_pool.block_on(job.wait()) {
            Some(outcome) if outcome.succeeded() => {
                println!("{key}: refreshed after {} attempt(s)", outcome.attempts);
            }
            Some(outcome) => {
                let reason = outcome
                    .error
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| outcome.state.as_str().to_owned());
                println!("{key}: failed after {} attempt(s): {reason}", outcome.attempts);
                failed.push(key.as_str());
            }
            None => {
                println!("{key}: fetch job panicked");
                failed.push(key.as_str());
            }
        }
    }

    if !failed.is_empty() {
        bail!("failed to refresh {}", failed.join(", "));
    }
    Ok(())
}
