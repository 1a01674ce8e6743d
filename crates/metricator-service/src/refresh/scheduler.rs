use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use super::{RefreshService, RefreshTrigger, Trigger};

/// Periodically refreshes a fixed set of keys, independent of client traffic.
#[derive(Debug, Clone)]
pub struct Scheduler {
    refresh: RefreshService,
    keys: Vec<String>,
    interval: Duration,
    immediate: bool,
}

impl Scheduler {
    pub fn new(refresh: RefreshService, keys: Vec<String>, interval: Duration) -> Self {
        Self {
            refresh,
            keys,
            interval,
            immediate: false,
        }
    }

    /// Fire the first tick right away instead of after one interval.
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Runs a single tick, returning how many refreshes were started.
    ///
    /// Expired leases are reclaimed first. Keys whose refresh is already running are skipped.
    pub fn tick(&self) -> usize {
        self.refresh.reclaim_expired_leases();

        let mut started = 0;
        for key in &self.keys {
            match self.refresh.request_refresh(key, Trigger::Scheduled) {
                RefreshTrigger::Started(_) => started += 1,
                RefreshTrigger::InProgress => {
                    tracing::debug!(key, "skipping scheduled refresh, one is in progress");
                }
            }
        }

        metric!(counter("refresh.scheduler.tick") += 1);
        tracing::debug!(started, keys = self.keys.len(), "scheduler tick");
        started
    }

    /// Ticks until `shutdown` turns `true` or its sender goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if self.keys.is_empty() {
            tracing::info!("no tracked keys, refresh scheduler not started");
            return;
        }

        let start = if self.immediate {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticks = interval_at(start, self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval = %humantime_serde::re::humantime::format_duration(self.interval),
            keys = ?self.keys,
            "refresh scheduler started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("refresh scheduler shutting down");
                        break;
                    }
                }
                _ = ticks.tick() => {
                    self.tick();
                }
            }
        }
    }
}
