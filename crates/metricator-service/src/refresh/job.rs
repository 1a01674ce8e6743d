use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::caching::DataCache;
use crate::utils::futures::{m, measure};

use super::Backoff;
use super::lease::LeaseGuard;
use super::source::{FetchError, RemoteSource};

/// Lifecycle of a [`FetchJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Holds the lease, but has not started fetching yet.
    Pending,
    /// An attempt is in flight.
    Running,
    /// The last attempt failed and the job waits out its backoff.
    Retrying,
    /// The payload was written to the cache.
    Succeeded,
    /// All attempts failed. The cache was not touched.
    Failed,
}

impl FetchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FetchState::Succeeded | FetchState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FetchState::Pending => "pending",
            FetchState::Running => "running",
            FetchState::Retrying => "retrying",
            FetchState::Succeeded => "succeeded",
            FetchState::Failed => "failed",
        }
    }
}

/// What caused a fetch job to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A reader found the key absent or expired.
    CacheMiss,
    /// A scheduler tick.
    Scheduled,
    /// An operator asked for it.
    Manual,
    /// The warm-up right after startup.
    Startup,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::CacheMiss => "cache_miss",
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
            Trigger::Startup => "startup",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How fetch jobs store their result and retry failures.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    /// TTL of the written cache entry.
    pub ttl: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

/// A point-in-time view of a fetch job.
#[derive(Debug, Clone)]
pub struct FetchSnapshot {
    pub key: String,
    pub trigger: Trigger,
    pub state: FetchState,
    /// Attempts started so far.
    pub attempt: u32,
    pub max_attempts: u32,
    /// The delay waited before the next attempt, while [`FetchState::Retrying`].
    pub backoff_delay: Option<Duration>,
    pub last_error: Option<FetchError>,
}

/// The final result of a fetch job.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub key: String,
    pub state: FetchState,
    pub attempts: u32,
    /// The error of the last failed attempt, also set when a retry eventually succeeded.
    pub error: Option<FetchError>,
}

impl FetchOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == FetchState::Succeeded
    }
}

/// Fetches one key from the remote source and writes it to the cache, retrying with backoff.
///
/// The job is an explicit state machine driven by [`advance`](Self::advance). Every transition
/// is published to subscribers of the job.
pub struct FetchJob {
    key: String,
    trigger: Trigger,
    attempt: u32,
    max_attempts: u32,
    backoff: Backoff,
    backoff_delay: Option<Duration>,
    state: FetchState,
    last_error: Option<FetchError>,
    ttl: Duration,
    source: Arc<dyn RemoteSource>,
    cache: DataCache,
    status: watch::Sender<FetchSnapshot>,
}

impl fmt::Debug for FetchJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchJob")
            .field("key", &self.key)
            .field("trigger", &self.trigger)
            .field("state", &self.state)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_delay", &self.backoff_delay)
            .finish()
    }
}

impl FetchJob {
    pub fn new(
        key: &str,
        trigger: Trigger,
        policy: FetchPolicy,
        source: Arc<dyn RemoteSource>,
        cache: DataCache,
    ) -> Self {
        let max_attempts = policy.max_attempts.max(1);
        let (status, _) = watch::channel(FetchSnapshot {
            key: key.to_owned(),
            trigger,
            state: FetchState::Pending,
            attempt: 0,
            max_attempts,
            backoff_delay: None,
            last_error: None,
        });

        Self {
            key: key.to_owned(),
            trigger,
            attempt: 0,
            max_attempts,
            backoff: policy.backoff,
            backoff_delay: None,
            state: FetchState::Pending,
            last_error: None,
            ttl: policy.ttl,
            source,
            cache,
            status,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The delay before the next attempt, while retrying.
    pub fn backoff_delay(&self) -> Option<Duration> {
        self.backoff_delay
    }

    pub fn last_error(&self) -> Option<&FetchError> {
        self.last_error.as_ref()
    }

    pub fn subscribe(&self) -> watch::Receiver<FetchSnapshot> {
        self.status.subscribe()
    }

    /// Performs a single state transition and returns the new state.
    ///
    /// `Running` performs one fetch attempt and `Retrying` sleeps for the backoff delay.
    /// Terminal states stay where they are.
    pub async fn advance(&mut self) -> FetchState {
        match self.state {
            FetchState::Pending => self.state = FetchState::Running,
            FetchState::Running => {
                self.attempt += 1;
                metric!(counter("refresh.fetch.attempt") += 1, "trigger" => self.trigger.as_str());

                match self.attempt_once().await {
                    Ok(()) => {
                        self.backoff_delay = None;
                        self.state = FetchState::Succeeded;
                    }
                    Err(err) => {
                        metric!(
                            counter("refresh.fetch.error") += 1,
                            "kind" => err.kind(),
                        );
                        if self.attempt < self.max_attempts {
                            let delay = self.backoff.delay_for(self.attempt);
                            tracing::warn!(
                                attempt = self.attempt,
                                max_attempts = self.max_attempts,
                                error = %err,
                                "fetch attempt failed, retrying in {}",
                                humantime_serde::re::humantime::format_duration(delay),
                            );
                            self.backoff_delay = Some(delay);
                            self.state = FetchState::Retrying;
                        } else {
                            self.backoff_delay = None;
                            self.state = FetchState::Failed;
                        }
                        self.last_error = Some(err);
                    }
                }
            }
            FetchState::Retrying => {
                if let Some(delay) = self.backoff_delay {
                    tokio::time::sleep(delay).await;
                }
                self.state = FetchState::Running;
            }
            FetchState::Succeeded | FetchState::Failed => {}
        }

        self.publish();
        self.state
    }

    async fn attempt_once(&self) -> Result<(), FetchError> {
        let payload: Bytes =
            measure("refresh.fetch", m::result, self.source.fetch(&self.key)).await?;
        self.cache.set_raw(&self.key, payload, self.ttl).await?;
        Ok(())
    }

    fn publish(&self) {
        self.status.send_replace(FetchSnapshot {
            key: self.key.clone(),
            trigger: self.trigger,
            state: self.state,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            backoff_delay: self.backoff_delay,
            last_error: self.last_error.clone(),
        });
    }

    /// Drives the job to a terminal state and releases the lease.
    pub async fn run(mut self, lease: LeaseGuard) -> FetchOutcome {
        while !self.advance().await.is_terminal() {}

        if !lease.release() {
            tracing::warn!("refresh lease was lost while the fetch was running");
        }

        metric!(
            counter("refresh.job") += 1,
            "trigger" => self.trigger.as_str(),
            "state" => self.state.as_str(),
        );
        match self.state {
            FetchState::Succeeded => {
                tracing::info!(attempts = self.attempt, "refreshed cache entry");
            }
            _ => {
                let error = self.last_error.as_ref().map(|e| e as &dyn std::error::Error);
                tracing::error!(attempts = self.attempt, error, "giving up on refresh");
            }
        }

        FetchOutcome {
            key: self.key,
            state: self.state,
            attempts: self.attempt,
            error: self.last_error,
        }
    }
}

/// A spawned fetch job.
#[derive(Debug)]
pub struct FetchHandle {
    status: watch::Receiver<FetchSnapshot>,
    handle: JoinHandle<FetchOutcome>,
}

impl FetchHandle {
    pub(super) fn new(
        status: watch::Receiver<FetchSnapshot>,
        handle: JoinHandle<FetchOutcome>,
    ) -> Self {
        Self { status, handle }
    }

    /// The latest published state of the job.
    pub fn snapshot(&self) -> FetchSnapshot {
        self.status.borrow().clone()
    }

    /// Waits for the job to finish. `None` if the job panicked or its runtime shut down.
    pub async fn wait(self) -> Option<FetchOutcome> {
        match self.handle.await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::error!(error = dynerr, "fetch job did not complete");
                None
            }
        }
    }
}
