//! Fans a metrics request out into independent jobs and tracks them as one group.
//!
//! The request/response model works like this:
//! - [`TaskCoordinator::dispatch`] reads the cached dataset once, spawns one job per requested
//!   metric on the cpu runtime, and immediately returns a [`GroupId`].
//! - That [`GroupId`] can later be polled using [`status`](TaskCoordinator::status), or
//!   [`wait_for_status`](TaskCoordinator::wait_for_status) with a timeout.
//! - Once every job is done, the group stays pollable for the configured poll window and is then
//!   dropped by [`evict_expired`](TaskCoordinator::evict_expired).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sentry::SentryFutureExt;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::compute::{ComputeError, Dataset, MetricRegistry, MetricValue};
use crate::config::TasksConfig;
use crate::refresh::{Lookup, RefreshService};
use crate::utils::futures::CallOnDrop;

mod types;

pub use types::{DispatchError, GroupId, GroupStatus, JobState, MetricResult, StatusError};

/// Progress of one metric job, published by the job itself.
#[derive(Debug, Clone)]
enum JobProgress {
    Pending,
    Running,
    Done(Result<MetricValue, ComputeError>),
}

struct MetricJob {
    name: String,
    progress: watch::Receiver<JobProgress>,
}

impl MetricJob {
    fn state(&self) -> JobState {
        match &*self.progress.borrow() {
            JobProgress::Done(Ok(_)) => JobState::Succeeded,
            JobProgress::Done(Err(_)) => JobState::Failed,
            // the job went away without reporting a result
            _ if self.progress.has_changed().is_err() => JobState::Failed,
            JobProgress::Pending => JobState::Pending,
            JobProgress::Running => JobState::Running,
        }
    }

    fn outcome(&self) -> Result<MetricValue, ComputeError> {
        match &*self.progress.borrow() {
            JobProgress::Done(result) => result.clone(),
            _ => Err(ComputeError::Aborted),
        }
    }
}

/// Completion bookkeeping shared by the jobs of one group.
struct GroupProgress {
    remaining: AtomicUsize,
    /// Set once the last job finished.
    completed_at: watch::Sender<Option<Instant>>,
}

impl GroupProgress {
    /// Marks one job as done. The last one completes the group and frees its slot.
    fn job_finished(&self, current_groups: &AtomicUsize) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.completed_at.send_replace(Some(Instant::now()));
            current_groups.fetch_sub(1, Ordering::Relaxed);
            metric!(counter("tasks.group.completed") += 1);
        }
    }
}

struct TaskGroup {
    created_at: Instant,
    jobs: Vec<MetricJob>,
    completed_at: watch::Receiver<Option<Instant>>,
}

impl TaskGroup {
    fn completed_at(&self) -> Option<Instant> {
        *self.completed_at.borrow()
    }

    fn status(&self) -> GroupStatus {
        if self.completed_at().is_none() {
            return GroupStatus::Pending;
        }
        GroupStatus::Completed(
            self.jobs
                .iter()
                .map(|job| MetricResult {
                    name: job.name.clone(),
                    outcome: job.outcome(),
                })
                .collect(),
        )
    }
}

type GroupMap = Arc<Mutex<BTreeMap<GroupId, TaskGroup>>>;

/// Dispatches metric jobs and answers status queries by group.
#[derive(Clone)]
pub struct TaskCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    refresh: RefreshService,
    registry: Arc<MetricRegistry>,
    dataset_key: String,
    cpu_pool: tokio::runtime::Handle,
    groups: GroupMap,
    max_concurrent_groups: Option<usize>,
    current_groups: Arc<AtomicUsize>,
    poll_window: Duration,
    taskmon: tokio_metrics::TaskMonitor,
}

impl fmt::Debug for TaskCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups = self.inner.groups.try_lock().map(|g| g.len()).unwrap_or_default();
        f.debug_struct("TaskCoordinator")
            .field("dataset_key", &self.inner.dataset_key)
            .field("registry", &self.inner.registry)
            .field("groups", &groups)
            .field("current_groups", &self.inner.current_groups.load(Ordering::Relaxed))
            .finish()
    }
}

impl TaskCoordinator {
    pub fn new(
        refresh: RefreshService,
        registry: MetricRegistry,
        dataset_key: String,
        cpu_pool: tokio::runtime::Handle,
        config: &TasksConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                refresh,
                registry: Arc::new(registry),
                dataset_key,
                cpu_pool,
                groups: Arc::new(Mutex::new(BTreeMap::new())),
                max_concurrent_groups: config.max_concurrent_groups,
                current_groups: Arc::new(AtomicUsize::new(0)),
                poll_window: config.poll_window,
                taskmon: tokio_metrics::TaskMonitor::new(),
            }),
        }
    }

    /// The monitor all metric jobs are instrumented with.
    pub fn task_monitor(&self) -> &tokio_metrics::TaskMonitor {
        &self.inner.taskmon
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.inner.registry
    }

    fn groups(&self) -> std::sync::MutexGuard<'_, BTreeMap<GroupId, TaskGroup>> {
        self.inner.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts one job per name over the cached dataset.
    ///
    /// Fails without creating any job if `names` is empty, the dataset is not cached (a refresh
    /// is started in that case), the cache cannot be read, or too many groups are running.
    pub async fn dispatch(&self, names: Vec<String>) -> Result<GroupId, DispatchError> {
        if names.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "no metrics provided".into(),
            ));
        }

        let dataset = match self
            .inner
            .refresh
            .get_or_refresh::<Dataset>(&self.inner.dataset_key)
            .await?
        {
            Lookup::Ready(dataset) => Arc::new(dataset),
            Lookup::Pending => {
                metric!(counter("tasks.group.rejected") += 1, "reason" => "data_unavailable");
                return Err(DispatchError::DataUnavailable);
            }
        };

        let current_groups = Arc::clone(&self.inner.current_groups);
        let num_groups = current_groups.fetch_add(1, Ordering::Relaxed);
        metric!(gauge("tasks.group.in_flight") = num_groups as u64);
        if let Some(max_concurrent_groups) = self.inner.max_concurrent_groups {
            if num_groups >= max_concurrent_groups {
                current_groups.fetch_sub(1, Ordering::Relaxed);
                metric!(counter("tasks.group.rejected") += 1, "reason" => "too_many_requests");
                return Err(DispatchError::TooManyRequests);
            }
        }

        let group_id = GroupId::random();
        let (completed_tx, completed_rx) = watch::channel(None);
        let progress = Arc::new(GroupProgress {
            remaining: AtomicUsize::new(names.len()),
            completed_at: completed_tx,
        });

        let mut jobs = Vec::with_capacity(names.len());
        let mut senders = Vec::with_capacity(names.len());
        for name in names {
            let (tx, rx) = watch::channel(JobProgress::Pending);
            jobs.push(MetricJob {
                name: name.clone(),
                progress: rx,
            });
            senders.push((name, tx));
        }

        // Register the group before any job runs, so it is pollable right away.
        self.groups().insert(
            group_id,
            TaskGroup {
                created_at: Instant::now(),
                jobs,
                completed_at: completed_rx,
            },
        );
        metric!(counter("tasks.group.accepted") += 1);

        for (name, sender) in senders {
            self.spawn_job(
                group_id,
                name,
                sender,
                Arc::clone(&dataset),
                Arc::clone(&progress),
            );
        }

        tracing::debug!(%group_id, "dispatched metric jobs");
        Ok(group_id)
    }

    fn spawn_job(
        &self,
        group_id: GroupId,
        name: String,
        sender: watch::Sender<JobProgress>,
        dataset: Arc<Dataset>,
        progress: Arc<GroupProgress>,
    ) {
        let registry = Arc::clone(&self.inner.registry);
        let current_groups = Arc::clone(&self.inner.current_groups);
        let done_token = CallOnDrop::new(move || progress.job_finished(&current_groups));

        let spawn_time = Instant::now();
        let job = async move {
            let _done_token = done_token; // move into the future
            metric!(timer("tasks.job.first_poll") = spawn_time.elapsed());

            sender.send_replace(JobProgress::Running);
            let result = registry.compute(&name, &dataset);

            match &result {
                Ok(_) => metric!(counter("tasks.job") += 1, "status" => "ok"),
                Err(err) => {
                    tracing::debug!(%group_id, metric = name, error = %err, "metric job failed");
                    metric!(counter("tasks.job") += 1, "status" => err.kind());
                }
            }
            sender.send_replace(JobProgress::Done(result));
        }
        .bind_hub(sentry::Hub::new_from_top(sentry::Hub::current()));

        self.inner.cpu_pool.spawn(self.inner.taskmon.instrument(job));
    }

    /// The aggregate status of a group.
    pub fn status(&self, group_id: GroupId) -> Result<GroupStatus, StatusError> {
        match self.groups().get(&group_id) {
            Some(group) => Ok(group.status()),
            None => {
                metric!(counter("tasks.group.unknown") += 1);
                Err(StatusError::NotFound(group_id))
            }
        }
    }

    /// Like [`status`](Self::status), but waits up to `timeout` for the group to complete.
    pub async fn wait_for_status(
        &self,
        group_id: GroupId,
        timeout: Duration,
    ) -> Result<GroupStatus, StatusError> {
        let completed_at = self
            .groups()
            .get(&group_id)
            .map(|group| group.completed_at.clone());
        let Some(mut completed_at) = completed_at else {
            metric!(counter("tasks.group.unknown") += 1);
            return Err(StatusError::NotFound(group_id));
        };

        // An error means the jobs are all gone, which `status` reports as completed.
        let _ = tokio::time::timeout(timeout, completed_at.wait_for(Option::is_some)).await;
        self.status(group_id)
    }

    /// The state of every job of a group, in request order.
    pub fn job_states(&self, group_id: GroupId) -> Result<Vec<(String, JobState)>, StatusError> {
        let groups = self.groups();
        let group = groups.get(&group_id).ok_or(StatusError::NotFound(group_id))?;
        Ok(group
            .jobs
            .iter()
            .map(|job| (job.name.clone(), job.state()))
            .collect())
    }

    /// Drops completed groups whose poll window has passed. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let poll_window = self.inner.poll_window;
        let mut groups = self.groups();
        let before = groups.len();
        groups.retain(|_, group| match group.completed_at() {
            Some(completed_at) => {
                let keep = completed_at.elapsed() < poll_window;
                if !keep {
                    metric!(timer("tasks.group.lifetime") = group.created_at.elapsed());
                }
                keep
            }
            None => true,
        });
        let evicted = before - groups.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted completed task groups");
        }
        evicted
    }
}

trait ToMaxingI64: TryInto<i64> + Copy {
    fn to_maxing_i64(self) -> i64 {
        self.try_into().unwrap_or(i64::MAX)
    }
}

impl<T: TryInto<i64> + Copy> ToMaxingI64 for T {}

/// Reports the counters of a [`tokio_metrics::TaskMonitor`] interval.
pub fn record_task_metrics(name: &str, metrics: &tokio_metrics::TaskMetrics) {
    metric!(counter("tasks.instrumented_count") += metrics.instrumented_count.to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.dropped_count") += metrics.dropped_count.to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.first_poll_count") += metrics.first_poll_count.to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.total_first_poll_delay") += metrics.total_first_poll_delay.as_millis().to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.total_idle_duration") += metrics.total_idle_duration.as_millis().to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.total_scheduled_duration") += metrics.total_scheduled_duration.as_millis().to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.total_poll_count") += metrics.total_poll_count.to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.total_poll_duration") += metrics.total_poll_duration.as_millis().to_maxing_i64(), "taskname" => name);
    metric!(counter("tasks.total_slow_poll_count") += metrics.total_slow_poll_count.to_maxing_i64(), "taskname" => name);
}
