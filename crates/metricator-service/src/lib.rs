//! Metricator keeps a cheap, eventually fresh local copy of an expensive remote dataset and
//! computes derived metrics over it without ever blocking a client on the remote fetch.
//!
//! The crate is split into the following layers:
//!
//! - [`caching`]: the TTL'd key/value store that holds the fetched payloads.
//! - [`refresh`]: single-flight refreshes of cache keys, guarded by leases and retried with
//!   backoff, plus the [`Scheduler`](refresh::Scheduler) that refreshes tracked keys periodically.
//! - [`compute`]: the metric registry and the pure metric computations.
//! - [`tasks`]: the coordinator that fans a metrics request out into independent jobs and
//!   answers status polls for the whole group.
//! - [`services`]: wires all of the above together from a [`Config`](config::Config).

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod compute;
pub mod config;
pub mod refresh;
pub mod services;
pub mod tasks;
pub mod utils;

#[cfg(test)]
mod test;
