//! Test doubles shared by the unit tests of this crate.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

pub use metricator_test::{DataServer, setup, tempdir};

use crate::caching::{CacheContents, CacheStore, InMemoryStore};
use crate::refresh::{FetchError, RemoteSource};

type Outcome = Result<&'static str, FetchError>;

/// A [`RemoteSource`] that plays back a fixed list of outcomes.
///
/// Once the script is exhausted, the last outcome repeats.
#[derive(Debug)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<Outcome>>,
    last: Mutex<Option<Outcome>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(script: impl IntoIterator<Item = Outcome>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(None),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding(payload: &'static str) -> Self {
        Self::new([Ok(payload)])
    }

    pub fn failing(error: FetchError) -> Self {
        Self::new([Err(error)])
    }

    /// Every fetch sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many fetches were started.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Outcome {
        let mut last = self.last.lock().unwrap();
        if let Some(outcome) = self.script.lock().unwrap().pop_front() {
            *last = Some(outcome);
        }
        last.clone()
            .unwrap_or_else(|| Err(FetchError::TransportFailure("empty script".into())))
    }
}

impl RemoteSource for ScriptedSource {
    fn fetch<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Bytes, FetchError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.next_outcome().map(|s| Bytes::from_static(s.as_bytes()))
        })
    }
}

/// An [`InMemoryStore`] that counts the writes it receives.
#[derive(Debug)]
pub struct CountingStore {
    inner: InMemoryStore,
    writes: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::new(1024 * 1024),
            writes: AtomicUsize::new(0),
        }
    }

    /// How many writes were attempted, including rejected ones.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl CacheStore for CountingStore {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheContents<Option<Bytes>>> {
        self.inner.get(key)
    }

    fn set<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> BoxFuture<'a, CacheContents> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value, ttl)
    }
}
