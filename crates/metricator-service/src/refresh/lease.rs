use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// Identifies the owner of a refresh lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderId(Uuid);

impl HolderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HolderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The right to refresh one cache key.
#[derive(Debug, Clone)]
pub struct RefreshLease {
    pub key: String,
    pub holder: HolderId,
    pub acquired_at: Instant,
    /// `None` for leases that never expire.
    pub expires_at: Option<Instant>,
}

impl RefreshLease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

/// Grants at most one live refresh lease per key.
pub trait LeaseManager: Send + Sync + fmt::Debug {
    /// Grants the lease for `key` to `holder` if nobody else holds a live one.
    ///
    /// Never waits: a `false` means a refresh is already in progress.
    fn try_acquire(&self, key: &str, holder: HolderId) -> bool;

    /// Releases the lease for `key` if it is held by `holder`.
    ///
    /// Returns `false` without changing anything if `holder` does not own the lease.
    fn release(&self, key: &str, holder: HolderId) -> bool;

    /// Drops all leases past their deadline, returning their keys.
    fn reclaim_expired(&self) -> Vec<String>;

    /// The current live holder of `key`, if any.
    fn holder(&self, key: &str) -> Option<HolderId>;
}

/// A [`LeaseManager`] for a single process.
pub struct InMemoryLeases {
    ttl: Option<Duration>,
    leases: Mutex<HashMap<String, RefreshLease>>,
}

impl fmt::Debug for InMemoryLeases {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let held = self.leases.try_lock().map(|l| l.len()).unwrap_or_default();
        f.debug_struct("InMemoryLeases")
            .field("ttl", &self.ttl)
            .field("held", &held)
            .finish()
    }
}

impl InMemoryLeases {
    /// Creates a lease table. Leases live for `ttl`, or until released when `None`.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RefreshLease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LeaseManager for InMemoryLeases {
    fn try_acquire(&self, key: &str, holder: HolderId) -> bool {
        let now = Instant::now();
        let mut leases = self.lock();

        if let Some(current) = leases.get(key) {
            if current.is_live(now) {
                metric!(counter("refresh.lease.denied") += 1);
                tracing::debug!(key, holder = %current.holder, "refresh lease already held");
                return false;
            }
            tracing::warn!(key, holder = %current.holder, "taking over expired refresh lease");
        }

        leases.insert(
            key.to_owned(),
            RefreshLease {
                key: key.to_owned(),
                holder,
                acquired_at: now,
                expires_at: self.ttl.map(|ttl| now + ttl),
            },
        );
        metric!(counter("refresh.lease.granted") += 1);
        true
    }

    fn release(&self, key: &str, holder: HolderId) -> bool {
        let mut leases = self.lock();
        match leases.get(key) {
            Some(current) if current.holder == holder => {
                let held_for = current.acquired_at.elapsed();
                leases.remove(key);
                metric!(timer("refresh.lease.held") = held_for);
                true
            }
            current => {
                let current_holder = current.map(|lease| lease.holder);
                tracing::warn!(
                    key,
                    %holder,
                    ?current_holder,
                    "refresh lease released by a non-holder"
                );
                metric!(counter("refresh.lease.anomaly") += 1);
                false
            }
        }
    }

    fn reclaim_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut reclaimed = vec![];
        self.lock().retain(|key, lease| {
            let live = lease.is_live(now);
            if !live {
                reclaimed.push(key.clone());
            }
            live
        });

        for key in &reclaimed {
            tracing::warn!(key, "reclaimed expired refresh lease");
            metric!(counter("refresh.lease.reclaimed") += 1);
        }
        reclaimed
    }

    fn holder(&self, key: &str) -> Option<HolderId> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.holder)
    }
}

/// A granted lease that is released when the guard completes or is dropped.
pub struct LeaseGuard {
    key: String,
    holder: HolderId,
    leases: Arc<dyn LeaseManager>,
    released: bool,
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("released", &self.released)
            .finish()
    }
}

impl LeaseGuard {
    /// Tries to acquire the lease for `key` under a fresh holder id.
    pub fn acquire(leases: Arc<dyn LeaseManager>, key: &str) -> Option<Self> {
        let holder = HolderId::new();
        leases.try_acquire(key, holder).then(|| Self {
            key: key.to_owned(),
            holder,
            leases,
            released: false,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> HolderId {
        self.holder
    }

    /// Releases the lease now.
    ///
    /// Returns `false` if the lease had already been taken away, e.g. reclaimed after expiring.
    pub fn release(mut self) -> bool {
        self.release_inner()
    }

    fn release_inner(&mut self) -> bool {
        if std::mem::replace(&mut self.released, true) {
            return false;
        }
        self.leases.release(&self.key, self.holder)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!(key = self.key, "releasing refresh lease on drop");
            self.release_inner();
        }
    }
}
