//! Request collapsing for concurrent identical fetches.
//!
//! The first caller for a key becomes the leader: its work is spawned onto the runtime and
//! registered in the in-flight map. Callers arriving while it runs join it and receive a clone
//! of the same outcome through a `watch` channel.
//!
//! ```text
//! caller A ──► join_or_start(k) ── Vacant ──► spawn(work) ──► Leader(handle)
//! caller B ──► join_or_start(k) ── Occupied (age < max_age) ──► Joined(handle)
//!                                              │
//!                         work completes ──► tx.send(Some(outcome)) ──► A, B wake
//!                                              │
//!                                    InflightGuard::drop removes k (if still ours)
//! ```
//!
//! The work is detached from its callers: if every caller gives up, the fetch still runs to
//! completion and fills the cache.
//!
//! The `DashMap` entry is never held across an await point; only the `watch::Receiver` is
//! cloned out of it.

use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::watch, time::Instant};

use crate::types::CacheKey;

struct InflightFetch<O> {
    id: u64,
    started_at: Instant,
    rx: watch::Receiver<Option<O>>,
}

/// Waits for the outcome of an in-flight fetch.
pub struct InflightHandle<O> {
    rx: watch::Receiver<Option<O>>,
}

impl<O: Clone> InflightHandle<O> {
    /// Resolves to the shared outcome, or `None` if the work was aborted before producing one.
    pub async fn wait(mut self) -> Option<O> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        }
    }
}

/// How a caller was attached to the fetch for its key.
pub enum Slot<O> {
    /// Started the fetch.
    Leader(InflightHandle<O>),
    /// Joined a fetch already in flight.
    Joined(InflightHandle<O>),
}

/// Removes the in-flight entry when the spawned work finishes or unwinds.
struct InflightGuard<O> {
    inflight: Arc<DashMap<CacheKey, InflightFetch<O>>>,
    key: CacheKey,
    id: u64,
}

impl<O> Drop for InflightGuard<O> {
    fn drop(&mut self) {
        // A newer leader may have replaced an entry that aged out; leave it alone
        self.inflight.remove_if(&self.key, |_, fetch| fetch.id == self.id);
    }
}

/// Tracks `key -> in-flight fetch` so concurrent callers share one outbound call.
pub struct RequestCollapser<O> {
    inflight: Arc<DashMap<CacheKey, InflightFetch<O>>>,
    next_id: AtomicU64,
}

impl<O> Default for RequestCollapser<O> {
    fn default() -> Self {
        Self { inflight: Arc::new(DashMap::new()), next_id: AtomicU64::new(0) }
    }
}

impl<O: Clone + Send + Sync + 'static> RequestCollapser<O> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the in-flight fetch for `key` if one started less than `max_age` ago, otherwise
    /// spawns `start()` as the new leader.
    ///
    /// `start` is only invoked for the leader.
    pub fn join_or_start<F, Fut>(&self, key: &CacheKey, max_age: Duration, start: F) -> Slot<O>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = O> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);

        match self.inflight.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().started_at.elapsed() < max_age {
                    tracing::debug!(key = %key, "joining in-flight fetch");
                    return Slot::Joined(InflightHandle { rx: occupied.get().rx.clone() });
                }
                tracing::debug!(key = %key, "in-flight fetch too old to join, starting a new one");
                occupied.insert(InflightFetch { id, started_at: Instant::now(), rx: rx.clone() });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(InflightFetch { id, started_at: Instant::now(), rx: rx.clone() });
            }
        }

        let guard = InflightGuard { inflight: Arc::clone(&self.inflight), key: key.clone(), id };
        let work = start();
        tokio::spawn(async move {
            let _guard = guard;
            let outcome = work.await;
            let _ = tx.send(Some(outcome));
        });

        Slot::Leader(InflightHandle { rx })
    }

    /// Number of fetches currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inflight.contains_key(key)
    }
}
