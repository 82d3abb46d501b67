//! Request cache.
//!
//! Memoizes resolved values by [`Fingerprint`]: the request type plus its
//! parameters. Entries expire after a fixed time-to-live and the cache
//! holds at most `capacity` of them, evicting the oldest-inserted first.
//!
//! At most one computation per fingerprint is ever in flight. The first
//! caller to miss claims the fingerprint and spawns the computation; every
//! caller arriving before it completes joins the same shared future. The
//! claim is a per-fingerprint map entry, so unrelated fingerprints never
//! wait on each other.
//!
//! Only successes are stored. A failed computation is handed to everyone
//! who joined it, and the next caller computes again.
//!
//! Capacity is enforced without serializing inserts. An insert first
//! reserves room in an atomic size counter, evicting from the head of an
//! insertion-order log until a reservation fits. The log is only locked to
//! push or pop one record; records whose entry has since been replaced or
//! removed are skipped when they reach the head.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::config::CacheConfig;
use crate::error::{CacheError, panic_message};

/// Cache key: which request, with which parameters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint<K> {
    pub request: &'static str,
    pub key: K,
}

impl<K> Fingerprint<K> {
    pub fn new(request: &'static str, key: K) -> Self {
        Self { request, key }
    }
}

type Computation<V, E> = Shared<BoxFuture<'static, Result<V, CacheError<E>>>>;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    /// Insertion order; the smallest is evicted first.
    sequence: u64,
}

struct Inner<F, V, E> {
    entries: DashMap<F, CacheEntry<V>>,
    in_flight: DashMap<F, Computation<V, E>>,
    sequence: AtomicU64,
    /// Stored entries plus reservations about to become entries. Never
    /// exceeds `capacity`.
    size: AtomicUsize,
    /// `(sequence, fingerprint)` in insertion order, oldest first. May hold
    /// stale records; an entry is only evicted through the record whose
    /// sequence it still carries.
    order: Mutex<VecDeque<(u64, F)>>,
    capacity: usize,
    time_to_live: Duration,
}

impl<F, V, E> Inner<F, V, E>
where
    F: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        entry.inserted_at.elapsed() >= self.time_to_live
    }

    fn live(&self, fingerprint: &F) -> Option<V> {
        match self.entries.get(fingerprint) {
            None => return None,
            Some(entry) if !self.is_expired(&entry) => return Some(entry.value.clone()),
            Some(_) => {}
        }
        if self.remove_if(fingerprint, |entry| self.is_expired(entry)) {
            trace!(?fingerprint, "expired");
        }
        None
    }

    fn remove_if(&self, fingerprint: &F, predicate: impl FnOnce(&CacheEntry<V>) -> bool) -> bool {
        let removed = self.entries.remove_if(fingerprint, |_, entry| predicate(entry)).is_some();
        if removed {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    fn insert(&self, fingerprint: F, value: V) {
        self.reserve();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .entries
            .insert(fingerprint.clone(), CacheEntry { value, inserted_at: Instant::now(), sequence });
        if previous.is_some() {
            // replaced in place: the old entry already held a slot
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        let mut order = self.order.lock();
        order.push_back((sequence, fingerprint));
        if order.len() > 2 * self.capacity {
            order.retain(|(sequence, fingerprint)| {
                self.entries.get(fingerprint).is_some_and(|entry| entry.sequence == *sequence)
            });
        }
    }

    /// Takes one unit of `size`, evicting the oldest entries until it fits.
    fn reserve(&self) {
        let mut size = self.size.load(Ordering::Acquire);
        loop {
            if size < self.capacity {
                match self.size.compare_exchange_weak(size, size + 1, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => return,
                    Err(current) => size = current,
                }
            } else {
                if !self.evict_oldest() {
                    // Every slot is reserved by an insert that has not
                    // logged its record yet.
                    std::thread::yield_now();
                }
                size = self.size.load(Ordering::Acquire);
            }
        }
    }

    /// Pops records until one evicts a live entry. False when the log ran dry.
    fn evict_oldest(&self) -> bool {
        loop {
            let Some((sequence, fingerprint)) = self.order.lock().pop_front() else {
                return false;
            };
            if self.remove_if(&fingerprint, |entry| entry.sequence == sequence) {
                trace!(?fingerprint, "evicted");
                return true;
            }
        }
    }
}

enum Claim<V, E> {
    Hit(V),
    Wait(Computation<V, E>),
}

/// A TTL and capacity bounded memo table with single-flight computation.
///
/// Cheap to clone; clones share the same entries.
pub struct RequestCache<F, V, E> {
    inner: Arc<Inner<F, V, E>>,
}

impl<F, V, E> Clone for RequestCache<F, V, E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<F, V, E> RequestCache<F, V, E>
where
    F: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, time_to_live: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                sequence: AtomicU64::new(0),
                size: AtomicUsize::new(0),
                order: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                time_to_live,
            }),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.effective_capacity(), config.time_to_live)
    }

    /// Returns the live value for `fingerprint`, or runs `compute` to
    /// produce it.
    ///
    /// `compute` is only called by the caller that claims the fingerprint.
    /// The future it returns runs in its own task, so it completes (and
    /// satisfies everyone who joined) even if that caller goes away.
    /// `compute` itself runs while the claim is held and must not call
    /// back into this cache.
    pub async fn get_or_compute<C, Fut>(&self, fingerprint: F, compute: C) -> Result<V, CacheError<E>>
    where
        C: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        match self.claim(fingerprint, compute) {
            Claim::Hit(value) => Ok(value),
            Claim::Wait(computation) => computation.await,
        }
    }

    fn claim<C, Fut>(&self, fingerprint: F, compute: C) -> Claim<V, E>
    where
        C: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if let Some(value) = self.inner.live(&fingerprint) {
            trace!(?fingerprint, "hit");
            return Claim::Hit(value);
        }
        match self.inner.in_flight.entry(fingerprint.clone()) {
            Entry::Occupied(running) => {
                trace!(?fingerprint, "joined");
                Claim::Wait(running.get().clone())
            }
            Entry::Vacant(slot) => {
                // A computation may have finished between the lookup above
                // and taking the claim: results land in `entries` before
                // the claim is released.
                if let Some(value) = self.inner.live(&fingerprint) {
                    trace!(?fingerprint, "hit");
                    return Claim::Hit(value);
                }
                trace!(?fingerprint, "miss");
                let computation = self.spawn_computation(fingerprint, compute());
                slot.insert(computation.clone());
                Claim::Wait(computation)
            }
        }
    }

    fn spawn_computation<Fut>(&self, fingerprint: F, fut: Fut) -> Computation<V, E>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(value)) => {
                    inner.insert(fingerprint.clone(), value.clone());
                    Ok(value)
                }
                Ok(Err(e)) => Err(CacheError::Compute(e)),
                Err(payload) => {
                    let message = panic_message(&*payload);
                    error!(?fingerprint, %message, "cache computation panicked");
                    Err(CacheError::Defect(message))
                }
            };
            inner.in_flight.remove(&fingerprint);
            outcome
        });
        async move {
            task.await
                .unwrap_or_else(|e| Err(CacheError::Defect(format!("computation task failed: {e}"))))
        }
        .boxed()
        .shared()
    }

    /// Live value for `fingerprint`, without computing anything.
    pub fn get(&self, fingerprint: &F) -> Option<V> {
        self.inner.live(fingerprint)
    }

    /// Drops the entry for `fingerprint`. A computation already in flight
    /// for it still completes and stores its result.
    pub fn invalidate(&self, fingerprint: &F) -> bool {
        self.inner.remove_if(fingerprint, |_| true)
    }

    pub fn clear(&self) {
        self.inner.entries.retain(|_, _| {
            self.inner.size.fetch_sub(1, Ordering::AcqRel);
            false
        });
    }

    /// Stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Removes every expired entry and returns how many went.
    pub fn purge_expired(&self) -> usize {
        let mut purged = 0;
        self.inner.entries.retain(|_, entry| {
            let expired = self.inner.is_expired(entry);
            if expired {
                self.inner.size.fetch_sub(1, Ordering::AcqRel);
                purged += 1;
            }
            !expired
        });
        if purged > 0 {
            debug!(purged, "purged expired cache entries");
        }
        purged
    }

    /// Purges expired entries every `every` until `token` is cancelled.
    pub fn spawn_sweeper(&self, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + every, every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticks.tick() => {
                        cache.purge_expired();
                    }
                }
            }
            debug!("cache sweeper stopped");
        })
    }
}

impl<F, V, E> fmt::Debug for RequestCache<F, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCache")
            .field("capacity", &self.inner.capacity)
            .field("time_to_live", &self.inner.time_to_live)
            .finish_non_exhaustive()
    }
}
