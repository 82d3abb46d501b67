//! Batching resolver.
//!
//! Coalesces concurrent per-key lookups into bounded aggregate queries.
//!
//! ```text
//!  submit(u1) ─┐
//!  submit(u2) ─┼─▶ open window {u1: [tx, tx], u2: [tx]} ──seal──▶ fetch({u1, u2})
//!  submit(u1) ─┘        ▲                                            │
//!                       └── first submitter: yield (or sleep `window`)  ▼
//!                                                            fan out per key
//! ```
//!
//! The submission that opens an empty window owns its collector. That
//! submitter's own future yields once (or sleeps for the configured window)
//! before sealing, so the window cannot close until the task that opened it
//! has been suspended: every submission made by the same task, or by tasks
//! already runnable, joins. A window that reaches `max_batch_size` distinct
//! keys is sealed on the spot and the next submission opens a fresh one.
//!
//! Dispatch runs in its own task, so a caller dropping its future never
//! aborts a query other callers are waiting on. If the first submitter is
//! dropped before closing its window, the collector hands the window to a
//! spawned task that closes it on the same schedule.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::BatchConfig;
use crate::error::{LookupError, panic_message};

/// The backing store behind a [`BatchingResolver`].
pub trait Store: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    type Entity: Clone + Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// The key an entity answers for. Results are matched to callers by
    /// this key alone; the order `fetch` returns them in is irrelevant.
    fn key_of(&self, entity: &Self::Entity) -> Self::Key;

    /// Loads every entity among `keys` that exists. Missing keys are simply
    /// left out of the result.
    fn fetch(
        &self,
        keys: HashSet<Self::Key>,
    ) -> impl Future<Output = Result<Vec<Self::Entity>, Self::Error>> + Send;
}

/// Per-key outcome of a lookup.
pub type Lookup<S> = Result<<S as Store>::Entity, LookupError<<S as Store>::Key, <S as Store>::Error>>;

type Waiters<S> = HashMap<<S as Store>::Key, Vec<oneshot::Sender<Lookup<S>>>>;

struct Window<S: Store> {
    /// Bumped every time the window is sealed, so a collector can tell
    /// whether the window it was spawned for is still the open one.
    generation: u64,
    waiters: Waiters<S>,
}

impl<S: Store> Window<S> {
    fn seal(&mut self) -> Waiters<S> {
        self.generation += 1;
        mem::take(&mut self.waiters)
    }
}

struct Inner<S: Store> {
    store: S,
    max_batch_size: usize,
    window: Duration,
    open: Mutex<Window<S>>,
}

/// Resolves keys against a [`Store`] in batches.
///
/// Cheap to clone; clones share the store and the open window.
pub struct BatchingResolver<S: Store> {
    inner: Arc<Inner<S>>,
}

impl<S: Store> Clone for BatchingResolver<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: Store> BatchingResolver<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, &BatchConfig::default())
    }

    pub fn with_config(store: S, config: &BatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                max_batch_size: config.effective_max(),
                window: config.window,
                open: Mutex::new(Window { generation: 0, waiters: HashMap::new() }),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Resolves one key. Joins the open batch on first poll.
    ///
    /// Dropping the returned future gives up on the answer but leaves the
    /// batch, and every other caller in it, untouched.
    pub async fn submit(&self, key: S::Key) -> Lookup<S> {
        let (reply, opened) = self.enqueue(key);
        if let Some(collector) = opened {
            collector.close().await;
        }
        reply
            .await
            .unwrap_or_else(|_| Err(LookupError::Defect("batch dropped before completing".into())))
    }

    fn enqueue(&self, key: S::Key) -> (oneshot::Receiver<Lookup<S>>, Option<Collector<S>>) {
        let (tx, rx) = oneshot::channel();
        let mut open = self.inner.open.lock();
        let opened = open.waiters.is_empty();
        trace!(?key, "enqueued");
        open.waiters.entry(key).or_default().push(tx);

        if open.waiters.len() >= self.inner.max_batch_size {
            let batch = open.seal();
            drop(open);
            self.spawn_dispatch(batch);
            return (rx, None);
        }
        let collector = opened.then(|| Collector {
            resolver: self.clone(),
            generation: open.generation,
            deadline: Instant::now() + self.inner.window,
            closed: false,
        });
        (rx, collector)
    }

    /// Seals the open window if it is still the one opened at `generation`.
    fn take(&self, generation: u64) -> Option<Waiters<S>> {
        let mut open = self.inner.open.lock();
        // sealed early by reaching max_batch_size
        (open.generation == generation).then(|| open.seal())
    }

    async fn pause_until(&self, deadline: Instant) {
        if self.inner.window.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep_until(deadline).await;
        }
    }

    fn spawn_dispatch(&self, batch: Waiters<S>) {
        let resolver = self.clone();
        tokio::spawn(async move { resolver.dispatch(batch).await });
    }

    async fn dispatch(&self, batch: Waiters<S>) {
        let keys: HashSet<S::Key> = batch.keys().cloned().collect();
        let size = keys.len();
        debug!(size, keys = ?keys, "dispatching batch");

        let fetched = AssertUnwindSafe(self.inner.store.fetch(keys)).catch_unwind().await;
        match fetched {
            Ok(Ok(entities)) => {
                let mut found: HashMap<S::Key, S::Entity> = HashMap::with_capacity(entities.len());
                for entity in entities {
                    found.entry(self.inner.store.key_of(&entity)).or_insert(entity);
                }
                debug!(size, found = found.len(), "batch resolved");
                for (key, waiters) in batch {
                    let reply = match found.get(&key) {
                        Some(entity) => Ok(entity.clone()),
                        None => Err(LookupError::NotFound(key)),
                    };
                    fan_out(waiters, reply);
                }
            }
            Ok(Err(source)) => {
                warn!(size, error = %source, "batch fetch failed");
                let source = Arc::new(source);
                for waiters in batch.into_values() {
                    fan_out(waiters, Err(LookupError::BackingStore(Arc::clone(&source))));
                }
            }
            Err(payload) => {
                let message = panic_message(&*payload);
                error!(size, %message, "batch fetch panicked");
                for waiters in batch.into_values() {
                    fan_out(waiters, Err(LookupError::Defect(message.clone())));
                }
            }
        }
    }
}

/// Every caller of one key gets a clone of the same outcome. Callers that
/// have gone away are skipped.
fn fan_out<T: Clone>(waiters: Vec<oneshot::Sender<T>>, reply: T) {
    for tx in waiters {
        let _ = tx.send(reply.clone());
    }
}

/// Closes the window opened by one submission.
///
/// Owned by the future of the submitter that opened the window. If that
/// future is dropped before closing, the window is handed to a spawned task
/// so the waiters already in it are still answered.
struct Collector<S: Store> {
    resolver: BatchingResolver<S>,
    generation: u64,
    deadline: Instant,
    closed: bool,
}

impl<S: Store> Collector<S> {
    async fn close(mut self) {
        self.resolver.pause_until(self.deadline).await;
        self.closed = true;
        if let Some(batch) = self.resolver.take(self.generation) {
            self.resolver.spawn_dispatch(batch);
        }
    }
}

impl<S: Store> Drop for Collector<S> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let resolver = self.resolver.clone();
        let (generation, deadline) = (self.generation, self.deadline);
        match Handle::try_current() {
            Ok(handle) => {
                trace!(generation, "window handed off");
                handle.spawn(async move {
                    resolver.pause_until(deadline).await;
                    if let Some(batch) = resolver.take(generation) {
                        resolver.dispatch(batch).await;
                    }
                });
            }
            // No runtime left to dispatch on: dropping the senders answers
            // every waiter with a defect.
            Err(_) => drop(resolver.take(generation)),
        }
    }
}

impl<S: Store> fmt::Debug for BatchingResolver<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchingResolver")
            .field("max_batch_size", &self.inner.max_batch_size)
            .field("window", &self.inner.window)
            .finish_non_exhaustive()
    }
}
