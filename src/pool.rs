//! Connection handler pool
//!
//! The pool is the keyed registry of active logical connections for one
//! tunnel session. It guarantees that concurrent first-touch of the same
//! [`ConnId`] serializes to a single handler construction, hands every
//! handler a [`Release`] bound to its id for unregistration, and reclaims
//! idle handlers through a periodic reaper.
//!
//! Exactly one pool exists per tunnel session; state is never shared across
//! sessions.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connid::ConnId;
use crate::error::{Result, TunnelError};
use crate::handler::Handler;

/// Time source for idle reaping; injectable so tests can drive it
pub trait Clock: Send + Sync {
    /// The current instant
    fn now(&self) -> Instant;
}

/// Wall clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct PoolInner {
    entries: DashMap<ConnId, Arc<OnceCell<Handler>>>,
    clock: Arc<dyn Clock>,
}

// Outcome of one init attempt on a cell. Stale means the map entry the
// caller raced on is gone and the lookup must start over.
enum InitError {
    Stale,
    Failed(TunnelError),
}

/// Unregistration callback bound to one pool entry
///
/// Handlers invoke this when they close; removing an absent entry is a
/// no-op, so calling it more than once is harmless.
#[derive(Clone)]
pub struct Release {
    pool: Weak<PoolInner>,
    id: ConnId,
}

impl Release {
    /// Remove the bound entry from the pool
    pub fn release(&self) {
        if let Some(pool) = self.pool.upgrade() {
            if pool.entries.remove(&self.id).is_some() {
                trace!(id = %self.id, "released from pool");
            }
        }
    }
}

/// Keyed registry of connection handlers with exactly-once construction
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    /// Create an empty pool using the wall clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty pool with an injected clock
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                entries: DashMap::new(),
                clock,
            }),
        }
    }

    /// Get the handler for `id`, constructing it via `factory` on first
    /// touch
    ///
    /// Concurrent callers racing on the same id serialize through one cell,
    /// so at most one factory runs at a time and every caller of a
    /// successful attempt receives the installed handler. The factory runs
    /// outside the pool's map locks, so a slow construction (a dial, say)
    /// never stalls unrelated lookups. A freshly installed handler is
    /// started before any caller sees it.
    ///
    /// # Errors
    ///
    /// A factory failure propagates to its own caller and removes the entry
    /// before any other attempt may run, so callers that were waiting on
    /// the failed attempt retry on a fresh entry and a later call sees a
    /// clean slate.
    pub async fn get<F, Fut>(&self, id: ConnId, factory: F) -> Result<Handler>
    where
        F: FnOnce(Release) -> Fut,
        Fut: Future<Output = Result<Handler>> + Send,
    {
        let release = Release {
            pool: Arc::downgrade(&self.inner),
            id,
        };
        let mut factory = Some(factory);
        loop {
            let cell = self
                .inner
                .entries
                .entry(id)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            // Init attempts on one cell are serialized by the OnceCell, so
            // a failed attempt's removal below is visible to the next
            // attempt before its factory runs.
            let attempt = cell
                .get_or_try_init(|| async {
                    let live = self
                        .inner
                        .entries
                        .get(&id)
                        .is_some_and(|entry| Arc::ptr_eq(entry.value(), &cell));
                    if !live {
                        return Err(InitError::Stale);
                    }
                    let Some(factory) = factory.take() else {
                        return Err(InitError::Stale);
                    };
                    debug!(%id, "creating handler");
                    match factory(release.clone()).await {
                        Ok(handler) => {
                            handler.start().await;
                            Ok(handler)
                        }
                        Err(err) => {
                            self.inner
                                .entries
                                .remove_if(&id, |_, c| Arc::ptr_eq(c, &cell));
                            Err(InitError::Failed(err))
                        }
                    }
                })
                .await
                .cloned();

            match attempt {
                Ok(handler) => return Ok(handler),
                Err(InitError::Failed(err)) => return Err(err),
                // The entry this caller raced on was removed by a failed
                // attempt; start over on a fresh one.
                Err(InitError::Stale) => {}
            }
        }
    }

    /// Look up an existing handler without creating one
    #[must_use]
    pub fn lookup(&self, id: &ConnId) -> Option<Handler> {
        self.inner
            .entries
            .get(id)
            .and_then(|entry| entry.value().get().cloned())
    }

    /// Number of registered entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Check if the pool has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Concurrently signal every current handler to close and wait for the
    /// close calls to finish
    ///
    /// Callers bound the wait with a timeout; this is only used during full
    /// shutdown of the owning router or stream.
    pub async fn close_all(&self) {
        let handlers: Vec<Handler> = self
            .inner
            .entries
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();
        debug!(count = handlers.len(), "closing all handlers");
        let mut joins = Vec::with_capacity(handlers.len());
        for handler in handlers {
            joins.push(tokio::spawn(async move { handler.close().await }));
        }
        for join in joins {
            let _ = join.await;
        }
    }

    /// Spawn the idle reaper for this pool
    ///
    /// Every `interval` the reaper closes handlers whose last activity is
    /// at least `ttl` in the past. Closing goes through the handler's own
    /// close path, so the release bookkeeping is identical to a peer-
    /// initiated close. Idle reclamation is not an error and is not
    /// reported upward.
    pub fn spawn_reaper(
        &self,
        ttl: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
                let now = inner.clock.now();
                let idle: Vec<Handler> = inner
                    .entries
                    .iter()
                    .filter_map(|entry| entry.value().get().cloned())
                    .filter(|handler| {
                        now.saturating_duration_since(handler.last_activity()) >= ttl
                    })
                    .collect();
                for handler in idle {
                    debug!(id = %handler.id(), "reaping idle handler");
                    handler.close().await;
                }
            }
        })
    }
}
