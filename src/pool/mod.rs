//! Connection pool
//!
//! A bounded set of reusable physical connections for one routing target.
//!
//! - A semaphore with `max_size` permits bounds concurrent checkouts; a
//!   caller that gives up (timeout or cancellation) drops its permit.
//! - `size` counts every live connection (idle, checked out, or being
//!   opened) and never exceeds `max_size`. Slots are reserved before a
//!   connection is opened and handed back by a guard if the open fails or
//!   the caller goes away.
//! - Idle connections sit in a LIFO queue behind a `parking_lot` mutex that
//!   is never held across an `.await`.
//! - Expired idle connections are evicted lazily on acquire and by a
//!   background sweep, which then tops the pool back up to `initial_size`.

mod connector;
mod settings;
mod stats;


pub use connector::{AccessMode, Connector, Session};
pub use settings::{PoolSettings, ValidationDepth};
pub use stats::PoolStats;

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use stats::Counters;

/// Connection pool for a single database target
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

struct PoolInner<C: Connector> {
    settings: PoolSettings,
    connector: C,

    /// One permit per concurrent checkout
    semaphore: Arc<Semaphore>,

    idle: Mutex<VecDeque<IdleConnection<C::Connection>>>,

    /// Live connections, including ones being opened
    size: AtomicUsize,

    /// Signalled when a slot is freed or a connection lands in the idle queue
    slot_freed: Notify,

    /// Signalled to every waiter when `size` drops to zero
    drained: Notify,

    /// Connections currently handed out to callers
    checked_out: AtomicUsize,

    shutdown: CancellationToken,
    counters: Counters,
    next_id: AtomicU64,
}

struct Live<T> {
    conn: T,
    id: u64,
    created_at: Instant,
}

struct IdleConnection<T> {
    live: Live<T>,
    idle_since: Instant,
}

/// Reservation of one unit of `size`; released on drop unless kept
struct Slot<'a, C: Connector> {
    pool: &'a PoolInner<C>,
    armed: bool,
}

impl<C: Connector> Slot<'_, C> {
    fn keep(mut self) {
        self.armed = false;
    }
}

impl<C: Connector> Drop for Slot<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot();
        }
    }
}

impl<C: Connector> Pool<C> {
    /// Build a pool from validated settings.
    ///
    /// No connections are opened here; call [`Pool::warm_up`] to fill the
    /// pool eagerly. When called inside a Tokio runtime, a background task
    /// evicts expired idle connections every
    /// [`PoolSettings::effective_eviction_interval`].
    pub fn new(settings: PoolSettings, connector: C) -> Result<Self> {
        settings.validate()?;

        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(settings.max_size as usize)),
            idle: Mutex::new(VecDeque::with_capacity(settings.max_size as usize)),
            size: AtomicUsize::new(0),
            slot_freed: Notify::new(),
            drained: Notify::new(),
            checked_out: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            counters: Counters::default(),
            next_id: AtomicU64::new(1),
            connector,
            settings,
        });

        debug!(
            pool = %inner.settings.pool_name,
            url = %inner.settings.redacted_url(),
            initial_size = inner.settings.initial_size,
            max_size = inner.settings.max_size,
            "connection pool created"
        );

        PoolInner::spawn_maintenance(&inner);

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.pool_name
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Check out a connection.
    ///
    /// Reuses a validated idle connection when one exists, otherwise opens a
    /// new one if the pool has room, otherwise waits for a release. The whole
    /// wait is bounded by `max_acquire_time`.
    pub async fn acquire(&self) -> Result<PooledConnection<C>> {
        let waited = self.inner.settings.max_acquire_time;

        match tokio::time::timeout(waited, self.inner.acquire_inner()).await {
            Ok(result) => result,
            Err(_) => {
                Counters::bump(&self.inner.counters.acquire_timeouts);
                warn!(pool = %self.name(), ?waited, "timed out waiting for a connection");
                Err(Error::AcquireTimeout {
                    pool: self.name().to_string(),
                    waited,
                })
            }
        }
    }

    /// Return a connection to the pool it was checked out from
    pub async fn release(&self, conn: PooledConnection<C>) {
        conn.release().await;
    }

    /// Open connections until the pool holds `initial_size` of them.
    ///
    /// Returns the number of connections opened.
    pub async fn warm_up(&self) -> Result<usize> {
        self.inner.replenish().await
    }

    /// Close idle connections past `max_idle_time` or `max_life_time`.
    ///
    /// Returns the number of connections evicted.
    pub async fn evict_expired(&self) -> usize {
        self.inner.evict_expired().await
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let max_size = inner.settings.max_size;
        let idle = inner.idle.lock().len() as u32;
        let in_use = inner.checked_out.load(Ordering::SeqCst) as u32;

        let mut stats = PoolStats {
            name: inner.settings.pool_name.clone(),
            max_size,
            size: inner.size.load(Ordering::SeqCst) as u32,
            idle,
            in_use,
            ..Default::default()
        };
        inner.counters.fill(&mut stats);
        stats
    }

    /// Shut the pool down.
    ///
    /// Pending and future acquires fail with [`Error::PoolClosed`], idle
    /// connections are closed, and connections still checked out are closed
    /// as they come back. Waits up to `close_timeout` for them.
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.semaphore.close();
        // acquirers parked waiting for a slot re-check and fail
        inner.slot_freed.notify_waiters();

        let drained: Vec<_> = inner.idle.lock().drain(..).collect();
        for _ in &drained {
            inner.release_slot();
        }
        for idle in drained {
            inner.close_connection(idle.live).await;
        }

        let grace = inner.settings.close_timeout;
        let drained_in_time = tokio::time::timeout(grace, async {
            loop {
                let notified = inner.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if inner.size.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if drained_in_time {
            debug!(pool = %self.name(), "connection pool closed");
        } else {
            warn!(
                pool = %self.name(),
                outstanding = inner.size.load(Ordering::SeqCst),
                ?grace,
                "closing pool with connections still checked out"
            );
        }
    }
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.settings.pool_name)
            .field("size", &self.inner.size.load(Ordering::Relaxed))
            .field("max_size", &self.inner.settings.max_size)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl<C: Connector> PoolInner<C> {
    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn closed_error(&self) -> Error {
        Error::PoolClosed {
            pool: self.settings.pool_name.clone(),
        }
    }

    async fn acquire_inner(self: &Arc<Self>) -> Result<PooledConnection<C>> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| self.closed_error())?;

        loop {
            if self.is_closed() {
                return Err(self.closed_error());
            }

            if let Some(live) = self.take_idle().await {
                return Ok(self.check_out(live, permit));
            }

            if let Some(slot) = self.reserve_slot(self.settings.max_size as usize) {
                let live = self.create_connection().await?;
                slot.keep();
                return Ok(self.check_out(live, permit));
            }

            // Every slot is idle or being opened by the warm-up sweep
            self.slot_freed.notified().await;
        }
    }

    fn check_out(
        self: &Arc<Self>,
        live: Live<C::Connection>,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection<C> {
        Counters::bump(&self.counters.acquired);
        self.checked_out.fetch_add(1, Ordering::SeqCst);
        trace!(pool = %self.settings.pool_name, connection = live.id, "connection checked out");

        PooledConnection {
            live: Some(live),
            pool: Arc::clone(self),
            reusable: true,
            _permit: permit,
        }
    }

    fn reserve_slot(&self, limit: usize) -> Option<Slot<'_, C>> {
        self.size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                (size < limit).then_some(size + 1)
            })
            .ok()
            .map(|_| Slot {
                pool: self,
                armed: true,
            })
    }

    fn release_slot(&self) {
        if self.size.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
        self.slot_freed.notify_one();
    }

    fn is_expired(&self, live: &Live<C::Connection>, idle_since: Instant, now: Instant) -> bool {
        now.duration_since(idle_since) > self.settings.max_idle_time
            || self.lifetime_exceeded(live, now)
    }

    fn lifetime_exceeded(&self, live: &Live<C::Connection>, now: Instant) -> bool {
        now.duration_since(live.created_at) > self.settings.max_life_time
    }

    /// Pop the most recently used idle connection that is still usable.
    ///
    /// Expired or invalid candidates are closed along the way.
    async fn take_idle(&self) -> Option<Live<C::Connection>> {
        loop {
            let candidate = self.idle.lock().pop_back()?;
            let slot = Slot {
                pool: self,
                armed: true,
            };

            if self.is_expired(&candidate.live, candidate.idle_since, Instant::now()) {
                Counters::bump(&self.counters.evicted);
                trace!(
                    pool = %self.settings.pool_name,
                    connection = candidate.live.id,
                    "discarding expired idle connection"
                );
                self.close_connection(candidate.live).await;
                continue;
            }

            let mut live = candidate.live;
            if !self.validate(&mut live.conn).await {
                Counters::bump(&self.counters.validation_failures);
                debug!(
                    pool = %self.settings.pool_name,
                    connection = live.id,
                    "discarding connection that failed validation"
                );
                self.close_connection(live).await;
                continue;
            }

            slot.keep();
            return Some(live);
        }
    }

    async fn validate(&self, conn: &mut C::Connection) -> bool {
        if !conn.is_healthy() {
            return false;
        }

        match self.settings.validation_depth {
            ValidationDepth::Local => true,
            ValidationDepth::Remote => matches!(
                tokio::time::timeout(self.settings.max_create_connection_time, conn.ping()).await,
                Ok(Ok(()))
            ),
        }
    }

    /// Open a connection, retrying transient failures `acquire_retry` times
    async fn create_connection(&self) -> Result<Live<C::Connection>> {
        let name = &self.settings.pool_name;
        let attempts = self.settings.acquire_retry.saturating_add(1);
        let timeout = self.settings.max_create_connection_time;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match tokio::time::timeout(timeout, self.connector.connect()).await {
                Ok(Ok(conn)) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    Counters::bump(&self.counters.created);
                    debug!(pool = %name, connection = id, attempt, "opened connection");
                    return Ok(Live {
                        conn,
                        id,
                        created_at: Instant::now(),
                    });
                }
                Ok(Err(err)) => err,
                Err(_) => Error::ConnectTimeout { timeout },
            };

            Counters::bump(&self.counters.creation_failures);

            if attempt >= attempts || !err.is_transient() {
                warn!(pool = %name, attempts = attempt, error = %err, "giving up on opening a connection");
                return Err(Error::PoolExhausted {
                    pool: name.clone(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            debug!(pool = %name, attempt, error = %err, "connection attempt failed, retrying");
        }
    }

    /// Put a connection back in the idle queue if it may be reused.
    ///
    /// Hands the connection back when it has to be closed instead.
    fn try_recycle(&self, live: Live<C::Connection>, reusable: bool) -> Option<Live<C::Connection>> {
        if !reusable || self.lifetime_exceeded(&live, Instant::now()) || !live.conn.is_healthy() {
            return Some(live);
        }

        {
            let mut idle = self.idle.lock();
            // checked under the lock so `close` cannot miss this connection
            if self.is_closed() {
                return Some(live);
            }
            trace!(pool = %self.settings.pool_name, connection = live.id, "connection returned to pool");
            idle.push_back(IdleConnection {
                live,
                idle_since: Instant::now(),
            });
        }

        self.slot_freed.notify_one();
        None
    }

    async fn close_connection(&self, live: Live<C::Connection>) {
        Counters::bump(&self.counters.closed);
        let id = live.id;
        if let Err(err) = live.conn.close().await {
            debug!(pool = %self.settings.pool_name, connection = id, error = %err, "error while closing connection");
        }
    }

    async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let expired: VecDeque<_> = {
            let mut idle = self.idle.lock();
            let (keep, expired): (VecDeque<_>, VecDeque<_>) = idle
                .drain(..)
                .partition(|conn| !self.is_expired(&conn.live, conn.idle_since, now));
            *idle = keep;
            expired
        };

        let count = expired.len();
        if count == 0 {
            return 0;
        }

        Counters::add(&self.counters.evicted, count as u64);
        debug!(pool = %self.settings.pool_name, evicted = count, "evicted expired idle connections");

        for _ in 0..count {
            self.release_slot();
        }
        for conn in expired {
            self.close_connection(conn.live).await;
        }
        count
    }

    async fn replenish(&self) -> Result<usize> {
        let target = self.settings.initial_size.min(self.settings.max_size) as usize;
        let mut created = 0;

        while !self.is_closed() {
            let Some(slot) = self.reserve_slot(target) else {
                break;
            };
            let live = self.create_connection().await?;
            slot.keep();
            if let Some(live) = self.try_recycle(live, true) {
                self.release_slot();
                self.close_connection(live).await;
                break;
            }
            created += 1;
        }

        if created > 0 {
            debug!(pool = %self.settings.pool_name, created, "replenished idle connections");
        }
        Ok(created)
    }

    fn spawn_maintenance(inner: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(pool = %inner.settings.pool_name, "no tokio runtime, background eviction disabled");
            return;
        };

        let weak = Arc::downgrade(inner);
        let shutdown = inner.shutdown.clone();
        let interval = inner.settings.effective_eviction_interval();

        handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.evict_expired().await;
                if let Err(err) = inner.replenish().await {
                    warn!(pool = %inner.settings.pool_name, error = %err, "failed to replenish idle connections");
                }
            }

            trace!("pool maintenance task stopped");
        });
    }
}

impl<C: Connector> Drop for PoolInner<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A connection checked out of a [`Pool`]
///
/// Dropping it returns the connection to the pool; [`PooledConnection::release`]
/// does the same but also awaits closing when the connection cannot be reused.
pub struct PooledConnection<C: Connector> {
    live: Option<Live<C::Connection>>,
    pool: Arc<PoolInner<C>>,
    reusable: bool,
    // dropped after `live` has been returned, so a waiter finds it idle
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConnection<C> {
    pub fn id(&self) -> u64 {
        self.live().id
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.settings.pool_name
    }

    /// Mark whether the connection may go back to the idle queue.
    ///
    /// Cleared while a transaction is open on it so an abandoned handle is
    /// closed rather than recycled mid-transaction.
    pub(crate) fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    pub async fn release(mut self) {
        if let Some(live) = self.take_live() {
            if let Some(live) = self.pool.try_recycle(live, self.reusable) {
                self.pool.release_slot();
                self.pool.close_connection(live).await;
            }
        }
    }

    /// Close the connection instead of returning it to the pool
    pub async fn discard(mut self) {
        if let Some(live) = self.take_live() {
            self.pool.release_slot();
            self.pool.close_connection(live).await;
        }
    }

    fn take_live(&mut self) -> Option<Live<C::Connection>> {
        let live = self.live.take()?;
        self.pool.checked_out.fetch_sub(1, Ordering::SeqCst);
        Some(live)
    }

    fn live(&self) -> &Live<C::Connection> {
        self.live
            .as_ref()
            .expect("pooled connection used after release")
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        &self.live().conn
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .live
            .as_mut()
            .expect("pooled connection used after release")
            .conn
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(live) = self.take_live() else {
            return;
        };
        let Some(live) = self.pool.try_recycle(live, self.reusable) else {
            return;
        };

        self.pool.release_slot();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.pool);
                handle.spawn(async move { pool.close_connection(live).await });
            }
            Err(_) => {
                // no runtime to close on; dropping the connection closes its socket
                Counters::bump(&self.pool.counters.closed);
                drop(live);
            }
        }
    }
}

impl<C: Connector> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.settings.pool_name)
            .field("id", &self.live.as_ref().map(|live| live.id))
            .finish()
    }
}
