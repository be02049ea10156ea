//! Bounded backend connection pool with health-based retirement
//!
//! This module provides the pool that owns every backend connection:
//! - Eager warm-up to `min_size` and on-demand growth up to `max_size`
//! - FIFO hand-off between callers waiting for a connection
//! - Retirement on failed liveness check, idle timeout or max lifetime
//! - A background health sweep that replenishes the pool to `min_size`

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::factory::ConnectionFactory;

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pool exhausted: no connection available within {timeout:?}{}", describe_last_error(.last_error))]
    Exhausted {
        timeout: Duration,
        last_error: Option<String>,
    },

    #[error("Pool is closed")]
    Closed,

    #[error("Acquire was cancelled")]
    Cancelled,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

fn describe_last_error(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(" (last connect error: {e})"))
        .unwrap_or_default()
}

impl PoolError {
    /// Exhaustion is the only condition worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Exhausted { .. })
    }
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections created eagerly and kept warm by the health sweep
    pub min_size: usize,

    /// Hard cap on live connections
    pub max_size: usize,

    /// Default time `acquire` waits before reporting exhaustion
    pub acquire_timeout: Duration,

    /// Idle connections older than this are retired
    pub idle_timeout: Duration,

    /// Connections older than this are retired regardless of use
    pub max_lifetime: Duration,

    /// Consecutive creation failures tolerated within one acquire
    pub retry_attempts: u32,

    /// Pause between creation attempts
    pub retry_delay: Duration,

    /// Period of the background health sweep, `None` disables it
    pub health_check_interval: Option<Duration>,

    /// Check idle connections are alive before handing them out
    pub test_on_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            health_check_interval: Some(Duration::from_secs(60)),
            test_on_acquire: true,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be positive".to_string()));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if matches!(self.health_check_interval, Some(d) if d.is_zero()) {
            return Err(PoolError::InvalidConfig(
                "health_check_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of pool accounting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live connections: idle + in use + being created or checked
    pub current_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// Idle connections ready for reuse
    pub available: usize,
    /// Connections checked out by callers
    pub in_use: usize,
    /// Callers blocked in `acquire` until a connection or slot frees up
    pub waiting: usize,
    pub created_total: u64,
    pub retired_total: u64,
    pub total_acquired: u64,
    pub total_reused: u64,
    pub failed_creates: u64,
}

/// Why a connection was taken out of service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Exceeded `max_lifetime`
    Expired,
    /// Sat idle longer than `idle_timeout`
    Idle,
    /// Failed the liveness check
    CheckFailed,
    /// Reported broken by the caller holding it
    Broken,
    /// Pool was closed
    Shutdown,
    /// The acquire checking it was cancelled or timed out mid-check
    Abandoned,
}

impl RetireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetireReason::Expired => "max_lifetime",
            RetireReason::Idle => "idle_timeout",
            RetireReason::CheckFailed => "check_failed",
            RetireReason::Broken => "broken",
            RetireReason::Shutdown => "shutdown",
            RetireReason::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend connection plus the bookkeeping the pool keeps about it
pub struct PooledResource<C> {
    conn: C,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

impl<C> PooledResource<C> {
    fn new(conn: C) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.created_at)
    }

    pub fn idle_time(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_used)
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    fn retire_reason(&self, config: &PoolConfig, now: Instant) -> Option<RetireReason> {
        if now.saturating_duration_since(self.created_at) > config.max_lifetime {
            Some(RetireReason::Expired)
        } else if now.saturating_duration_since(self.last_used) > config.idle_timeout {
            Some(RetireReason::Idle)
        } else {
            None
        }
    }
}

/// Mutable pool state, always mutated under a single lock
struct PoolState<C> {
    idle: VecDeque<PooledResource<C>>,
    /// Live connections including slots reserved for creation or checking
    size: usize,
    in_use: usize,
    waiting: usize,
    closed: bool,
    created_total: u64,
    retired_total: u64,
    total_acquired: u64,
    total_reused: u64,
    failed_creates: u64,
    last_error: Option<String>,
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    /// One permit per connection a caller may hold. Idle connections hold none.
    permits: Arc<Semaphore>,
    /// Signalled whenever a connection goes idle or a slot frees up
    available: Notify,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn free_slot(&self) {
        {
            let mut state = self.state.lock();
            state.size = state.size.saturating_sub(1);
        }
        self.available.notify_one();
    }
}

impl<F: ConnectionFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A reserved unit of `size`, released again unless it ends up checked out
/// or parked in the idle queue. Keeps accounting exact when an acquire is
/// dropped mid-creation or mid-check.
struct Slot<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
    armed: bool,
}

impl<F: ConnectionFactory> Slot<F> {
    fn new(inner: &Arc<PoolInner<F>>) -> Self {
        Self {
            inner: Arc::clone(inner),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for Slot<F> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.free_slot();
        }
    }
}

/// An idle connection out for a liveness check. If the acquire is dropped
/// before the check returns, the connection is closed through the factory.
struct Checking<'a, F: ConnectionFactory> {
    pool: &'a ResourcePool<F>,
    resource: Option<PooledResource<F::Connection>>,
}

impl<F: ConnectionFactory> Checking<'_, F> {
    fn finish(mut self) -> Option<PooledResource<F::Connection>> {
        self.resource.take()
    }
}

impl<F: ConnectionFactory> Drop for Checking<'_, F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.retire(resource, RetireReason::Abandoned);
        }
    }
}

/// Counts a caller in `waiting` while it is blocked on a free connection
struct WaitGuard<'a, C> {
    state: &'a Mutex<PoolState<C>>,
}

impl<'a, C> WaitGuard<'a, C> {
    fn enter(state: &'a Mutex<PoolState<C>>) -> Self {
        state.lock().waiting += 1;
        Self { state }
    }
}

impl<C> Drop for WaitGuard<'_, C> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.waiting = state.waiting.saturating_sub(1);
    }
}

enum Step<C> {
    Idle(PooledResource<C>),
    Create,
    Wait,
}

/// Result of one health sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub retired: usize,
    pub created: usize,
}

/// Bounded pool of backend connections
///
/// Cloning is cheap; clones share the same connections.
pub struct ResourcePool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for ResourcePool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl<F: ConnectionFactory> ResourcePool<F> {
    /// Create a pool, open `min_size` connections and start the health sweep.
    ///
    /// Warm-up failures are logged and left for the sweep or the next
    /// `acquire` to retry.
    pub async fn new(factory: F, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        info!(
            min_size = config.min_size,
            max_size = config.max_size,
            acquire_timeout_ms = config.acquire_timeout.as_millis() as u64,
            "Creating connection pool"
        );

        let max_size = config.max_size;
        let pool = Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(max_size),
                    size: 0,
                    in_use: 0,
                    waiting: 0,
                    closed: false,
                    created_total: 0,
                    retired_total: 0,
                    total_acquired: 0,
                    total_reused: 0,
                    failed_creates: 0,
                    last_error: None,
                }),
                permits: Arc::new(Semaphore::new(max_size)),
                available: Notify::new(),
                shutdown: CancellationToken::new(),
                maintenance: Mutex::new(None),
            }),
        };

        let warmed = pool.replenish().await;
        if warmed < pool.inner.config.min_size {
            warn!(
                created = warmed,
                min_size = pool.inner.config.min_size,
                "Pool warm-up incomplete, will retry lazily"
            );
        }

        pool.start_maintenance_task();
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Acquire a connection, waiting at most the configured `acquire_timeout`
    pub async fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Acquire a connection, waiting at most `timeout`
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<F>, PoolError> {
        self.acquire_with(timeout, &CancellationToken::new()).await
    }

    /// Acquire a connection, giving up on `timeout`, on `cancel`, or when the
    /// pool is closed. A cancelled or timed-out wait never holds a connection.
    pub async fn acquire_with(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection<F>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let start = Instant::now();

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PoolError::Cancelled),
            () = self.inner.shutdown.cancelled() => Err(PoolError::Closed),
            res = tokio::time::timeout(timeout, self.acquire_inner(timeout)) => match res {
                Ok(res) => res,
                Err(_) => Err(PoolError::Exhausted {
                    timeout,
                    last_error: self.inner.state.lock().last_error.clone(),
                }),
            },
        };

        let wait_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(conn) => debug!(wait_ms, use_count = conn.use_count(), "Acquired connection"),
            Err(e) => warn!(wait_ms, error = %e, "Failed to acquire connection"),
        }

        result
    }

    async fn acquire_inner(&self, timeout: Duration) -> Result<PooledConnection<F>, PoolError> {
        let inner = &self.inner;

        // Semaphore waiters are served in FIFO order; a free permit is only
        // visible here when nobody is queued
        let permit = match Arc::clone(&inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
            Err(TryAcquireError::NoPermits) => {
                let _waiting = WaitGuard::enter(&inner.state);
                Arc::clone(&inner.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| PoolError::Closed)?
            }
        };

        let max_attempts = inner.config.retry_attempts.max(1);
        let mut failures = 0u32;

        loop {
            let step = {
                let mut state = inner.state.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                if let Some(resource) = state.idle.pop_front() {
                    Step::Idle(resource)
                } else if state.size < inner.config.max_size {
                    state.size += 1;
                    Step::Create
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Idle(resource) => {
                    let slot = Slot::new(inner);
                    if let Some(resource) = self.check_idle(resource).await {
                        return Ok(self.checkout(resource, slot, permit, true));
                    }
                    // Retired: dropping the slot frees room for a replacement
                }
                Step::Create => {
                    let slot = Slot::new(inner);
                    match self.create_resource().await {
                        Ok(resource) => return Ok(self.checkout(resource, slot, permit, false)),
                        Err(err) => {
                            drop(slot);
                            failures += 1;
                            if failures >= max_attempts {
                                return Err(PoolError::Exhausted {
                                    timeout,
                                    last_error: Some(format!("{err:#}")),
                                });
                            }
                            tokio::time::sleep(inner.config.retry_delay).await;
                        }
                    }
                }
                Step::Wait => {
                    let _waiting = WaitGuard::enter(&inner.state);
                    inner.available.notified().await;
                }
            }
        }
    }

    /// Apply the retirement policy to an idle connection about to be reused
    async fn check_idle(
        &self,
        resource: PooledResource<F::Connection>,
    ) -> Option<PooledResource<F::Connection>> {
        let inner = &self.inner;
        if let Some(reason) = resource.retire_reason(&inner.config, Instant::now()) {
            self.retire(resource, reason);
            return None;
        }
        if !inner.config.test_on_acquire {
            return Some(resource);
        }

        let mut checking = Checking {
            pool: self,
            resource: Some(resource),
        };
        let alive = match checking.resource.as_mut() {
            Some(resource) => inner.factory.is_alive(&mut resource.conn).await,
            None => false,
        };
        let resource = checking.finish()?;
        if alive {
            Some(resource)
        } else {
            self.retire(resource, RetireReason::CheckFailed);
            None
        }
    }

    fn checkout(
        &self,
        mut resource: PooledResource<F::Connection>,
        slot: Slot<F>,
        permit: OwnedSemaphorePermit,
        reused: bool,
    ) -> PooledConnection<F> {
        slot.disarm();
        resource.use_count += 1;
        resource.last_used = Instant::now();
        {
            let mut state = self.inner.state.lock();
            state.in_use += 1;
            state.total_acquired += 1;
            if reused {
                state.total_reused += 1;
            }
        }
        PooledConnection {
            resource: Some(resource),
            pool: self.clone(),
            broken: false,
            _permit: permit,
        }
    }

    async fn create_resource(&self) -> anyhow::Result<PooledResource<F::Connection>> {
        match self.inner.factory.create().await {
            Ok(conn) => {
                let created_total = {
                    let mut state = self.inner.state.lock();
                    state.created_total += 1;
                    state.last_error = None;
                    state.created_total
                };
                debug!(created_total, "Created new connection");
                Ok(PooledResource::new(conn))
            }
            Err(err) => {
                {
                    let mut state = self.inner.state.lock();
                    state.failed_creates += 1;
                    state.last_error = Some(format!("{err:#}"));
                }
                warn!(error = %err, "Failed to create connection");
                Err(err)
            }
        }
    }

    /// Close a connection that has already left the pool's idle queue.
    /// Size accounting is the caller's job.
    fn retire(&self, resource: PooledResource<F::Connection>, reason: RetireReason) {
        self.inner.state.lock().retired_total += 1;
        debug!(
            reason = %reason,
            age_secs = resource.age().as_secs(),
            use_count = resource.use_count,
            "Retiring connection"
        );
        self.inner.factory.close(resource.conn);
    }

    fn give_back(&self, mut resource: PooledResource<F::Connection>, broken: bool) {
        let now = Instant::now();
        resource.last_used = now;

        let retire_reason = {
            let mut state = self.inner.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
            let reason = if state.closed {
                Some(RetireReason::Shutdown)
            } else if broken {
                Some(RetireReason::Broken)
            } else if now.saturating_duration_since(resource.created_at) > self.inner.config.max_lifetime {
                Some(RetireReason::Expired)
            } else {
                None
            };
            match reason {
                Some(reason) => {
                    state.size = state.size.saturating_sub(1);
                    Some((resource, reason))
                }
                None => {
                    state.idle.push_back(resource);
                    None
                }
            }
        };

        if let Some((resource, reason)) = retire_reason {
            self.retire(resource, reason);
        }
        self.inner.available.notify_one();
    }

    /// Return a connection to the pool. Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection<F>) {
        drop(conn);
    }

    /// Open connections until the pool holds `min_size`. Returns how many were
    /// created; stops at the first creation failure.
    async fn replenish(&self) -> usize {
        let inner = &self.inner;
        let mut created = 0;

        loop {
            let reserved = {
                let mut state = inner.state.lock();
                if !state.closed && state.size < inner.config.min_size && state.size < inner.config.max_size {
                    state.size += 1;
                    true
                } else {
                    false
                }
            };
            if !reserved {
                break;
            }

            let slot = Slot::new(inner);
            let resource = match self.create_resource().await {
                Ok(resource) => resource,
                Err(_) => break,
            };

            let rejected = {
                let mut state = inner.state.lock();
                if state.closed {
                    Some(resource)
                } else {
                    state.idle.push_back(resource);
                    None
                }
            };
            match rejected {
                Some(resource) => {
                    // Slot stays armed and frees the size on drop
                    self.retire(resource, RetireReason::Shutdown);
                    break;
                }
                None => {
                    slot.disarm();
                    inner.available.notify_one();
                    created += 1;
                }
            }
        }

        created
    }

    /// Run one health sweep: retire idle connections past `idle_timeout` or
    /// `max_lifetime`, then top the pool back up to `min_size`.
    pub async fn maintain(&self) -> MaintenanceReport {
        let now = Instant::now();
        let stale: Vec<(PooledResource<F::Connection>, RetireReason)> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return MaintenanceReport::default();
            }
            let mut stale = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            for resource in state.idle.drain(..) {
                match resource.retire_reason(&self.inner.config, now) {
                    Some(reason) => stale.push((resource, reason)),
                    None => kept.push_back(resource),
                }
            }
            state.idle = kept;
            state.size = state.size.saturating_sub(stale.len());
            stale
        };

        let retired = stale.len();
        for (resource, reason) in stale {
            self.retire(resource, reason);
            self.inner.available.notify_one();
        }

        let created = self.replenish().await;
        if retired > 0 || created > 0 {
            debug!(retired, created, "Pool health sweep");
        }

        MaintenanceReport { retired, created }
    }

    fn start_maintenance_task(&self) {
        let Some(interval) = self.inner.config.health_check_interval else {
            return;
        };

        let weak: Weak<PoolInner<F>> = Arc::downgrade(&self.inner);
        let cancel = self.inner.shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = cancel.cancelled() => break,
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ResourcePool { inner }.maintain().await;
            }
        });

        *self.inner.maintenance.lock() = Some(handle);
    }

    /// Close every idle connection and stop the health sweep. Connections
    /// still checked out are closed when they come back. Later `acquire`
    /// calls fail with [`PoolError::Closed`].
    pub async fn close(&self) {
        let drained: Vec<PooledResource<F::Connection>> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.size = state.size.saturating_sub(drained.len());
            drained
        };

        self.inner.shutdown.cancel();
        self.inner.permits.close();
        self.inner.available.notify_waiters();

        let closed = drained.len();
        for resource in drained {
            self.retire(resource, RetireReason::Shutdown);
        }

        let handle = self.inner.maintenance.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pool maintenance task ended abnormally");
            }
        }

        info!(closed, "Connection pool closed");
    }

    /// Non-blocking snapshot of pool accounting
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            current_size: state.size,
            min_size: self.inner.config.min_size,
            max_size: self.inner.config.max_size,
            available: state.idle.len(),
            in_use: state.in_use,
            waiting: state.waiting,
            created_total: state.created_total,
            retired_total: state.retired_total,
            total_acquired: state.total_acquired,
            total_reused: state.total_reused,
            failed_creates: state.failed_creates,
        }
    }
}

/// A connection checked out of a [`ResourcePool`]
///
/// Dereferences to the backend connection and goes back to the pool when
/// dropped. Call [`retire`](Self::retire) instead if the connection broke
/// while in use.
pub struct PooledConnection<F: ConnectionFactory> {
    resource: Option<PooledResource<F::Connection>>,
    pool: ResourcePool<F>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn resource(&self) -> &PooledResource<F::Connection> {
        self.resource
            .as_ref()
            .expect("connection is present until the guard drops")
    }

    /// Number of checkouts of this connection, including the current one
    pub fn use_count(&self) -> u64 {
        self.resource().use_count
    }

    pub fn age(&self) -> Duration {
        self.resource().age()
    }

    /// Close this connection instead of returning it to the pool
    pub fn retire(mut self) {
        self.broken = true;
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.resource().conn
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .resource
            .as_mut()
            .expect("connection is present until the guard drops")
            .conn
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("PooledConnection");
        if let Some(resource) = &self.resource {
            d.field("use_count", &resource.use_count)
                .field("age", &resource.age());
        }
        d.field("broken", &self.broken).finish()
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.give_back(resource, self.broken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl ConnectionFactory for Arc<CountingFactory> {
        type Connection = usize;

        async fn create(&self) -> anyhow::Result<usize> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn is_alive(&self, _conn: &mut usize) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn factory() -> Arc<CountingFactory> {
        let f = Arc::new(CountingFactory::default());
        f.healthy.store(true, Ordering::SeqCst);
        f
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_size: min,
            max_size: max,
            acquire_timeout: Duration::from_millis(50),
            retry_delay: Duration::from_millis(1),
            health_check_interval: None,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.min_size, 1);
        assert_eq!(config.max_size, 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert!(config.test_on_acquire);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_min_above_max() {
        let err = config(5, 2).validate().unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
        assert!(config(0, 0).validate().is_err());
    }

    #[tokio::test]
    async fn test_warm_up_creates_min_size() {
        let pool = ResourcePool::new(factory(), config(3, 5)).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.current_size, 3);
        assert_eq!(stats.available, 3);
        assert_eq!(stats.created_total, 3);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_reuses_idle_connection() {
        let pool = ResourcePool::new(factory(), config(1, 2)).await.unwrap();

        let conn = pool.acquire().await.unwrap();
        let id = *conn;
        assert_eq!(conn.use_count(), 1);
        pool.release(conn);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, id);
        assert_eq!(conn.use_count(), 2);
        assert_eq!(pool.stats().total_reused, 2);
    }

    #[tokio::test]
    async fn test_failed_check_replaces_connection() {
        let f = factory();
        let pool = ResourcePool::new(Arc::clone(&f), config(1, 1)).await.unwrap();
        f.healthy.store(false, Ordering::SeqCst);

        let conn = pool.acquire().await.unwrap();
        // The warm connection (id 0) failed its check and was replaced
        assert_eq!(*conn, 1);
        drop(conn);

        let stats = pool.stats();
        assert_eq!(stats.retired_total, 1);
        assert_eq!(stats.current_size, 1);
    }

    #[tokio::test]
    async fn test_retire_broken_connection() {
        let pool = ResourcePool::new(factory(), config(0, 2)).await.unwrap();
        let conn = pool.acquire().await.unwrap();
        conn.retire();

        let stats = pool.stats();
        assert_eq!(stats.current_size, 0);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.retired_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_retires_on_acquire() {
        let mut cfg = config(1, 1);
        cfg.idle_timeout = Duration::from_secs(10);
        let pool = ResourcePool::new(factory(), cfg).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 1);
        assert_eq!(pool.stats().retired_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintain_retires_and_replenishes() {
        let mut cfg = config(2, 4);
        cfg.max_lifetime = Duration::from_secs(60);
        let pool = ResourcePool::new(factory(), cfg).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = pool.maintain().await;

        assert_eq!(report, MaintenanceReport { retired: 2, created: 2 });
        let stats = pool.stats();
        assert_eq!(stats.current_size, 2);
        assert_eq!(stats.available, 2);
        assert_eq!(stats.created_total, 4);
    }

    #[tokio::test]
    async fn test_close_fails_fast() {
        let pool = ResourcePool::new(factory(), config(2, 2)).await.unwrap();
        let held = pool.acquire().await.unwrap();

        pool.close().await;
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));

        // Returned after close: closed instead of pooled
        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.current_size, 0);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.retired_total, 2);
    }

    #[test]
    fn test_exhausted_error_message() {
        let err = PoolError::Exhausted {
            timeout: Duration::from_millis(50),
            last_error: Some("connection refused".to_string()),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection refused"));
        assert!(!PoolError::Closed.is_retryable());
    }
}
