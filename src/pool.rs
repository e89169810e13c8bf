//! Bounded pool of converter handles.
//!
//! Converters are expensive to construct, so a small number of them is
//! shared across all in-flight requests. A borrower waits (without polling)
//! for one of `max_total` permits, up to an optional timeout, then receives
//! a handle that has just passed validation.
//!
//! ```text
//! borrow() ──► [permit] ──► pop idle ──► validate ──► PooledWorker
//!                 │             │ empty       │ broken
//!                 │             ▼             ▼
//!                 │         factory.create  factory.destroy, retry
//!                 ▼
//!   drop(PooledWorker) ──► validate ──► idle list  (or destroy)
//!                                   └─► permit released
//! ```
//!
//! Every handle either sits in the idle list or is owned by exactly one
//! `PooledWorker`, and the number of live handles never exceeds `max_total`.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, error, info, warn};

use crate::converter::PdfaConverter;

/// Log target for pool lifecycle events.
const POOL_TARGET: &str = "pool";

/// Errors returned when borrowing from the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No handle became available within the borrow timeout.
    #[error("no converter available after waiting {waited:?}")]
    Exhausted { waited: Duration },

    /// The factory could not build a replacement handle.
    #[error("failed to construct converter: {0}")]
    ConstructionFailed(String),

    /// The pool has been closed.
    #[error("converter pool is closed")]
    Closed,
}

/// Error reported by a [`WorkerFactory`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct FactoryError(pub String);

/// Constructs, validates and destroys converters on behalf of the pool.
pub trait WorkerFactory: Send + Sync + 'static {
    /// Builds a new converter. May be slow.
    fn create(&self) -> Result<Box<dyn PdfaConverter>, FactoryError>;

    /// Health check run on every borrow and every return.
    fn validate(&self, converter: &dyn PdfaConverter) -> bool {
        converter.is_healthy()
    }

    /// Releases a converter that failed validation or is being retired.
    fn destroy(&self, converter: Box<dyn PdfaConverter>) -> Result<(), FactoryError> {
        drop(converter);
        Ok(())
    }
}

/// Validity of a handle as last observed by its holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    Healthy,
    Broken,
}

/// One pooled converter.
pub struct WorkerHandle {
    id: u64,
    converter: Box<dyn PdfaConverter>,
    state: HandleState,
    created_at: Instant,
}

impl WorkerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Flags the handle so it is destroyed instead of recycled on return.
    pub fn mark_broken(&mut self) {
        self.state = HandleState::Broken;
    }

    pub fn converter(&mut self) -> &mut dyn PdfaConverter {
        self.converter.as_mut()
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on live handles (idle + borrowed).
    pub max_total: usize,
    /// Handles kept warm even when nothing is borrowed.
    pub min_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 10,
            min_idle: 3,
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_total: usize,
    pub min_idle: usize,
    /// Handles waiting in the idle list
    pub idle: usize,
    /// Handles currently held by borrowers
    pub in_use: usize,
    /// Idle + borrowed + under construction
    pub live: usize,
    /// Total handles ever created
    pub created: usize,
    /// Total handles destroyed
    pub destroyed: usize,
    /// Total successful borrows
    pub borrowed: usize,
}

/// Thread-safe pool of converter handles. Cheap to clone.
#[derive(Clone)]
pub struct ConverterPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    factory: Arc<dyn WorkerFactory>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<WorkerHandle>>,
    live: AtomicUsize,
    in_use: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    borrowed: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ConverterPool {
    /// Creates an empty pool. Call [`ConverterPool::warm_up`] to pre-build
    /// the `min_idle` handles.
    pub fn new(factory: Arc<dyn WorkerFactory>, mut config: PoolConfig) -> Self {
        config.max_total = config.max_total.max(1);
        config.min_idle = config.min_idle.min(config.max_total);

        Self {
            inner: Arc::new(PoolInner {
                factory,
                permits: Arc::new(Semaphore::new(config.max_total)),
                idle: Mutex::new(Vec::with_capacity(config.max_total)),
                config,
                live: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                borrowed: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrows a validated handle, waiting up to `timeout` (forever if
    /// `None`) while every handle is in use.
    ///
    /// A borrower that times out or is cancelled never ends up holding a
    /// handle: the permit is only converted into a handle after the wait.
    ///
    /// # Arguments
    /// * `timeout` - Longest wait for a free slot, or `None` to wait indefinitely
    ///
    /// # Returns
    /// A [`PooledWorker`] that returns its handle to the pool when dropped.
    ///
    /// # Errors
    /// * `PoolError::Exhausted` - no slot freed up within `timeout`
    /// * `PoolError::ConstructionFailed` - no idle handle validated and the factory failed
    /// * `PoolError::Closed` - the pool was closed before or during the wait
    pub async fn borrow(&self, timeout: Option<Duration>) -> Result<PooledWorker, PoolError> {
        let started = Instant::now();
        debug!(target: POOL_TARGET, "About to get converter from pool");

        // Wait for a slot; a permit bounds borrowed handles to max_total
        let acquire = self.inner.permits.clone().acquire_owned();
        let permit = match timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(
                        target: POOL_TARGET,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Converter pool exhausted"
                    );
                    return Err(PoolError::Exhausted {
                        waited: started.elapsed(),
                    });
                }
            },
            None => acquire.await,
        }
        .map_err(|_| PoolError::Closed)?;

        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        // Reuse a validated idle handle, or build one in the free slot
        let handle = self.checkout().await?;

        self.inner.in_use.fetch_add(1, Ordering::Relaxed);
        self.inner.borrowed.fetch_add(1, Ordering::Relaxed);
        info!(
            target: POOL_TARGET,
            "Got converter from pool: handle_id={}, waited_ms={}",
            handle.id,
            started.elapsed().as_millis()
        );

        Ok(PooledWorker {
            handle: Some(handle),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Pops idle handles until one validates, or builds a new one.
    async fn checkout(&self) -> Result<WorkerHandle, PoolError> {
        loop {
            let candidate = self.inner.idle.lock().pop();
            let Some(handle) = candidate else {
                // Holding a permit with nothing idle means live < max_total.
                let reservation = self.inner.reserve();
                return self.create_handle(reservation).await;
            };

            if self.inner.is_valid(&handle) {
                return Ok(handle);
            }

            warn!(
                target: POOL_TARGET,
                "Idle converter failed validation, destroying: handle_id={}", handle.id
            );
            self.inner.destroy(handle);
        }
    }

    async fn create_handle(&self, reservation: Reservation) -> Result<WorkerHandle, PoolError> {
        let factory = self.inner.factory.clone();
        let converter = tokio::task::spawn_blocking(move || factory.create())
            .await
            .map_err(|e| PoolError::ConstructionFailed(format!("factory task failed: {}", e)))?
            .map_err(|e| {
                error!(target: POOL_TARGET, "Failed to create converter: {}", e);
                PoolError::ConstructionFailed(e.0)
            })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        reservation.commit();

        debug!(target: POOL_TARGET, "Created new converter: handle_id={}", id);
        Ok(WorkerHandle {
            id,
            converter,
            state: HandleState::Healthy,
            created_at: Instant::now(),
        })
    }

    /// Builds idle handles until `min_idle` are waiting, without exceeding
    /// `max_total` or blocking on busy permits. Returns how many were created.
    pub async fn ensure_min_idle(&self) -> usize {
        let mut created = 0;

        while !self.inner.closed.load(Ordering::Acquire) {
            let permit = match self.inner.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => break,
            };

            let reservation = {
                let idle = self.inner.idle.lock();
                if idle.len() >= self.inner.config.min_idle {
                    break;
                }
                match self.inner.try_reserve() {
                    Some(reservation) => reservation,
                    None => break,
                }
            };

            match self.create_handle(reservation).await {
                Ok(handle) => {
                    self.inner.idle.lock().push(handle);
                    created += 1;
                }
                Err(e) => {
                    warn!(target: POOL_TARGET, "Warm-up stopped: {}", e);
                    break;
                }
            }
            drop(permit);
        }

        if created > 0 {
            info!(target: POOL_TARGET, "Warmed {} converter(s)", created);
        }
        created
    }

    /// Pre-builds the `min_idle` handles at startup.
    pub async fn warm_up(&self) -> usize {
        self.ensure_min_idle().await
    }

    /// Destroys idle handles and rejects further borrows. Borrowed handles
    /// are destroyed as they come back.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();

        let drained: Vec<WorkerHandle> = self.inner.idle.lock().drain(..).collect();
        let count = drained.len();
        for handle in drained {
            self.inner.destroy(handle);
        }
        info!(target: POOL_TARGET, "Converter pool closed, destroyed {} idle converter(s)", count);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_total: self.inner.config.max_total,
            min_idle: self.inner.config.min_idle,
            idle: self.inner.idle.lock().len(),
            in_use: self.inner.in_use.load(Ordering::Relaxed),
            live: self.inner.live.load(Ordering::Relaxed),
            created: self.inner.created.load(Ordering::Relaxed),
            destroyed: self.inner.destroyed.load(Ordering::Relaxed),
            borrowed: self.inner.borrowed.load(Ordering::Relaxed),
        }
    }
}

impl PoolInner {
    fn is_valid(&self, handle: &WorkerHandle) -> bool {
        handle.state == HandleState::Healthy && self.factory.validate(handle.converter.as_ref())
    }

    /// Unconditionally counts one more live handle.
    fn reserve(self: &Arc<Self>) -> Reservation {
        self.live.fetch_add(1, Ordering::AcqRel);
        Reservation {
            pool: self.clone(),
            committed: false,
        }
    }

    /// Counts one more live handle if that stays within `max_total`.
    fn try_reserve(self: &Arc<Self>) -> Option<Reservation> {
        let max = self.config.max_total;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max).then_some(live + 1)
            })
            .ok()
            .map(|_| Reservation {
                pool: self.clone(),
                committed: false,
            })
    }

    /// Destroys a handle; failures are logged, never propagated.
    fn destroy(&self, handle: WorkerHandle) {
        let id = handle.id;
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.destroyed.fetch_add(1, Ordering::Relaxed);

        match self.factory.destroy(handle.converter) {
            Ok(()) => debug!(target: POOL_TARGET, "Destroyed converter: handle_id={}", id),
            Err(e) => error!(
                target: POOL_TARGET,
                "Failed to destroy converter: handle_id={}, error={}", id, e
            ),
        }
    }

    fn release(&self, mut handle: WorkerHandle) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);

        if std::thread::panicking() {
            handle.mark_broken();
        }

        if self.closed.load(Ordering::Acquire) || !self.is_valid(&handle) {
            warn!(
                target: POOL_TARGET,
                "Converter not recycled: handle_id={}, state={:?}", handle.id, handle.state
            );
            self.destroy(handle);
            return;
        }

        debug!(target: POOL_TARGET, "Returning converter to pool: handle_id={}", handle.id);
        self.idle.lock().push(handle);
    }
}

/// Live-count slot held while a handle is being constructed. Released
/// again if construction fails or the borrower is cancelled.
struct Reservation {
    pool: Arc<PoolInner>,
    committed: bool,
}

impl Reservation {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Exclusive use of one handle. Dropping it returns the handle to the pool
/// (or destroys it when it is no longer healthy) and frees the permit.
pub struct PooledWorker {
    handle: Option<WorkerHandle>,
    pool: Arc<PoolInner>,
    // Dropped after the handle is back in the idle list.
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledWorker {
    type Target = WorkerHandle;

    fn deref(&self) -> &WorkerHandle {
        self.handle.as_ref().expect("handle present until drop")
    }
}

impl DerefMut for PooledWorker {
    fn deref_mut(&mut self) -> &mut WorkerHandle {
        self.handle.as_mut().expect("handle present until drop")
    }
}

impl fmt::Debug for PooledWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledWorker").field(&self.handle).finish()
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::ConversionError;
    use pretty_assertions::assert_eq;
    use std::path::{Path, PathBuf};

    struct FakeConverter {
        healthy: Arc<AtomicBool>,
    }

    impl PdfaConverter for FakeConverter {
        fn convert(&mut self, input: &Path) -> Result<PathBuf, ConversionError> {
            Ok(input.with_extension("pdf"))
        }

        fn version(&mut self) -> Result<String, ConversionError> {
            Ok("fake 1.0".to_string())
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    /// Hands out converters whose health switches are kept for the test.
    #[derive(Default)]
    struct FakeFactory {
        switches: Mutex<Vec<Arc<AtomicBool>>>,
        fail: AtomicBool,
        destroyed: AtomicUsize,
    }

    impl FakeFactory {
        fn break_all(&self) {
            for switch in self.switches.lock().iter() {
                switch.store(false, Ordering::SeqCst);
            }
        }
    }

    impl WorkerFactory for FakeFactory {
        fn create(&self) -> Result<Box<dyn PdfaConverter>, FactoryError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(FactoryError("tool missing".to_string()));
            }
            let healthy = Arc::new(AtomicBool::new(true));
            self.switches.lock().push(healthy.clone());
            Ok(Box::new(FakeConverter { healthy }))
        }

        fn destroy(&self, converter: Box<dyn PdfaConverter>) -> Result<(), FactoryError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            drop(converter);
            Ok(())
        }
    }

    fn pool_with(max_total: usize, min_idle: usize) -> (ConverterPool, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::default());
        let pool = ConverterPool::new(factory.clone(), PoolConfig { max_total, min_idle });
        (pool, factory)
    }

    #[tokio::test]
    async fn test_borrow_and_return_reuses_handle() {
        let (pool, _factory) = pool_with(2, 0);

        let first_id = {
            let worker = pool.borrow(None).await.unwrap();
            assert_eq!(pool.stats().in_use, 1);
            worker.id()
        };

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 1);

        let worker = pool.borrow(None).await.unwrap();
        assert_eq!(worker.id(), first_id);
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_exceeds_max_total() {
        let (pool, _factory) = pool_with(3, 1);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..24 {
            let pool = pool.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _worker = pool.borrow(Some(Duration::from_secs(10))).await.unwrap();
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let stats = pool.stats();
        assert!(stats.live <= 3);
        assert!(stats.created <= 3);
        assert_eq!(stats.borrowed, 24);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_broken_idle_handle_is_never_handed_out() {
        let (pool, factory) = pool_with(2, 2);
        assert_eq!(pool.warm_up().await, 2);

        factory.break_all();

        let worker = pool.borrow(None).await.unwrap();
        assert!(worker.converter.is_healthy());
        assert_eq!(worker.state(), HandleState::Healthy);

        let stats = pool.stats();
        assert_eq!(stats.destroyed, 2);
        assert_eq!(stats.created, 3);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handle_broken_during_borrow_is_destroyed_on_return() {
        let (pool, factory) = pool_with(1, 0);

        {
            let mut worker = pool.borrow(None).await.unwrap();
            worker.mark_broken();
        }

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.live, 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

        // A replacement is built lazily on the next borrow.
        let worker = pool.borrow(None).await.unwrap();
        assert_eq!(worker.id(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let (pool, _factory) = pool_with(1, 0);
        let _held = pool.borrow(None).await.unwrap();

        let err = pool
            .borrow(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));

        // The timed-out borrower left nothing behind.
        let stats = pool.stats();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.live, 1);
    }

    #[tokio::test]
    async fn test_blocked_borrow_proceeds_after_return() {
        let (pool, _factory) = pool_with(1, 0);
        let held = pool.borrow(None).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow(Some(Duration::from_secs(5))).await.map(|w| w.id()) })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        let held_id = held.id();
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
    }

    #[tokio::test]
    async fn test_construction_failure_releases_permit() {
        let (pool, factory) = pool_with(1, 0);
        factory.fail.store(true, Ordering::SeqCst);

        let err = pool.borrow(Some(Duration::from_millis(50))).await.unwrap_err();
        assert!(matches!(err, PoolError::ConstructionFailed(_)));
        assert_eq!(pool.stats().live, 0);

        factory.fail.store(false, Ordering::SeqCst);
        assert!(pool.borrow(Some(Duration::from_millis(50))).await.is_ok());
    }

    #[tokio::test]
    async fn test_warm_up_respects_bounds() {
        let (pool, _factory) = pool_with(2, 5);
        assert_eq!(pool.config().min_idle, 2);

        assert_eq!(pool.warm_up().await, 2);
        assert_eq!(pool.ensure_min_idle().await, 0);

        let _a = pool.borrow(None).await.unwrap();
        let _b = pool.borrow(None).await.unwrap();
        // Everything is borrowed; topping up must not exceed max_total.
        assert_eq!(pool.ensure_min_idle().await, 0);
        assert_eq!(pool.stats().live, 2);
    }

    #[tokio::test]
    async fn test_close_destroys_idle_and_rejects_borrows() {
        let (pool, factory) = pool_with(2, 2);
        pool.warm_up().await;

        pool.close();

        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
        assert!(matches!(pool.borrow(None).await, Err(PoolError::Closed)));
    }

    #[test]
    fn test_handle_released_while_panicking_is_destroyed() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (pool, factory) = pool_with(1, 0);
        let worker = runtime.block_on(pool.borrow(None)).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _worker = worker;
            panic!("converter crashed");
        }));

        assert!(result.is_err());
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().idle, 0);
    }
}
