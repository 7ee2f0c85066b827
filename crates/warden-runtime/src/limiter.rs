//! Bounded concurrency for subprocess and network bound work.
//!
//! A [`ConcurrencyLimiter`] owns one process-wide semaphore plus one
//! semaphore per module. Callers always take the global slot first and the
//! module slot second; [`LimiterPermit`] releases them in the reverse order
//! on every exit path. Excess work queues (FIFO) instead of being dropped.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

pub const GLOBAL_SEMAPHORE_NAME: &str = "global";
const DEFAULT_GLOBAL_MAX: usize = 4;
const DEFAULT_MODULE_MAX: usize = 2;
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    #[error("semaphore '{name}' must allow at least one concurrent holder")]
    InvalidCapacity { name: String },
    #[error("semaphore '{name}' is closed")]
    Closed { name: String },
    #[error("operation in module '{module}' timed out after {timeout_ms}ms")]
    Timeout { module: String, timeout_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SemaphoreState {
    pub pending: usize,
    pub in_flight: usize,
    pub max: usize,
}

/// Counting semaphore with FIFO waiters (tokio's semaphore is fair) and
/// observable pending/in-flight counters.
#[derive(Debug)]
pub struct CountingSemaphore {
    name: String,
    max: usize,
    semaphore: Arc<Semaphore>,
    pending: AtomicUsize,
    in_flight: AtomicUsize,
}

impl CountingSemaphore {
    pub fn new(name: impl Into<String>, max: usize) -> Result<Arc<Self>, LimiterError> {
        let name = name.into();
        if max == 0 {
            return Err(LimiterError::InvalidCapacity { name });
        }
        Ok(Arc::new(Self {
            name,
            max,
            semaphore: Arc::new(Semaphore::new(max)),
            pending: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SemaphoreState {
        SemaphoreState {
            pending: self.pending.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            max: self.max,
        }
    }

    /// Waits for a slot. Dropping the returned permit releases it.
    pub async fn acquire(self: &Arc<Self>) -> Result<SemaphorePermit, LimiterError> {
        let started = Instant::now();
        let queue_depth = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        let contended = queue_depth > 1 || self.semaphore.available_permits() == 0;
        let waiting = PendingSlot { owner: self };
        let acquired = Arc::clone(&self.semaphore).acquire_owned().await;
        drop(waiting);
        let permit = acquired.map_err(|_| LimiterError::Closed {
            name: self.name.clone(),
        })?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(SemaphorePermit {
            owner: Arc::clone(self),
            waited: started.elapsed(),
            contended,
            queue_depth,
            _permit: permit,
        })
    }
}

/// Keeps `pending` honest when an acquire future is cancelled mid-wait.
struct PendingSlot<'a> {
    owner: &'a CountingSemaphore,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.owner.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct SemaphorePermit {
    owner: Arc<CountingSemaphore>,
    waited: Duration,
    contended: bool,
    queue_depth: usize,
    _permit: OwnedSemaphorePermit,
}

impl SemaphorePermit {
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn contended(&self) -> bool {
        self.contended
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        // Counter first; the underlying slot is returned when `_permit` drops.
        self.owner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Global + module slots. Fields drop in declaration order, so the module
/// slot is always released before the global one.
#[derive(Debug)]
pub struct LimiterPermit {
    module: SemaphorePermit,
    global: SemaphorePermit,
}

impl LimiterPermit {
    pub fn module_name(&self) -> &str {
        self.module.owner.name()
    }

    pub fn waited(&self) -> Duration {
        self.global.waited + self.module.waited
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WaitBuckets {
    pub lt_10ms: u64,
    pub lt_100ms: u64,
    pub lt_1s: u64,
    pub ge_1s: u64,
}

impl WaitBuckets {
    fn record(&mut self, waited: Duration) {
        let bucket = match waited.as_millis() {
            0..=9 => &mut self.lt_10ms,
            10..=99 => &mut self.lt_100ms,
            100..=999 => &mut self.lt_1s,
            _ => &mut self.ge_1s,
        };
        *bucket = bucket.saturating_add(1);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LimiterMetricsSnapshot {
    pub acquisitions: u64,
    pub contended: u64,
    pub max_queue_depth: usize,
    pub total_wait_ms: u64,
    pub wait_buckets: WaitBuckets,
    pub timeouts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    pub global_max: usize,
    pub default_module_max: usize,
    pub operation_timeout: Duration,
}

impl LimiterConfig {
    pub fn new(global_max: usize, default_module_max: usize, operation_timeout: Duration) -> Self {
        Self {
            global_max,
            default_module_max,
            operation_timeout,
        }
    }

    pub fn standard() -> Self {
        Self::new(DEFAULT_GLOBAL_MAX, DEFAULT_MODULE_MAX, DEFAULT_OPERATION_TIMEOUT)
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug)]
struct LimiterInner {
    config: LimiterConfig,
    module_max: BTreeMap<String, usize>,
    global: Arc<CountingSemaphore>,
    modules: Mutex<BTreeMap<String, Arc<CountingSemaphore>>>,
    metrics: Mutex<LimiterMetricsSnapshot>,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

impl ConcurrencyLimiter {
    pub fn new(config: LimiterConfig) -> Result<Self, LimiterError> {
        Self::with_module_limits(config, BTreeMap::new())
    }

    /// `module_max` sizes named modules; others get `default_module_max`.
    pub fn with_module_limits(
        config: LimiterConfig,
        module_max: BTreeMap<String, usize>,
    ) -> Result<Self, LimiterError> {
        if config.default_module_max == 0 {
            return Err(LimiterError::InvalidCapacity {
                name: "default_module".to_string(),
            });
        }
        if let Some((name, _)) = module_max.iter().find(|(_, max)| **max == 0) {
            return Err(LimiterError::InvalidCapacity { name: name.clone() });
        }
        let global = CountingSemaphore::new(GLOBAL_SEMAPHORE_NAME, config.global_max)?;
        Ok(Self {
            inner: Arc::new(LimiterInner {
                config,
                module_max,
                global,
                modules: Mutex::new(BTreeMap::new()),
                metrics: Mutex::new(LimiterMetricsSnapshot::default()),
            }),
        })
    }

    pub fn config(&self) -> LimiterConfig {
        self.inner.config
    }

    fn module(&self, name: &str) -> Result<Arc<CountingSemaphore>, LimiterError> {
        let mut modules = lock_unpoisoned(&self.inner.modules);
        if let Some(existing) = modules.get(name) {
            return Ok(Arc::clone(existing));
        }
        let max = self
            .inner
            .module_max
            .get(name)
            .copied()
            .unwrap_or(self.inner.config.default_module_max);
        let created = CountingSemaphore::new(name, max)?;
        modules.insert(name.to_string(), Arc::clone(&created));
        Ok(created)
    }

    pub fn global_state(&self) -> SemaphoreState {
        self.inner.global.state()
    }

    pub fn module_state(&self, name: &str) -> Option<SemaphoreState> {
        lock_unpoisoned(&self.inner.modules)
            .get(name)
            .map(|semaphore| semaphore.state())
    }

    /// Global slot first, then the module slot.
    pub async fn acquire(&self, module: &str) -> Result<LimiterPermit, LimiterError> {
        let module_semaphore = self.module(module)?;
        let global = self.inner.global.acquire().await?;
        let module = module_semaphore.acquire().await?;
        self.record_acquisition(&global, &module);
        Ok(LimiterPermit { module, global })
    }

    pub async fn run<F>(&self, module: &str, operation: F) -> Result<F::Output, LimiterError>
    where
        F: Future,
    {
        self.run_with_timeout(module, self.inner.config.operation_timeout, operation)
            .await
    }

    /// Runs `operation` holding both slots. On timeout the slots are released
    /// before the error is returned.
    pub async fn run_with_timeout<F>(
        &self,
        module: &str,
        timeout: Duration,
        operation: F,
    ) -> Result<F::Output, LimiterError>
    where
        F: Future,
    {
        let permit = self.acquire(module).await?;
        let outcome = tokio::time::timeout(timeout, operation).await;
        drop(permit);
        match outcome {
            Ok(output) => Ok(output),
            Err(_) => {
                lock_unpoisoned(&self.inner.metrics).timeouts += 1;
                tracing::warn!(
                    module,
                    timeout_ms = duration_ms(timeout),
                    "limited operation timed out"
                );
                Err(LimiterError::Timeout {
                    module: module.to_string(),
                    timeout_ms: duration_ms(timeout),
                })
            }
        }
    }

    fn record_acquisition(&self, global: &SemaphorePermit, module: &SemaphorePermit) {
        let waited = global.waited + module.waited;
        let mut metrics = lock_unpoisoned(&self.inner.metrics);
        metrics.acquisitions += 1;
        if global.contended || module.contended {
            metrics.contended += 1;
        }
        metrics.max_queue_depth = metrics
            .max_queue_depth
            .max(global.queue_depth)
            .max(module.queue_depth);
        metrics.total_wait_ms = metrics.total_wait_ms.saturating_add(duration_ms(waited));
        metrics.wait_buckets.record(waited);
    }

    /// Emits and resets the metrics window, but only when contention or a
    /// timeout was observed. Quiet windows are discarded.
    pub fn flush_if_contended(&self) -> Option<LimiterMetricsSnapshot> {
        let snapshot = std::mem::take(&mut *lock_unpoisoned(&self.inner.metrics));
        if snapshot.contended == 0 && snapshot.timeouts == 0 {
            return None;
        }
        tracing::info!(
            acquisitions = snapshot.acquisitions,
            contended = snapshot.contended,
            max_queue_depth = snapshot.max_queue_depth,
            total_wait_ms = snapshot.total_wait_ms,
            lt_10ms = snapshot.wait_buckets.lt_10ms,
            lt_100ms = snapshot.wait_buckets.lt_100ms,
            lt_1s = snapshot.wait_buckets.lt_1s,
            ge_1s = snapshot.wait_buckets.ge_1s,
            timeouts = snapshot.timeouts,
            "limiter_contention"
        );
        Some(snapshot)
    }

    pub fn spawn_metrics_flush(&self, interval: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.flush_if_contended();
            }
        })
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
