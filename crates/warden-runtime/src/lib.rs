//! Runtime primitives consumed by handlers on both the inbound and outbound
//! paths: the two-level concurrency limiter and the idempotent task store.

pub mod limiter;
pub mod task_store;

pub use limiter::{
    ConcurrencyLimiter, CountingSemaphore, LimiterConfig, LimiterError, LimiterMetricsSnapshot,
    LimiterPermit, SemaphorePermit, SemaphoreState, WaitBuckets, GLOBAL_SEMAPHORE_NAME,
};
pub use task_store::{
    FileTaskStore, IdempotentTasks, InMemoryTaskStore, TaskRecord, TaskResponse, TaskStore,
    TaskStoreError, TaskStoreResult, TaskSubmission, TASK_RECORD_SCHEMA_VERSION,
};
