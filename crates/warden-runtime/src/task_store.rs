use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;
use warden_core::{current_unix_timestamp_ms, write_json_atomic, DurableStateLock, FileLockConfig};

pub const TASK_RECORD_SCHEMA_VERSION: u32 = 1;
const TASKS_DIR_NAME: &str = "tasks";
const TASKS_LOCK_NAME: &str = "tasks";

#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("task id must not be empty")]
    EmptyTaskId,
    #[error("task '{0}' is already recorded")]
    AlreadyRecorded(String),
    #[error("unsupported task record schema_version {found} (expected {expected})")]
    UnsupportedSchema { found: u32, expected: u32 },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type TaskStoreResult<T> = Result<T, TaskStoreError>;

/// Cached outcome of one task. Failures are cached exactly like successes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub ok: bool,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskResponse {
    pub fn success(body: Value) -> Self {
        Self {
            ok: true,
            body,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            body: Value::Null,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub schema_version: u32,
    pub task_id: String,
    pub created_unix_ms: u64,
    pub response: TaskResponse,
}

/// Write-once key/value store keyed by task id. There is no update or delete.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, task_id: &str) -> TaskStoreResult<Option<TaskRecord>>;
    /// Fails with [`TaskStoreError::AlreadyRecorded`] if `task_id` exists.
    async fn put(&self, task_id: &str, response: TaskResponse) -> TaskStoreResult<TaskRecord>;
}

fn normalized_task_id(task_id: &str) -> TaskStoreResult<&str> {
    let task_id = task_id.trim();
    if task_id.is_empty() {
        return Err(TaskStoreError::EmptyTaskId);
    }
    Ok(task_id)
}

fn new_record(task_id: &str, response: TaskResponse) -> TaskRecord {
    TaskRecord {
        schema_version: TASK_RECORD_SCHEMA_VERSION,
        task_id: task_id.to_string(),
        created_unix_ms: current_unix_timestamp_ms(),
        response,
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    records: RwLock<HashMap<String, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get(&self, task_id: &str) -> TaskStoreResult<Option<TaskRecord>> {
        let task_id = normalized_task_id(task_id)?;
        Ok(self.records.read().await.get(task_id).cloned())
    }

    async fn put(&self, task_id: &str, response: TaskResponse) -> TaskStoreResult<TaskRecord> {
        let task_id = normalized_task_id(task_id)?;
        let mut records = self.records.write().await;
        if records.contains_key(task_id) {
            return Err(TaskStoreError::AlreadyRecorded(task_id.to_string()));
        }
        let record = new_record(task_id, response);
        records.insert(task_id.to_string(), record.clone());
        Ok(record)
    }
}

/// One JSON file per task under `<storage>/tasks`, named by the SHA-256 of
/// the task id. Writes hold the durable state lock.
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    dir: PathBuf,
    lock: DurableStateLock,
}

impl FileTaskStore {
    pub fn for_storage_dir(storage_dir: &Path, lock_config: FileLockConfig) -> Self {
        Self {
            dir: storage_dir.join(TASKS_DIR_NAME),
            lock: DurableStateLock::for_storage_dir(storage_dir, TASKS_LOCK_NAME, lock_config),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, task_id: &str) -> PathBuf {
        let digest = Sha256::digest(task_id.trim().as_bytes());
        self.dir.join(format!("{digest:x}.json"))
    }

    fn read_record(&self, task_id: &str) -> TaskStoreResult<Option<TaskRecord>> {
        let path = self.record_path(task_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let record = serde_json::from_str::<TaskRecord>(&raw)?;
        if record.schema_version != TASK_RECORD_SCHEMA_VERSION {
            return Err(TaskStoreError::UnsupportedSchema {
                found: record.schema_version,
                expected: TASK_RECORD_SCHEMA_VERSION,
            });
        }
        if record.task_id != task_id {
            tracing::warn!(
                path = %path.display(),
                stored = %record.task_id,
                requested = task_id,
                "task record id mismatch; treating as absent"
            );
            return Ok(None);
        }
        Ok(Some(record))
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn get(&self, task_id: &str) -> TaskStoreResult<Option<TaskRecord>> {
        self.read_record(normalized_task_id(task_id)?)
    }

    async fn put(&self, task_id: &str, response: TaskResponse) -> TaskStoreResult<TaskRecord> {
        let task_id = normalized_task_id(task_id)?;
        let _guard = self.lock.acquire().await?;
        if self.read_record(task_id)?.is_some() {
            return Err(TaskStoreError::AlreadyRecorded(task_id.to_string()));
        }
        let record = new_record(task_id, response);
        let path = self.record_path(task_id);
        write_json_atomic(&path, &record)
            .with_context(|| format!("failed to persist task record {}", path.display()))?;
        Ok(record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSubmission {
    pub response: TaskResponse,
    /// `true` when the response came from the store rather than a fresh run.
    pub replayed: bool,
}

/// At-most-once execution per task id on top of a [`TaskStore`].
///
/// Concurrent submissions of one id are serialized in-process, so the
/// generator runs exactly once even when the store is still empty.
#[derive(Clone)]
pub struct IdempotentTasks {
    store: Arc<dyn TaskStore>,
    inflight: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl IdempotentTasks {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub async fn submit_task<F, Fut>(
        &self,
        task_id: &str,
        generate: F,
    ) -> TaskStoreResult<TaskSubmission>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        let task_id = normalized_task_id(task_id)?;
        let key_lock = {
            let mut inflight = lock_unpoisoned(&self.inflight);
            Arc::clone(inflight.entry(task_id.to_string()).or_default())
        };
        let outcome = {
            let _turn = key_lock.lock().await;
            self.submit_locked(task_id, generate).await
        };
        {
            let mut inflight = lock_unpoisoned(&self.inflight);
            // Map entry plus our clone: nobody else is waiting on this id.
            if Arc::strong_count(&key_lock) <= 2 {
                inflight.remove(task_id);
            }
        }
        outcome
    }

    async fn submit_locked<F, Fut>(
        &self,
        task_id: &str,
        generate: F,
    ) -> TaskStoreResult<TaskSubmission>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        if let Some(record) = self.store.get(task_id).await? {
            tracing::debug!(task_id, ok = record.response.ok, "task replayed from store");
            return Ok(TaskSubmission {
                response: record.response,
                replayed: true,
            });
        }
        let response = match generate().await {
            Ok(body) => TaskResponse::success(body),
            Err(error) => {
                tracing::warn!(task_id, error = %format!("{error:#}"), "task failed; caching failure");
                TaskResponse::failure(format!("{error:#}"))
            }
        };
        let record = match self.store.put(task_id, response).await {
            Ok(record) => record,
            // Another process won the race; its record is authoritative.
            Err(TaskStoreError::AlreadyRecorded(_)) => match self.store.get(task_id).await? {
                Some(record) => record,
                None => return Err(TaskStoreError::AlreadyRecorded(task_id.to_string())),
            },
            Err(error) => return Err(error),
        };
        Ok(TaskSubmission {
            response: record.response,
            replayed: false,
        })
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
