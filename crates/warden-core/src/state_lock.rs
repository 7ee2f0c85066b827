//! Locks guarding shared durable state.
//!
//! Two primitives with distinct sharing scopes:
//! - [`InProcessQueue`]: FIFO async mutex serializing writers inside one process.
//! - [`FileLock`]: advisory lock file shared between processes using the same
//!   storage directory. A lock file older than its TTL is treated as abandoned
//!   and may be stolen.
//!
//! Any read-modify-write of durable state must hold both, which is what
//! [`DurableStateLock`] hands out.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::time_utils::{current_unix_timestamp_ms, is_stale_unix_ms};

const DEFAULT_FILE_LOCK_TTL_MS: u64 = 30_000;
const DEFAULT_FILE_LOCK_RETRY_MS: u64 = 25;
const DEFAULT_FILE_LOCK_ACQUIRE_TIMEOUT_MS: u64 = 10_000;

static LOCK_TOKEN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// In-process FIFO queue. Waiters are admitted in arrival order.
#[derive(Debug, Clone, Default)]
pub struct InProcessQueue {
    inner: Arc<Mutex<()>>,
}

impl InProcessQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enter(&self) -> InProcessTurn {
        InProcessTurn {
            _guard: Arc::clone(&self.inner).lock_owned().await,
        }
    }
}

/// Held while the caller owns its turn in an [`InProcessQueue`].
#[derive(Debug)]
pub struct InProcessTurn {
    _guard: OwnedMutexGuard<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLockConfig {
    pub ttl: Duration,
    pub retry_interval: Duration,
    pub acquire_timeout: Duration,
}

impl Default for FileLockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(DEFAULT_FILE_LOCK_TTL_MS),
            retry_interval: Duration::from_millis(DEFAULT_FILE_LOCK_RETRY_MS),
            acquire_timeout: Duration::from_millis(DEFAULT_FILE_LOCK_ACQUIRE_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct FileLockOwner {
    pid: u32,
    token: String,
    acquired_unix_ms: u64,
}

/// Cross-process advisory lock backed by an exclusively created file.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    config: FileLockConfig,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, config: FileLockConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn acquire(&self) -> Result<FileLockGuard> {
        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            if self.steal_if_stale()? {
                continue;
            }
            if started.elapsed() >= self.config.acquire_timeout {
                bail!(
                    "timed out after {}ms waiting for state lock {}",
                    self.config.acquire_timeout.as_millis(),
                    self.path.display()
                );
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// Attempts one exclusive create; `Ok(None)` when another owner holds the lock.
    pub fn try_acquire(&self) -> Result<Option<FileLockGuard>> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to create lock {}", self.path.display()))
            }
        };
        let owner = FileLockOwner {
            pid: std::process::id(),
            token: format!(
                "{}-{}",
                std::process::id(),
                LOCK_TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed)
            ),
            acquired_unix_ms: current_unix_timestamp_ms(),
        };
        let payload = serde_json::to_string(&owner).context("failed to encode lock owner")?;
        file.write_all(payload.as_bytes())
            .and_then(|_| file.flush())
            .with_context(|| format!("failed to write lock {}", self.path.display()))?;
        Ok(Some(FileLockGuard {
            path: self.path.clone(),
            token: owner.token,
        }))
    }

    fn steal_if_stale(&self) -> Result<bool> {
        let Some((observed, acquired_unix_ms)) = self.read_lock_file()? else {
            return Ok(false);
        };
        let ttl_ms = u64::try_from(self.config.ttl.as_millis()).unwrap_or(u64::MAX);
        if !is_stale_unix_ms(acquired_unix_ms, ttl_ms, current_unix_timestamp_ms()) {
            return Ok(false);
        }
        tracing::warn!(
            lock = %self.path.display(),
            acquired_unix_ms,
            ttl_ms,
            "stealing abandoned state lock"
        );
        self.steal_observed(&observed)
    }

    /// Moves the lock file aside and keeps it removed only when it still holds
    /// `observed`. A lock re-acquired since it was judged stale is put back.
    fn steal_observed(&self, observed: &str) -> Result<bool> {
        let mut aside = self.path.as_os_str().to_owned();
        aside.push(format!(
            ".stale-{}-{}",
            std::process::id(),
            LOCK_TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let aside = PathBuf::from(aside);
        match std::fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to move stale lock {}", self.path.display()))
            }
        }
        let moved = std::fs::read_to_string(&aside).unwrap_or_default();
        let stolen = moved == observed;
        if !stolen {
            match std::fs::hard_link(&aside, &self.path) {
                Ok(()) => {}
                Err(error) => tracing::warn!(
                    lock = %self.path.display(),
                    %error,
                    "failed to restore state lock re-acquired during steal"
                ),
            }
        }
        if let Err(error) = std::fs::remove_file(&aside) {
            tracing::warn!(path = %aside.display(), %error, "failed to remove moved lock file");
        }
        Ok(stolen)
    }

    fn read_lock_file(&self) -> Result<Option<(String, u64)>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read lock {}", self.path.display()))
            }
        };
        if let Ok(owner) = serde_json::from_str::<FileLockOwner>(&raw) {
            return Ok(Some((raw, owner.acquired_unix_ms)));
        }
        // Half-written or foreign lock file: age it by mtime.
        let modified = std::fs::metadata(&self.path)
            .and_then(|metadata| metadata.modified())
            .ok()
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        Ok(modified.map(|acquired| (raw, acquired)))
    }
}

/// Removes the lock file on drop when it still belongs to this holder.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
    token: String,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let still_ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str::<FileLockOwner>(&raw).ok())
            .map(|owner| owner.token == self.token)
            .unwrap_or(false);
        if still_ours {
            if let Err(error) = std::fs::remove_file(&self.path) {
                tracing::warn!(lock = %self.path.display(), %error, "failed to release state lock");
            }
        }
    }
}

/// Both lock layers for one piece of durable state. Clones share the in-process queue.
#[derive(Debug, Clone)]
pub struct DurableStateLock {
    queue: InProcessQueue,
    file_lock: FileLock,
}

impl DurableStateLock {
    pub fn new(lock_path: impl Into<PathBuf>, config: FileLockConfig) -> Self {
        Self {
            queue: InProcessQueue::new(),
            file_lock: FileLock::new(lock_path, config),
        }
    }

    /// Lock file named `<name>.lock` under `<storage_dir>/locks`.
    pub fn for_storage_dir(storage_dir: &Path, name: &str, config: FileLockConfig) -> Self {
        Self::new(
            storage_dir.join("locks").join(format!("{name}.lock")),
            config,
        )
    }

    pub fn lock_path(&self) -> &Path {
        self.file_lock.path()
    }

    /// Takes the in-process turn first, then the file lock.
    pub async fn acquire(&self) -> Result<DurableStateGuard> {
        let turn = self.queue.enter().await;
        let file = self.file_lock.acquire().await?;
        Ok(DurableStateGuard {
            _file: file,
            _turn: turn,
        })
    }
}

/// Fields drop in declaration order: the file lock is released before the queue turn.
#[derive(Debug)]
pub struct DurableStateGuard {
    _file: FileLockGuard,
    _turn: InProcessTurn,
}
