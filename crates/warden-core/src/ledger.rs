//! Append-only decision ledger.
//!
//! One JSON object per line under `<storage_dir>/ledger/decisions.jsonl`. Every
//! record carries `record_type` and `timestamp_unix_ms`; redaction and
//! retention are handled downstream.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use crate::log_rotation::{append_line_with_rotation, LogRotationPolicy};
use crate::state_lock::{DurableStateLock, FileLockConfig};
use crate::time_utils::current_unix_timestamp_ms;

pub const LEDGER_DIR_NAME: &str = "ledger";
pub const LEDGER_FILE_NAME: &str = "decisions.jsonl";
const LEDGER_LOCK_NAME: &str = "ledger";

pub fn ledger_path_for_storage_dir(storage_dir: &Path) -> PathBuf {
    storage_dir.join(LEDGER_DIR_NAME).join(LEDGER_FILE_NAME)
}

/// Appends one record to the ledger without taking the durable lock.
///
/// Records must be JSON objects; a missing `timestamp_unix_ms` is stamped here.
pub fn append_ledger(storage_dir: &Path, record: &Value) -> Result<()> {
    append_ledger_with_policy(storage_dir, record, LogRotationPolicy::from_env())
}

pub fn append_ledger_with_policy(
    storage_dir: &Path,
    record: &Value,
    policy: LogRotationPolicy,
) -> Result<()> {
    let stamped = stamp_ledger_record(record)?;
    let line = serde_json::to_string(&stamped).context("failed to encode ledger record")?;
    let path = ledger_path_for_storage_dir(storage_dir);
    append_line_with_rotation(&path, &line, policy)
        .with_context(|| format!("failed to append ledger record to {}", path.display()))
}

/// Reads the active ledger file. Missing file reads as empty.
pub fn read_ledger_records(storage_dir: &Path) -> Result<Vec<Value>> {
    let path = ledger_path_for_storage_dir(storage_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read ledger {}", path.display()))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str::<Value>(line).with_context(|| {
                format!(
                    "failed to parse ledger {} line {}",
                    path.display(),
                    index + 1
                )
            })
        })
        .collect()
}

fn stamp_ledger_record(record: &Value) -> Result<Value> {
    let Some(object) = record.as_object() else {
        bail!("ledger record must be a JSON object");
    };
    let record_type = object
        .get("record_type")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if record_type.is_empty() {
        bail!("ledger record is missing record_type");
    }
    let mut stamped = Map::with_capacity(object.len() + 1);
    if !object.contains_key("timestamp_unix_ms") {
        stamped.insert(
            "timestamp_unix_ms".to_string(),
            Value::from(current_unix_timestamp_ms()),
        );
    }
    for (key, value) in object {
        stamped.insert(key.clone(), value.clone());
    }
    Ok(Value::Object(stamped))
}

/// Ledger writer shared by handlers. Appends hold the durable state lock so
/// several processes can share one storage directory.
#[derive(Debug, Clone)]
pub struct DecisionLedger {
    storage_dir: PathBuf,
    lock: DurableStateLock,
    rotation: LogRotationPolicy,
}

impl DecisionLedger {
    pub fn new(storage_dir: impl Into<PathBuf>, lock_config: FileLockConfig) -> Self {
        let storage_dir = storage_dir.into();
        let lock = DurableStateLock::for_storage_dir(&storage_dir, LEDGER_LOCK_NAME, lock_config);
        Self {
            storage_dir,
            lock,
            rotation: LogRotationPolicy::from_env(),
        }
    }

    pub fn with_rotation(mut self, rotation: LogRotationPolicy) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub async fn append(&self, record: &Value) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        append_ledger_with_policy(&self.storage_dir, record, self.rotation)
    }

    /// Best-effort append used on paths that must not fail because auditing failed.
    pub async fn append_or_warn(&self, record: &Value) {
        if let Err(error) = self.append(record).await {
            tracing::warn!(%error, "failed to append decision ledger record");
        }
    }
}
