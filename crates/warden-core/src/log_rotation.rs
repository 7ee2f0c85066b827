use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const DEFAULT_LEDGER_ROTATION_MAX_BYTES: u64 = 16 * 1024 * 1024;
const DEFAULT_LEDGER_ROTATION_MAX_FILES: usize = 5;
pub const LEDGER_ROTATION_MAX_BYTES_ENV: &str = "WARDEN_LEDGER_ROTATION_MAX_BYTES";
pub const LEDGER_ROTATION_MAX_FILES_ENV: &str = "WARDEN_LEDGER_ROTATION_MAX_FILES";

/// Size-based rotation settings for append-only NDJSON files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_LEDGER_ROTATION_MAX_BYTES,
            max_files: DEFAULT_LEDGER_ROTATION_MAX_FILES,
        }
    }
}

impl LogRotationPolicy {
    /// Reads the policy from the process environment, keeping defaults for invalid values.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let max_bytes = lookup(LEDGER_ROTATION_MAX_BYTES_ENV)
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.max_bytes);
        let max_files = lookup(LEDGER_ROTATION_MAX_FILES_ENV)
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.max_files);
        Self {
            max_bytes,
            max_files,
        }
    }

    pub fn is_enabled(self) -> bool {
        self.max_bytes > 0 && self.max_files > 0
    }
}

/// Appends one NDJSON line to `path`, rotating first when the line would overflow `max_bytes`.
pub fn append_line_with_rotation(path: &Path, line: &str, policy: LogRotationPolicy) -> Result<()> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if policy.is_enabled() && path.exists() {
        let current_size = std::fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        let incoming_size = u64::try_from(line.len().saturating_add(1)).unwrap_or(u64::MAX);
        if current_size.saturating_add(incoming_size) > policy.max_bytes {
            rotate_log_file(path, policy)?;
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

pub fn rotated_backup_path(path: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), index))
}

fn rotate_log_file(path: &Path, policy: LogRotationPolicy) -> Result<()> {
    if policy.max_files <= 1 {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to truncate {}", path.display()))?;
        return Ok(());
    }

    // Shift `.N-1` to `.N` from the oldest slot down; the oldest backup is overwritten.
    let oldest = policy.max_files.saturating_sub(1);
    for index in (1..=oldest).rev() {
        let source = match index {
            1 => path.to_path_buf(),
            _ => rotated_backup_path(path, index - 1),
        };
        if !source.exists() {
            continue;
        }
        let destination = rotated_backup_path(path, index);
        if destination.exists() {
            std::fs::remove_file(&destination).with_context(|| {
                format!("failed to replace rotated ledger {}", destination.display())
            })?;
        }
        std::fs::rename(&source, &destination).with_context(|| {
            format!(
                "failed to rotate {} to {}",
                source.display(),
                destination.display()
            )
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{
        append_line_with_rotation, rotated_backup_path, LogRotationPolicy,
        LEDGER_ROTATION_MAX_BYTES_ENV, LEDGER_ROTATION_MAX_FILES_ENV,
    };

    fn read(path: &std::path::Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn functional_append_rotates_when_size_threshold_exceeded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("decisions.jsonl");
        let policy = LogRotationPolicy {
            max_bytes: 24,
            max_files: 3,
        };

        append_line_with_rotation(&path, r#"{"seq":1,"kind":"first"}"#, policy)
            .expect("append first");
        append_line_with_rotation(&path, r#"{"seq":2,"kind":"second"}"#, policy)
            .expect("append second");

        let backup = rotated_backup_path(&path, 1);
        assert!(read(&backup).contains("\"seq\":1"));
        assert!(read(&path).contains("\"seq\":2"));
    }

    #[test]
    fn regression_rotation_never_keeps_more_than_max_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("decisions.jsonl");
        let policy = LogRotationPolicy {
            max_bytes: 18,
            max_files: 2,
        };
        for seq in 1..=6 {
            append_line_with_rotation(&path, &format!(r#"{{"seq":{seq}}}"#), policy)
                .expect("append line");
        }
        assert!(rotated_backup_path(&path, 1).exists());
        assert!(!rotated_backup_path(&path, 2).exists());
    }

    #[test]
    fn unit_policy_from_lookup_falls_back_on_invalid_values() {
        let env = BTreeMap::from([
            (LEDGER_ROTATION_MAX_BYTES_ENV, "4096"),
            (LEDGER_ROTATION_MAX_FILES_ENV, "0"),
        ]);
        let parsed =
            LogRotationPolicy::from_lookup(|name| env.get(name).map(|value| value.to_string()));
        assert_eq!(parsed.max_bytes, 4096);
        assert_eq!(parsed.max_files, LogRotationPolicy::default().max_files);
    }
}
