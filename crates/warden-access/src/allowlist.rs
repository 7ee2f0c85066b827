use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use warden_core::{write_text_atomic, DurableStateLock, FileLockConfig};

pub const ALLOWLIST_SCHEMA_VERSION: u32 = 1;
const SECURITY_DIR_NAME: &str = "security";
const ALLOWLIST_FILE_NAME: &str = "allowlist.json";
const ALLOWLIST_LOCK_NAME: &str = "allowlist";

pub fn allowlist_path_for_storage_dir(storage_dir: &Path) -> PathBuf {
    storage_dir
        .join(SECURITY_DIR_NAME)
        .join(ALLOWLIST_FILE_NAME)
}

/// Chat ids the owner has explicitly admitted to private-chat features.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatAllowlist {
    pub schema_version: u32,
    #[serde(default)]
    pub chat_ids: BTreeSet<String>,
}

impl Default for ChatAllowlist {
    fn default() -> Self {
        Self {
            schema_version: ALLOWLIST_SCHEMA_VERSION,
            chat_ids: BTreeSet::new(),
        }
    }
}

impl ChatAllowlist {
    pub fn contains(&self, chat_id: &str) -> bool {
        let chat_id = chat_id.trim();
        !chat_id.is_empty() && self.chat_ids.contains(chat_id)
    }

    /// Returns `true` when the id was not already present.
    pub fn insert(&mut self, chat_id: &str) -> bool {
        let chat_id = chat_id.trim();
        if chat_id.is_empty() {
            return false;
        }
        self.chat_ids.insert(chat_id.to_string())
    }

    pub fn remove(&mut self, chat_id: &str) -> bool {
        self.chat_ids.remove(chat_id.trim())
    }

    /// Union with policy-declared ids; used by the private explain branch.
    pub fn merged_with<'a>(&self, extra: impl IntoIterator<Item = &'a String>) -> ChatAllowlist {
        let mut merged = self.clone();
        for chat_id in extra {
            merged.insert(chat_id);
        }
        merged
    }
}

pub fn load_chat_allowlist(path: &Path) -> Result<ChatAllowlist> {
    if !path.exists() {
        return Ok(ChatAllowlist::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read chat allowlist {}", path.display()))?;
    let parsed = serde_json::from_str::<ChatAllowlist>(&raw)
        .with_context(|| format!("failed to parse chat allowlist {}", path.display()))?;
    if parsed.schema_version != ALLOWLIST_SCHEMA_VERSION {
        bail!(
            "unsupported chat allowlist schema_version {} in {} (expected {})",
            parsed.schema_version,
            path.display(),
            ALLOWLIST_SCHEMA_VERSION
        );
    }
    Ok(parsed)
}

pub fn save_chat_allowlist(path: &Path, allowlist: &ChatAllowlist) -> Result<()> {
    let mut payload =
        serde_json::to_string_pretty(allowlist).context("failed to encode chat allowlist")?;
    payload.push('\n');
    write_text_atomic(path, &payload)
        .with_context(|| format!("failed to write chat allowlist {}", path.display()))
}

/// File-backed allow-list whose mutations hold the durable state lock.
#[derive(Debug, Clone)]
pub struct ChatAllowlistStore {
    path: PathBuf,
    lock: DurableStateLock,
}

impl ChatAllowlistStore {
    pub fn for_storage_dir(storage_dir: &Path, lock_config: FileLockConfig) -> Self {
        Self {
            path: allowlist_path_for_storage_dir(storage_dir),
            lock: DurableStateLock::for_storage_dir(storage_dir, ALLOWLIST_LOCK_NAME, lock_config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ChatAllowlist> {
        load_chat_allowlist(&self.path)
    }

    /// Read-modify-write under both lock layers. Saves only when `mutate`
    /// reports a change.
    pub async fn update<F>(&self, mutate: F) -> Result<(ChatAllowlist, bool)>
    where
        F: FnOnce(&mut ChatAllowlist) -> bool,
    {
        let _guard = self.lock.acquire().await?;
        let mut allowlist = load_chat_allowlist(&self.path)?;
        let changed = mutate(&mut allowlist);
        if changed {
            save_chat_allowlist(&self.path, &allowlist)?;
            tracing::info!(
                path = %self.path.display(),
                entries = allowlist.chat_ids.len(),
                "chat allowlist updated"
            );
        }
        Ok((allowlist, changed))
    }

    pub async fn add(&self, chat_id: &str) -> Result<bool> {
        let chat_id = chat_id.to_string();
        Ok(self.update(|list| list.insert(&chat_id)).await?.1)
    }

    pub async fn remove(&self, chat_id: &str) -> Result<bool> {
        let chat_id = chat_id.to_string();
        Ok(self.update(|list| list.remove(&chat_id)).await?.1)
    }
}

#[cfg(test)]
mod tests {
    use warden_core::FileLockConfig;

    use super::{
        allowlist_path_for_storage_dir, load_chat_allowlist, save_chat_allowlist, ChatAllowlist,
        ChatAllowlistStore,
    };

    #[test]
    fn unit_missing_allowlist_loads_empty_and_blank_ids_never_match() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded =
            load_chat_allowlist(&allowlist_path_for_storage_dir(temp.path())).expect("load");
        assert!(loaded.chat_ids.is_empty());
        assert!(!loaded.contains(""));
    }

    #[test]
    fn regression_allowlist_rejects_unknown_schema_version() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("allowlist.json");
        std::fs::write(&path, r#"{"schema_version": 7, "chat_ids": []}"#).expect("write");
        let error = load_chat_allowlist(&path).expect_err("schema mismatch");
        assert!(error.to_string().contains("unsupported chat allowlist schema_version"));
    }

    #[test]
    fn functional_save_and_merge_preserve_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("security").join("allowlist.json");
        let mut allowlist = ChatAllowlist::default();
        assert!(allowlist.insert(" 555 "));
        assert!(!allowlist.insert("555"));
        save_chat_allowlist(&path, &allowlist).expect("save");
        let loaded = load_chat_allowlist(&path).expect("load");
        assert!(loaded.contains("555"));

        let extra = vec!["-100".to_string()];
        let merged = loaded.merged_with(&extra);
        assert!(merged.contains("-100"));
        assert!(!loaded.contains("-100"));
    }

    #[tokio::test]
    async fn integration_store_add_and_remove_persist_under_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ChatAllowlistStore::for_storage_dir(temp.path(), FileLockConfig::default());
        assert!(store.add("777").await.expect("add"));
        assert!(!store.add("777").await.expect("re-add"));
        assert!(store.load().expect("load").contains("777"));
        assert!(store.remove("777").await.expect("remove"));
        assert!(!store.load().expect("load").contains("777"));
        assert!(!temp.path().join("locks").join("allowlist.lock").exists());
    }
}
