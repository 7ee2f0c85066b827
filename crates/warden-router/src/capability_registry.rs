//! Hot-reloaded intent toggles.
//!
//! File shape: `{version, intents: {<name>: {enabled, panel_id_allowlist[]}}}`.
//! The snapshot is swapped atomically; readers never block the poller. A
//! SHA-256 of the file content decides whether a reload is a real change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::task::JoinHandle;
use warden_core::current_unix_timestamp_ms;

pub const CAPABILITY_REGISTRY_VERSION: u32 = 1;
pub const INTENT_ALERT_STRATEGY: &str = "alert_strategy";
pub const INTENT_ALERT_QUERY: &str = "alert_query";
pub const INTENT_DASHBOARD_EXPORT: &str = "dashboard_export";

fn default_true() -> bool {
    true
}

fn registry_version() -> u32 {
    CAPABILITY_REGISTRY_VERSION
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentToggle {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub panel_id_allowlist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRegistryDocument {
    #[serde(default = "registry_version")]
    pub version: u32,
    #[serde(default)]
    pub intents: BTreeMap<String, IntentToggle>,
}

impl Default for CapabilityRegistryDocument {
    fn default() -> Self {
        Self {
            version: CAPABILITY_REGISTRY_VERSION,
            intents: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CapabilityRegistryError {
    #[error("failed to read capability registry {path}: {error}")]
    Read { path: PathBuf, error: std::io::Error },
    #[error("failed to parse capability registry {path}: {error}")]
    Parse {
        path: PathBuf,
        error: serde_json::Error,
    },
    #[error("unsupported capability registry version {found} in {path} (expected {expected})")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub document: CapabilityRegistryDocument,
    /// Empty when no registry file exists.
    pub content_hash: String,
    pub loaded_unix_ms: u64,
}

impl CapabilitySnapshot {
    fn empty() -> Self {
        Self {
            document: CapabilityRegistryDocument::default(),
            content_hash: String::new(),
            loaded_unix_ms: current_unix_timestamp_ms(),
        }
    }

    /// Intents absent from the registry are enabled.
    pub fn is_intent_enabled(&self, intent: &str) -> bool {
        self.document
            .intents
            .get(intent)
            .map(|toggle| toggle.enabled)
            .unwrap_or(true)
    }

    /// An empty allow-list admits every panel.
    pub fn is_panel_allowed(&self, intent: &str, panel_id: &str) -> bool {
        let Some(toggle) = self.document.intents.get(intent) else {
            return true;
        };
        toggle.panel_id_allowlist.is_empty()
            || toggle
                .panel_id_allowlist
                .iter()
                .any(|allowed| allowed.trim() == panel_id.trim())
    }
}

#[derive(Debug)]
pub struct CapabilityRegistry {
    path: Option<PathBuf>,
    snapshot: ArcSwap<CapabilitySnapshot>,
}

impl CapabilityRegistry {
    /// Registry with no backing file: every intent enabled.
    pub fn disabled() -> Self {
        Self {
            path: None,
            snapshot: ArcSwap::from_pointee(CapabilitySnapshot::empty()),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CapabilityRegistryError> {
        let path = path.into();
        let snapshot = read_snapshot(&path)?;
        Ok(Self {
            path: Some(path),
            snapshot: ArcSwap::from_pointee(snapshot),
        })
    }

    /// Like [`CapabilityRegistry::load`], but an unreadable or invalid file
    /// starts from an empty snapshot. The path is kept, so the next refresh
    /// picks up a repaired file.
    pub fn load_or_empty(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let snapshot = match read_snapshot(&path) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(%error, "capability registry unusable; all intents enabled until it is fixed");
                CapabilitySnapshot::empty()
            }
        };
        Self {
            path: Some(path),
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> Arc<CapabilitySnapshot> {
        self.snapshot.load_full()
    }

    /// Re-reads the file and swaps the snapshot when the content hash moved.
    /// A file that fails to parse leaves the previous snapshot in place.
    pub fn refresh_if_changed(&self) -> Result<bool, CapabilityRegistryError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let next = read_snapshot(path)?;
        if next.content_hash == self.snapshot.load().content_hash {
            return Ok(false);
        }
        tracing::info!(
            path = %path.display(),
            content_hash = %next.content_hash,
            intents = next.document.intents.len(),
            "capability registry reloaded"
        );
        self.snapshot.store(Arc::new(next));
        Ok(true)
    }

    pub fn spawn_polling(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(error) = registry.refresh_if_changed() {
                    tracing::warn!(%error, "capability registry refresh failed; keeping last snapshot");
                }
            }
        })
    }
}

pub fn content_hash(raw: &[u8]) -> String {
    format!("{:x}", Sha256::digest(raw))
}

fn read_snapshot(path: &Path) -> Result<CapabilitySnapshot, CapabilityRegistryError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "capability registry missing; all intents enabled");
            return Ok(CapabilitySnapshot::empty());
        }
        Err(error) => {
            return Err(CapabilityRegistryError::Read {
                path: path.to_path_buf(),
                error,
            })
        }
    };
    let document = serde_json::from_slice::<CapabilityRegistryDocument>(&raw).map_err(|error| {
        CapabilityRegistryError::Parse {
            path: path.to_path_buf(),
            error,
        }
    })?;
    if document.version != CAPABILITY_REGISTRY_VERSION {
        return Err(CapabilityRegistryError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: document.version,
            expected: CAPABILITY_REGISTRY_VERSION,
        });
    }
    Ok(CapabilitySnapshot {
        document,
        content_hash: content_hash(&raw),
        loaded_unix_ms: current_unix_timestamp_ms(),
    })
}
