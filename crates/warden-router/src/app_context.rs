//! Process-wide routing state, constructed once at startup and passed
//! explicitly to every component that needs it.
//!
//! Lifecycle: [`AppContext::init`] loads policy, allow-list, capability
//! registry, project overrides and the persisted chat caches;
//! [`AppContext::refresh`] reloads whatever changed on disk (content hash);
//! [`AppContext::flush`] persists the chat caches under the durable lock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use warden_access::{
    load_policy_or_fallback, ChatAllowlist, ChatAllowlistStore, LoadedPolicy, PolicyOwner,
    PriorityOrder,
};
use warden_core::{
    current_unix_timestamp_ms, write_json_atomic, DecisionLedger, DurableStateLock,
    FileLockConfig, LogRotationPolicy,
};
use warden_notify::{resolve_target_overrides, NotifyDispatchReport, NotifyRequest, TargetOverrides};
use warden_runtime::{ConcurrencyLimiter, FileTaskStore, IdempotentTasks, LimiterConfig};

use crate::capability_registry::{content_hash, CapabilityRegistry};
use crate::context::{RouteContext, RouteSettings};
use crate::request_id::request_id_for_context;

pub const CONTEXT_STATE_SCHEMA_VERSION: u32 = 1;
const STATE_DIR_NAME: &str = "state";
const CONTEXT_STATE_FILE_NAME: &str = "context.json";
const CONTEXT_STATE_LOCK_NAME: &str = "context";
const RATE_WINDOW_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub storage_dir: PathBuf,
    pub policy_path: Option<PathBuf>,
    pub capability_registry_path: Option<PathBuf>,
    pub project_config_path: Option<PathBuf>,
    pub fallback_owner: PolicyOwner,
    pub priority_order: PriorityOrder,
    pub route: RouteSettings,
    pub limiter: LimiterConfig,
    pub lock: FileLockConfig,
    pub ledger_rotation: LogRotationPolicy,
}

impl AppConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            policy_path: None,
            capability_registry_path: None,
            project_config_path: None,
            fallback_owner: PolicyOwner::default(),
            priority_order: PriorityOrder::default(),
            route: RouteSettings::default(),
            limiter: LimiterConfig::standard(),
            lock: FileLockConfig::default(),
            ledger_rotation: LogRotationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastAlert {
    pub message_id: Option<String>,
    pub text: String,
    pub priority: Option<String>,
    pub recorded_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainTrace {
    pub request_id: String,
    pub capability: String,
    pub target_message_id: Option<String>,
    pub ok: bool,
    pub recorded_unix_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ContextStateFile {
    schema_version: u32,
    #[serde(default)]
    last_alerts: BTreeMap<String, LastAlert>,
    #[serde(default)]
    last_explain: BTreeMap<String, ExplainTrace>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub policy_reloaded: bool,
    pub registry_reloaded: bool,
    pub overrides_reloaded: bool,
    pub allowlist_reloaded: bool,
}

#[derive(Debug, Default)]
struct ChatCaches {
    last_alerts: BTreeMap<String, LastAlert>,
    last_explain: BTreeMap<String, ExplainTrace>,
}

pub struct AppContext {
    config: AppConfig,
    policy: ArcSwap<LoadedPolicy>,
    policy_hash: Mutex<Option<String>>,
    allowlist_store: ChatAllowlistStore,
    allowlist: ArcSwap<ChatAllowlist>,
    registry: Arc<CapabilityRegistry>,
    overrides: ArcSwap<TargetOverrides>,
    overrides_hash: Mutex<Option<String>>,
    ledger: DecisionLedger,
    limiter: ConcurrencyLimiter,
    tasks: IdempotentTasks,
    caches: Mutex<ChatCaches>,
    caches_dirty: AtomicBool,
    rate_windows: Mutex<HashMap<String, VecDeque<u64>>>,
    state_lock: DurableStateLock,
}

impl AppContext {
    pub fn init(config: AppConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.storage_dir).with_context(|| {
            format!("failed to create storage dir {}", config.storage_dir.display())
        })?;
        let (policy, policy_hash) = read_policy(config.policy_path.as_deref(), &config.fallback_owner);
        let allowlist_store = ChatAllowlistStore::for_storage_dir(&config.storage_dir, config.lock);
        let allowlist = allowlist_store.load()?;
        let registry = match &config.capability_registry_path {
            Some(path) => CapabilityRegistry::load_or_empty(path),
            None => CapabilityRegistry::disabled(),
        };
        let (overrides, overrides_hash) =
            match read_project_overrides(config.project_config_path.as_deref(), &config.priority_order) {
                Ok(loaded) => loaded,
                Err(error) => {
                    tracing::warn!(
                        error = %format!("{error:#}"),
                        "project config unusable; starting without notify overrides"
                    );
                    (TargetOverrides::default(), None)
                }
            };
        let ledger = DecisionLedger::new(&config.storage_dir, config.lock)
            .with_rotation(config.ledger_rotation);
        let limiter = ConcurrencyLimiter::new(config.limiter)?;
        let tasks = IdempotentTasks::new(Arc::new(FileTaskStore::for_storage_dir(
            &config.storage_dir,
            config.lock,
        )));
        let state = load_context_state(&context_state_path(&config.storage_dir))?;
        let state_lock = DurableStateLock::for_storage_dir(
            &config.storage_dir,
            CONTEXT_STATE_LOCK_NAME,
            config.lock,
        );
        tracing::info!(
            storage_dir = %config.storage_dir.display(),
            policy_ok = policy.policy_ok,
            allowlisted_chats = allowlist.chat_ids.len(),
            cached_alerts = state.last_alerts.len(),
            "app context initialized"
        );

        Ok(Arc::new(Self {
            policy: ArcSwap::from_pointee(policy),
            policy_hash: Mutex::new(policy_hash),
            allowlist_store,
            allowlist: ArcSwap::from_pointee(allowlist),
            registry: Arc::new(registry),
            overrides: ArcSwap::from_pointee(overrides),
            overrides_hash: Mutex::new(overrides_hash),
            ledger,
            limiter,
            tasks,
            caches: Mutex::new(ChatCaches {
                last_alerts: state.last_alerts,
                last_explain: state.last_explain,
            }),
            caches_dirty: AtomicBool::new(false),
            rate_windows: Mutex::new(HashMap::new()),
            state_lock,
            config,
        }))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn route_settings(&self) -> &RouteSettings {
        &self.config.route
    }

    pub fn priority_order(&self) -> &PriorityOrder {
        &self.config.priority_order
    }

    pub fn policy(&self) -> Arc<LoadedPolicy> {
        self.policy.load_full()
    }

    pub fn allowlist(&self) -> Arc<ChatAllowlist> {
        self.allowlist.load_full()
    }

    pub fn allowlist_store(&self) -> &ChatAllowlistStore {
        &self.allowlist_store
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn notify_overrides(&self) -> Arc<TargetOverrides> {
        self.overrides.load_full()
    }

    pub fn ledger(&self) -> &DecisionLedger {
        &self.ledger
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn tasks(&self) -> &IdempotentTasks {
        &self.tasks
    }

    pub fn build_context(&self, event: crate::context::MessageEvent) -> RouteContext {
        RouteContext::build(event, &self.config.route)
    }

    pub fn request_id_for(&self, ctx: &RouteContext) -> String {
        request_id_for_context(ctx)
    }

    /// Reloads policy, registry, project overrides and allow-list when their
    /// files changed. A broken policy file swaps in the synthetic owner-only
    /// policy (`policy_ok == false`); a broken registry or project config
    /// keeps its previous value.
    pub fn refresh(&self) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();

        if let Some(path) = self.config.policy_path.as_deref() {
            let next_hash = file_hash(path)?;
            let mut current = lock_unpoisoned(&self.policy_hash);
            if *current != next_hash {
                let (policy, hash) = read_policy(Some(path), &self.config.fallback_owner);
                tracing::info!(policy_ok = policy.policy_ok, "policy reloaded");
                self.policy.store(Arc::new(policy));
                *current = hash;
                report.policy_reloaded = true;
            }
        }

        match self.registry.refresh_if_changed() {
            Ok(changed) => report.registry_reloaded = changed,
            Err(error) => tracing::warn!(%error, "capability registry refresh failed"),
        }

        if let Some(path) = self.config.project_config_path.as_deref() {
            let next_hash = file_hash(path)?;
            let mut current = lock_unpoisoned(&self.overrides_hash);
            if *current != next_hash {
                match read_project_overrides(Some(path), &self.config.priority_order) {
                    Ok((overrides, hash)) => {
                        self.overrides.store(Arc::new(overrides));
                        *current = hash;
                        report.overrides_reloaded = true;
                    }
                    Err(error) => tracing::warn!(error = %format!("{error:#}"), "project config refresh failed"),
                }
            }
        }

        let allowlist = self.allowlist_store.load()?;
        if *self.allowlist.load_full() != allowlist {
            self.allowlist.store(Arc::new(allowlist));
            report.allowlist_reloaded = true;
        }
        Ok(report)
    }

    pub async fn add_allowlisted_chat(&self, chat_id: &str) -> Result<bool> {
        let added = self.allowlist_store.add(chat_id).await?;
        self.allowlist.store(Arc::new(self.allowlist_store.load()?));
        Ok(added)
    }

    pub async fn remove_allowlisted_chat(&self, chat_id: &str) -> Result<bool> {
        let removed = self.allowlist_store.remove(chat_id).await?;
        self.allowlist.store(Arc::new(self.allowlist_store.load()?));
        Ok(removed)
    }

    pub fn record_alert(&self, channel: &str, chat_id: &str, alert: LastAlert) {
        lock_unpoisoned(&self.caches)
            .last_alerts
            .insert(chat_key(channel, chat_id), alert);
        self.caches_dirty.store(true, Ordering::SeqCst);
    }

    pub fn last_alert(&self, channel: &str, chat_id: &str) -> Option<LastAlert> {
        lock_unpoisoned(&self.caches)
            .last_alerts
            .get(&chat_key(channel, chat_id))
            .cloned()
    }

    /// Remembers the alert text for every chat it was actually sent to.
    pub fn record_notify_delivery(&self, request: &NotifyRequest, report: &NotifyDispatchReport) {
        let now = current_unix_timestamp_ms();
        for chat_id in &report.sent {
            self.record_alert(
                &report.target,
                chat_id,
                LastAlert {
                    message_id: None,
                    text: request.text.clone(),
                    priority: request.delivery_priority_raw().map(str::to_string),
                    recorded_unix_ms: now,
                },
            );
        }
    }

    pub fn record_explain_trace(&self, channel: &str, chat_id: &str, trace: ExplainTrace) {
        lock_unpoisoned(&self.caches)
            .last_explain
            .insert(chat_key(channel, chat_id), trace);
        self.caches_dirty.store(true, Ordering::SeqCst);
    }

    pub fn last_explain_trace(&self, channel: &str, chat_id: &str) -> Option<ExplainTrace> {
        lock_unpoisoned(&self.caches)
            .last_explain
            .get(&chat_key(channel, chat_id))
            .cloned()
    }

    /// Sliding one-minute window per key. `None` rpm means unlimited.
    pub fn check_rate_limit(&self, key: &str, rpm: Option<u32>) -> bool {
        self.check_rate_limit_at(key, rpm, current_unix_timestamp_ms())
    }

    fn check_rate_limit_at(&self, key: &str, rpm: Option<u32>, now_unix_ms: u64) -> bool {
        let Some(rpm) = rpm else {
            return true;
        };
        let mut windows = lock_unpoisoned(&self.rate_windows);
        let window = windows.entry(key.to_string()).or_default();
        expire_rate_window(window, now_unix_ms);
        if window.len() >= rpm as usize {
            if window.is_empty() {
                windows.remove(key);
            }
            return false;
        }
        window.push_back(now_unix_ms);
        true
    }

    /// Drops rate windows whose every hit has aged out.
    fn sweep_rate_windows_at(&self, now_unix_ms: u64) {
        lock_unpoisoned(&self.rate_windows).retain(|_, window| {
            expire_rate_window(window, now_unix_ms);
            !window.is_empty()
        });
    }

    /// Persists the chat caches when they changed since the last flush.
    pub async fn flush(&self) -> Result<bool> {
        self.sweep_rate_windows_at(current_unix_timestamp_ms());
        if !self.caches_dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let _guard = self.state_lock.acquire().await?;
        let state = {
            let caches = lock_unpoisoned(&self.caches);
            ContextStateFile {
                schema_version: CONTEXT_STATE_SCHEMA_VERSION,
                last_alerts: caches.last_alerts.clone(),
                last_explain: caches.last_explain.clone(),
            }
        };
        let path = context_state_path(&self.config.storage_dir);
        if let Err(error) = write_json_atomic(&path, &state) {
            self.caches_dirty.store(true, Ordering::SeqCst);
            return Err(error)
                .with_context(|| format!("failed to flush context state {}", path.display()));
        }
        tracing::debug!(path = %path.display(), "context state flushed");
        Ok(true)
    }
}

fn expire_rate_window(window: &mut VecDeque<u64>, now_unix_ms: u64) {
    while window
        .front()
        .is_some_and(|stamp| now_unix_ms.saturating_sub(*stamp) >= RATE_WINDOW_MS)
    {
        window.pop_front();
    }
}

pub fn chat_key(channel: &str, chat_id: &str) -> String {
    format!("{}:{}", channel.trim(), chat_id.trim())
}

pub fn context_state_path(storage_dir: &Path) -> PathBuf {
    storage_dir
        .join(STATE_DIR_NAME)
        .join(CONTEXT_STATE_FILE_NAME)
}

fn load_context_state(path: &Path) -> Result<ContextStateFile> {
    if !path.exists() {
        return Ok(ContextStateFile {
            schema_version: CONTEXT_STATE_SCHEMA_VERSION,
            ..ContextStateFile::default()
        });
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read context state {}", path.display()))?;
    let parsed = serde_json::from_str::<ContextStateFile>(&raw)
        .with_context(|| format!("failed to parse context state {}", path.display()))?;
    if parsed.schema_version != CONTEXT_STATE_SCHEMA_VERSION {
        bail!(
            "unsupported context state schema_version {} in {} (expected {})",
            parsed.schema_version,
            path.display(),
            CONTEXT_STATE_SCHEMA_VERSION
        );
    }
    Ok(parsed)
}

fn file_hash(path: &Path) -> Result<Option<String>> {
    match std::fs::read(path) {
        Ok(raw) => Ok(Some(content_hash(&raw))),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => {
            Err(error).with_context(|| format!("failed to read {}", path.display()))
        }
    }
}

fn read_policy(path: Option<&Path>, fallback_owner: &PolicyOwner) -> (LoadedPolicy, Option<String>) {
    let Some(path) = path else {
        return (load_policy_or_fallback(None, fallback_owner), None);
    };
    match std::fs::read(path) {
        Ok(raw) => {
            let hash = content_hash(&raw);
            let text = String::from_utf8_lossy(&raw);
            (load_policy_or_fallback(Some(&text), fallback_owner), Some(hash))
        }
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to read policy file");
            (load_policy_or_fallback(None, fallback_owner), None)
        }
    }
}

fn read_project_overrides(
    path: Option<&Path>,
    order: &PriorityOrder,
) -> Result<(TargetOverrides, Option<String>)> {
    let Some(path) = path else {
        return Ok((TargetOverrides::default(), None));
    };
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok((TargetOverrides::default(), None))
        }
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read project config {}", path.display()))
        }
    };
    let value = serde_json::from_slice::<Value>(&raw)
        .with_context(|| format!("failed to parse project config {}", path.display()))?;
    Ok((resolve_target_overrides(&value, order), Some(content_hash(&raw))))
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use warden_access::PolicyOwner;

    use super::{chat_key, AppConfig, AppContext, ExplainTrace, LastAlert};

    fn alert(text: &str) -> LastAlert {
        LastAlert {
            message_id: Some("77".to_string()),
            text: text.to_string(),
            priority: Some("high".to_string()),
            recorded_unix_ms: 1,
        }
    }

    #[tokio::test]
    async fn functional_init_without_policy_falls_back_and_flush_persists_caches() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::new(temp.path());
        config.fallback_owner = PolicyOwner {
            user_id: Some("1001".to_string()),
            private_chat_id: None,
        };
        let app = AppContext::init(config.clone()).expect("init");
        assert!(!app.policy().policy_ok);
        assert!(!app.flush().await.expect("flush clean"));

        app.record_alert("telegram", "1001", alert("cpu 95%"));
        app.record_explain_trace(
            "telegram",
            "1001",
            ExplainTrace {
                request_id: "req-1".to_string(),
                capability: "alerts.explain".to_string(),
                target_message_id: Some("77".to_string()),
                ok: true,
                recorded_unix_ms: 2,
            },
        );
        assert!(app.flush().await.expect("flush"));
        assert!(!app.flush().await.expect("flush again"));

        let reloaded = AppContext::init(config).expect("re-init");
        assert_eq!(
            reloaded.last_alert("telegram", "1001").map(|alert| alert.text),
            Some("cpu 95%".to_string())
        );
        assert!(reloaded.last_explain_trace("telegram", "1001").is_some());
        assert_eq!(chat_key(" telegram", "1001 "), "telegram:1001");
    }

    #[tokio::test]
    async fn integration_refresh_detects_policy_overrides_and_allowlist_changes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let policy_path = temp.path().join("policy.json");
        let project_path = temp.path().join("project.json");
        std::fs::write(&policy_path, json!({"version": 1}).to_string()).expect("write");
        let mut config = AppConfig::new(temp.path().join("storage"));
        config.policy_path = Some(policy_path.clone());
        config.project_config_path = Some(project_path.clone());
        let app = AppContext::init(config).expect("init");
        assert!(app.policy().policy_ok);

        let report = app.refresh().expect("refresh");
        assert!(!report.policy_reloaded);

        std::fs::write(&policy_path, "{broken").expect("write");
        std::fs::write(
            &project_path,
            json!({"notify": {"min_priority_by_target": {"telegram": {"1": "high"}}}}).to_string(),
        )
        .expect("write");
        assert!(app.add_allowlisted_chat("555").await.expect("add"));
        let report = app.refresh().expect("refresh");
        assert!(report.policy_reloaded);
        assert!(report.overrides_reloaded);
        assert!(!app.policy().policy_ok);
        assert!(app.notify_overrides().get("telegram", "1").is_some());
        assert!(app.allowlist().contains("555"));
    }

    #[test]
    fn unit_rate_limit_window_slides() {
        let temp = tempfile::tempdir().expect("tempdir");
        let app = AppContext::init(AppConfig::new(temp.path())).expect("init");
        assert!(app.check_rate_limit_at("k", Some(2), 1_000));
        assert!(app.check_rate_limit_at("k", Some(2), 2_000));
        assert!(!app.check_rate_limit_at("k", Some(2), 3_000));
        assert!(app.check_rate_limit_at("k", Some(2), 61_000));
        assert!(app.check_rate_limit_at("other", None, 3_000));
    }

    #[test]
    fn regression_idle_rate_windows_are_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let app = AppContext::init(AppConfig::new(temp.path())).expect("init");
        assert!(!app.check_rate_limit_at("muted", Some(0), 1_000));
        assert!(app.check_rate_limit_at("a", Some(5), 1_000));
        assert!(app.check_rate_limit_at("b", Some(5), 30_000));
        assert_eq!(app.rate_windows.lock().expect("windows").len(), 2);

        app.sweep_rate_windows_at(62_000);
        let windows = app.rate_windows.lock().expect("windows");
        assert_eq!(windows.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[tokio::test]
    async fn regression_malformed_registry_and_project_config_do_not_abort_init() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry_path = temp.path().join("capabilities.json");
        let project_path = temp.path().join("project.json");
        std::fs::write(&registry_path, "{not json").expect("write");
        std::fs::write(&project_path, "{1: 2}").expect("write");
        let mut config = AppConfig::new(temp.path().join("storage"));
        config.capability_registry_path = Some(registry_path.clone());
        config.project_config_path = Some(project_path.clone());

        let app = AppContext::init(config).expect("init survives broken sources");
        assert!(app.registry().snapshot().is_intent_enabled("dashboard_export"));
        assert!(app.notify_overrides().get("telegram", "1").is_none());

        std::fs::write(
            &registry_path,
            json!({"version": 1, "intents": {"dashboard_export": {"enabled": false}}}).to_string(),
        )
        .expect("write");
        std::fs::write(
            &project_path,
            json!({"notify": {"min_priority_by_target": {"telegram": {"1": "high"}}}}).to_string(),
        )
        .expect("write");
        let report = app.refresh().expect("refresh");
        assert!(report.registry_reloaded);
        assert!(report.overrides_reloaded);
        assert!(!app.registry().snapshot().is_intent_enabled("dashboard_export"));
        assert!(app.notify_overrides().get("telegram", "1").is_some());
    }
}
