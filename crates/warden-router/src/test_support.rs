use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use warden_access::PolicyOwner;

use crate::app_context::{AppConfig, AppContext};
use crate::context::{MessageEvent, RouteContext};
use crate::services::{HandlerRequest, IntentHandler, Replier};

pub(crate) const BOT_USERNAME: &str = "wardenbot";

pub(crate) fn app_with_policy(policy: Value) -> (TempDir, Arc<AppContext>) {
    let temp = tempfile::tempdir().expect("tempdir");
    let policy_path = temp.path().join("policy.json");
    std::fs::write(&policy_path, policy.to_string()).expect("write policy");
    let mut config = AppConfig::new(temp.path().join("storage"));
    config.policy_path = Some(policy_path);
    config.capability_registry_path = Some(temp.path().join("capabilities.json"));
    config.fallback_owner = PolicyOwner {
        user_id: Some("1001".to_string()),
        private_chat_id: None,
    };
    config.route.bot_usernames = vec![BOT_USERNAME.to_string()];
    config.route.default_project_id = Some("alpha".to_string());
    config.route.default_window_spec_id = Some("alpha-7d".to_string());
    let app = AppContext::init(config).expect("init app");
    (temp, app)
}

pub(crate) fn private_event(user_id: &str, text: &str) -> MessageEvent {
    MessageEvent {
        channel: "telegram".to_string(),
        chat_id: user_id.to_string(),
        chat_type: "private".to_string(),
        user_id: user_id.to_string(),
        message_id: Some("10".to_string()),
        text: text.to_string(),
        ..MessageEvent::default()
    }
}

pub(crate) fn group_event(chat_id: &str, user_id: &str, text: &str, mentioned: bool) -> MessageEvent {
    MessageEvent {
        channel: "telegram".to_string(),
        chat_id: chat_id.to_string(),
        chat_type: "supergroup".to_string(),
        user_id: user_id.to_string(),
        message_id: Some("20".to_string()),
        text: text.to_string(),
        mentions_bot: mentioned,
        ..MessageEvent::default()
    }
}

#[derive(Default)]
pub(crate) struct RecordingReplier {
    texts: Mutex<Vec<String>>,
}

impl RecordingReplier {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.texts.lock().expect("texts").clone()
    }
}

#[async_trait]
impl Replier for RecordingReplier {
    async fn reply(&self, _ctx: &RouteContext, text: &str) -> Result<()> {
        self.texts.lock().expect("texts").push(text.to_string());
        Ok(())
    }
}

pub(crate) struct ScriptedHandler {
    pub(crate) calls: AtomicUsize,
    pub(crate) requests: Mutex<Vec<HandlerRequest>>,
    outcome: std::result::Result<Value, String>,
}

impl ScriptedHandler {
    pub(crate) fn ok(body: Value) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            outcome: Ok(body),
        })
    }

    pub(crate) fn failing(error: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            outcome: Err(error.to_string()),
        })
    }

    pub(crate) fn capabilities(&self) -> Vec<String> {
        self.requests
            .lock()
            .expect("requests")
            .iter()
            .map(|request| request.capability.clone())
            .collect()
    }
}

#[async_trait]
impl IntentHandler for ScriptedHandler {
    async fn handle(&self, _ctx: &RouteContext, request: &HandlerRequest) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("requests").push(request.clone());
        self.outcome.clone().map_err(|error| anyhow!(error))
    }
}
