use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use warden_access::explain_gate::EXPLAIN_REPLY_NUDGE;
use warden_access::PolicyOwner;
use warden_core::read_ledger_records;
use warden_notify::{NotifyChannel, NotifyDispatcher, NotifyRequest};
use warden_router::{
    AppConfig, AppContext, HandlerRequest, IntentHandler, LegacyOutcome, MessageEvent, Replier,
    RouteContext, Router,
};

const OPS_GROUP: &str = "-100200";
const OTHER_GROUP: &str = "-100999";
const OWNER: &str = "1001";

struct RecordingHandler {
    calls: AtomicUsize,
    requests: Mutex<Vec<HandlerRequest>>,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<HandlerRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

#[async_trait]
impl IntentHandler for RecordingHandler {
    async fn handle(&self, _ctx: &RouteContext, request: &HandlerRequest) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("requests").push(request.clone());
        tokio::task::yield_now().await;
        Ok(json!({"text": format!("handled {}", request.capability)}))
    }
}

#[derive(Default)]
struct ChatLog {
    replies: Mutex<Vec<(String, String)>>,
}

impl ChatLog {
    fn replies_in(&self, chat_id: &str) -> Vec<String> {
        self.replies
            .lock()
            .expect("replies")
            .iter()
            .filter(|(chat, _)| chat == chat_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Replier for ChatLog {
    async fn reply(&self, ctx: &RouteContext, text: &str) -> Result<()> {
        self.replies
            .lock()
            .expect("replies")
            .push((ctx.event.chat_id.clone(), text.to_string()));
        Ok(())
    }
}

struct TelegramOutbox {
    sent: Mutex<Vec<(String, String)>>,
    offline_chat: Option<String>,
}

#[async_trait]
impl NotifyChannel for TelegramOutbox {
    fn target(&self) -> &str {
        "telegram"
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        if self.offline_chat.as_deref() == Some(chat_id) {
            bail!("chat {chat_id} unreachable");
        }
        self.sent
            .lock()
            .expect("sent")
            .push((chat_id.to_string(), text.to_string()));
        Ok(())
    }
}

fn policy() -> Value {
    json!({
        "version": 1,
        "groups": {"ops": OPS_GROUP},
        "principals": {"owner": {"user_id": OWNER}},
        "capabilities": [
            "alerts.explain", "alerts.strategy", "alerts.query", "ops.status", "ops.ps",
            "ops.logs", "ops.chart.factor_timeline", "ops.chart.daily_activity",
            "ops.dashboard.export"
        ],
        "default": {"allow": []},
        "rules": [
            {
                "name": "ops-group",
                "match": {"chat_id": "${groups.ops}"},
                "allow": ["alerts.explain", "alerts.query", "ops.status"],
                "require": {
                    "mention_bot_for_explain": true,
                    "reply_required_for_explain": true,
                    "mention_bot_for_ops": true
                }
            },
            {
                "name": "other-groups",
                "match": {"chat_type": "supergroup"},
                "allow": [],
                "deny_message": "Ask in the ops group."
            },
            {"name": "owner", "match": {"user_id": "${principals.owner.user_id}"}, "allow": ["*"]}
        ]
    })
}

fn workspace(dir: &Path) -> Arc<AppContext> {
    let policy_path = dir.join("policy.json");
    std::fs::write(&policy_path, policy().to_string()).expect("write policy");
    let project_path = dir.join("project.json");
    std::fs::write(
        &project_path,
        json!({
            "notify": {
                "min_priority_overrides": [
                    {"target": "telegram", "chat_id": OPS_GROUP, "min_priority": "high"}
                ]
            }
        })
        .to_string(),
    )
    .expect("write project");
    let mut config = AppConfig::new(dir.join("storage"));
    config.policy_path = Some(policy_path);
    config.project_config_path = Some(project_path);
    config.fallback_owner = PolicyOwner {
        user_id: Some(OWNER.to_string()),
        private_chat_id: None,
    };
    config.route.bot_usernames = vec!["wardenbot".to_string()];
    config.route.default_project_id = Some("alpha".to_string());
    AppContext::init(config).expect("init app")
}

fn event(chat_id: &str, chat_type: &str, user_id: &str, message_id: &str, text: &str) -> MessageEvent {
    MessageEvent {
        channel: "telegram".to_string(),
        chat_id: chat_id.to_string(),
        chat_type: chat_type.to_string(),
        user_id: user_id.to_string(),
        message_id: Some(message_id.to_string()),
        text: text.to_string(),
        ..MessageEvent::default()
    }
}

fn setup() -> (TempDir, Arc<AppContext>, Arc<RecordingHandler>, Arc<ChatLog>, Router) {
    let temp = tempfile::tempdir().expect("tempdir");
    let app = workspace(temp.path());
    let handler = RecordingHandler::new();
    let chat = Arc::new(ChatLog::default());
    let router = Router::new(app.clone(), handler.clone(), chat.clone());
    (temp, app, handler, chat, router)
}

#[tokio::test]
async fn integration_notify_delivery_feeds_reply_less_explain() {
    let (_temp, app, handler, chat, router) = setup();
    let outbox = Arc::new(TelegramOutbox {
        sent: Mutex::new(Vec::new()),
        offline_chat: None,
    });
    let mut dispatcher = NotifyDispatcher::new(
        app.priority_order().clone(),
        (*app.notify_overrides()).clone(),
        app.limiter().clone(),
    )
    .with_ledger(app.ledger().clone());
    dispatcher.register_channel(outbox.clone());

    let request = NotifyRequest::from_value(json!({
        "target": "telegram",
        "chat_ids": [OWNER.parse::<i64>().expect("owner id"), OPS_GROUP],
        "text": "disk 91% on db-1",
        "meta": {"delivery_priority": "medium", "global_min_priority": "low"}
    }))
    .expect("request");
    let report = dispatcher.dispatch(&request).await;
    assert_eq!(report.sent, vec![OWNER.to_string()]);
    assert_eq!(report.skipped.get(OPS_GROUP).copied(), Some("below_min_priority"));
    app.record_notify_delivery(&request, &report);

    let outcome = router
        .handle_event(event(OWNER, "private", OWNER, "50", "explain"))
        .await;
    assert!(outcome.handled);
    let requests = handler.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].capability, "alerts.explain");
    assert_eq!(requests[0].params["target_text"], "disk 91% on db-1");
    assert_eq!(chat.replies_in(OWNER), vec!["handled alerts.explain"]);

    assert!(app.flush().await.expect("flush"));
    let records = read_ledger_records(app.ledger().storage_dir()).expect("ledger");
    assert_eq!(
        records
            .iter()
            .filter(|record| record["record_type"] == "notify_gate")
            .count(),
        2
    );
    assert!(!records
        .iter()
        .any(|record| record["record_type"] == "dispatch_error"));
}

#[tokio::test]
async fn integration_group_explain_scenarios() {
    let (_temp, _app, handler, chat, router) = setup();

    let unaddressed = router
        .handle_event(event(OPS_GROUP, "supergroup", "42", "60", "explain"))
        .await;
    assert_eq!(
        unaddressed.legacy,
        Some(LegacyOutcome::ExplainBlocked {
            block: warden_access::ExplainBlock::Ignore
        })
    );
    assert!(chat.replies_in(OPS_GROUP).is_empty());

    router
        .handle_event(event(OPS_GROUP, "supergroup", "42", "61", "@wardenbot explain"))
        .await;
    assert_eq!(chat.replies_in(OPS_GROUP), vec![EXPLAIN_REPLY_NUDGE]);

    let mut replied = event(OPS_GROUP, "supergroup", "42", "62", "@wardenbot explain");
    replied.reply_to_id = Some("7".to_string());
    replied.reply_to_text = Some("latency p99 4s".to_string());
    router.handle_event(replied).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    let mut elsewhere = event(OTHER_GROUP, "supergroup", "42", "63", "@wardenbot explain");
    elsewhere.reply_to_id = Some("8".to_string());
    router.handle_event(elsewhere).await;
    assert_eq!(chat.replies_in(OTHER_GROUP), vec!["Ask in the ops group."]);

    let stranger = router
        .handle_event(event("555", "private", "555", "64", "explain"))
        .await;
    assert!(stranger.handled);
    assert!(chat.replies_in("555").is_empty());
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn integration_concurrent_redelivery_executes_once() {
    let (_temp, app, handler, chat, router) = setup();
    let first = router.handle_event(event(OPS_GROUP, "supergroup", OWNER, "70", "@wardenbot /status"));
    let second = router.handle_event(event(OPS_GROUP, "supergroup", OWNER, "70", "@wardenbot /status"));
    let (first, second) = tokio::join!(first, second);
    assert!(first.handled && second.handled);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(chat.replies_in(OPS_GROUP).len(), 2);

    let mut retry = event(OPS_GROUP, "supergroup", OWNER, "72", "@wardenbot retry /status");
    retry.reply_to_id = Some("70".to_string());
    router.handle_event(retry).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

    let records = read_ledger_records(app.ledger().storage_dir()).expect("ledger");
    assert!(records.iter().any(|record| record["record_type"] == "policy_decision"
        && record["capability"] == "ops.status"
        && record["matched_rule"] == "ops-group"));
}

#[tokio::test]
async fn integration_notify_gate_fails_closed_and_audits_send_failures() {
    let (_temp, app, _handler, _chat, _router) = setup();
    let outbox = Arc::new(TelegramOutbox {
        sent: Mutex::new(Vec::new()),
        offline_chat: Some("2".to_string()),
    });
    let mut dispatcher = NotifyDispatcher::new(
        app.priority_order().clone(),
        (*app.notify_overrides()).clone(),
        app.limiter().clone(),
    )
    .with_ledger(app.ledger().clone());
    dispatcher.register_channel(outbox.clone());

    let ungated = NotifyRequest::from_value(json!({
        "target": "telegram",
        "chat_id": 1,
        "text": "no meta"
    }))
    .expect("request");
    let report = dispatcher.dispatch(&ungated).await;
    assert!(report.sent.is_empty());
    assert_eq!(report.skipped.get("1").copied(), Some("missing_gate_meta"));

    let forced = NotifyRequest::from_value(json!({
        "target": "telegram",
        "chat_ids": ["1", "2"],
        "text": "deploy finished",
        "meta": {"skip_gate": "true"}
    }))
    .expect("request");
    let report = dispatcher.dispatch(&forced).await;
    assert_eq!(report.sent, vec!["1".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(outbox.sent.lock().expect("sent").len(), 1);

    let records = read_ledger_records(app.ledger().storage_dir()).expect("ledger");
    assert!(records
        .iter()
        .any(|record| record["record_type"] == "notify_send_failed" && record["chat_id"] == "2"));
}
