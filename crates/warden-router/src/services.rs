//! Dispatch boundary shared by pipeline steps and the legacy path.
//!
//! [`DispatchServices::execute`] runs one capability end to end: registry
//! toggle, policy decision (audited), rate window, idempotent execution under
//! the limiter, output limits, and the reply. Handler failures stop here and
//! become a user reply plus a ledger record carrying `error_code`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use warden_access::explain_gate::EXPLAIN_REPLY_NUDGE;
use warden_access::{
    capability_family, evaluate_policy, policy_decision_ledger_record, CapabilityFamily,
    PolicyDenyReason,
};
use warden_core::current_unix_timestamp_ms;

use crate::app_context::{AppContext, ExplainTrace};
use crate::context::RouteContext;
use crate::pipeline::StepOutcome;

pub const DISPATCH_ERROR_RECORD_TYPE: &str = "dispatch_error";
pub const RATE_LIMITED_RECORD_TYPE: &str = "rate_limited";
pub const ERROR_CODE_HANDLER_FAILED: &str = "handler_failed";
pub const ERROR_CODE_TASK_STORE_FAILED: &str = "task_store_failed";
pub const COMMAND_GENERIC_DENY: &str = "This command is not available in this chat.";
pub const RATE_LIMITED_REPLY: &str = "Too many requests; try again in a minute.";
pub const HANDLER_FAILED_REPLY: &str = "Request failed; reply \"retry\" to try again.";
const TRUNCATION_MARKER: char = '…';

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerRequest {
    pub capability: String,
    pub intent: Option<String>,
    pub params: Value,
    pub request_id: String,
}

/// Business logic behind a capability (alert store, dashboards, ops shell).
#[async_trait]
pub trait IntentHandler: Send + Sync {
    async fn handle(&self, ctx: &RouteContext, request: &HandlerRequest) -> Result<Value>;
}

/// Platform reply transport.
#[async_trait]
pub trait Replier: Send + Sync {
    async fn reply(&self, ctx: &RouteContext, text: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Authorization {
    /// Allow/deny comes from the policy evaluator.
    EvaluatePolicy,
    /// A gate already admitted the request; policy only supplies limits.
    Preauthorized,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchRequest {
    pub capability: String,
    /// Capability registry key, when the intent can be toggled off.
    pub intent: Option<String>,
    pub params: Value,
    pub authorization: Authorization,
}

impl DispatchRequest {
    pub fn new(capability: &str, params: Value) -> Self {
        Self {
            capability: capability.to_string(),
            intent: None,
            params,
            authorization: Authorization::EvaluatePolicy,
        }
    }

    pub fn with_intent(mut self, intent: &str) -> Self {
        self.intent = Some(intent.to_string());
        self
    }

    pub fn preauthorized(mut self) -> Self {
        self.authorization = Authorization::Preauthorized;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Intent switched off in the registry; the message falls through.
    Disabled,
    Denied {
        reason: PolicyDenyReason,
        replied: bool,
    },
    RateLimited,
    Completed {
        request_id: String,
        ok: bool,
        replayed: bool,
    },
}

impl DispatchOutcome {
    pub fn step_outcome(&self) -> StepOutcome {
        match self {
            Self::Disabled => StepOutcome::PASS,
            _ => StepOutcome::HANDLED,
        }
    }
}

#[derive(Clone)]
pub struct DispatchServices {
    app: Arc<AppContext>,
    handler: Arc<dyn IntentHandler>,
    replier: Arc<dyn Replier>,
}

impl DispatchServices {
    pub fn new(
        app: Arc<AppContext>,
        handler: Arc<dyn IntentHandler>,
        replier: Arc<dyn Replier>,
    ) -> Self {
        Self {
            app,
            handler,
            replier,
        }
    }

    pub fn app(&self) -> &Arc<AppContext> {
        &self.app
    }

    pub async fn reply(&self, ctx: &RouteContext, text: &str) -> Result<()> {
        self.replier.reply(ctx, text).await
    }

    pub async fn execute(
        &self,
        ctx: &RouteContext,
        request: DispatchRequest,
    ) -> Result<DispatchOutcome> {
        if let Some(intent) = request.intent.as_deref() {
            if !self.app.registry().snapshot().is_intent_enabled(intent) {
                tracing::debug!(intent, capability = %request.capability, "intent disabled in registry");
                return Ok(DispatchOutcome::Disabled);
            }
        }

        let policy = self.app.policy();
        let input = ctx.policy_input(&request.capability);
        let decision = evaluate_policy(&policy.config, &input);
        let mut record = policy_decision_ledger_record(&input, &decision);
        record["policy_ok"] = json!(policy.policy_ok);
        record["authorization"] = json!(request.authorization);
        record["timestamp_unix_ms"] = json!(current_unix_timestamp_ms());
        self.app.ledger().append_or_warn(&record).await;

        if request.authorization == Authorization::EvaluatePolicy && !decision.allowed {
            let reason = decision.reason.unwrap_or(PolicyDenyReason::NotAllowed);
            let reply = match reason {
                PolicyDenyReason::MissingMention => None,
                PolicyDenyReason::MissingReply => Some(EXPLAIN_REPLY_NUDGE.to_string()),
                PolicyDenyReason::NotAllowed => Some(
                    decision
                        .deny_message
                        .clone()
                        .unwrap_or_else(|| COMMAND_GENERIC_DENY.to_string()),
                ),
            };
            tracing::debug!(
                capability = %request.capability,
                chat_id = %input.chat_id,
                reason = reason.as_str(),
                "capability denied"
            );
            if let Some(text) = &reply {
                self.replier.reply(ctx, text).await?;
            }
            return Ok(DispatchOutcome::Denied {
                reason,
                replied: reply.is_some(),
            });
        }

        let rate_key = format!(
            "{}:{}:{}",
            input.chat_id, input.user_id, request.capability
        );
        if !self.app.check_rate_limit(&rate_key, decision.limits.rpm) {
            self.app
                .ledger()
                .append_or_warn(&json!({
                    "record_type": RATE_LIMITED_RECORD_TYPE,
                    "timestamp_unix_ms": current_unix_timestamp_ms(),
                    "chat_id": input.chat_id,
                    "user_id": input.user_id,
                    "capability": request.capability,
                    "rpm": decision.limits.rpm,
                }))
                .await;
            self.replier.reply(ctx, RATE_LIMITED_REPLY).await?;
            return Ok(DispatchOutcome::RateLimited);
        }

        let request_id = self.app.request_id_for(ctx);
        let handler_request = HandlerRequest {
            capability: request.capability.clone(),
            intent: request.intent.clone(),
            params: request.params,
            request_id: request_id.clone(),
        };
        let module = limiter_module(&request.capability);
        let submission = self
            .app
            .tasks()
            .submit_task(&request_id, || async {
                self.app
                    .limiter()
                    .run(module, self.handler.handle(ctx, &handler_request))
                    .await
                    .map_err(anyhow::Error::from)
                    .and_then(|output| output)
            })
            .await;

        let (ok, replayed) = match submission {
            Ok(submission) if submission.response.ok => {
                let body = submission.response.body;
                let text = truncate_output(
                    &render_handler_output(&body),
                    decision.limits.max_lines,
                    decision.limits.max_chars,
                );
                if !text.is_empty() {
                    self.replier.reply(ctx, &text).await?;
                }
                (true, submission.replayed)
            }
            Ok(submission) => {
                let error = submission.response.error.unwrap_or_default();
                self.record_failure(&request_id, &request.capability, ERROR_CODE_HANDLER_FAILED, &error)
                    .await;
                self.replier.reply(ctx, HANDLER_FAILED_REPLY).await?;
                (false, submission.replayed)
            }
            Err(error) => {
                let error = error.to_string();
                self.record_failure(&request_id, &request.capability, ERROR_CODE_TASK_STORE_FAILED, &error)
                    .await;
                self.replier.reply(ctx, HANDLER_FAILED_REPLY).await?;
                (false, false)
            }
        };

        if capability_family(&request.capability) == CapabilityFamily::Explain {
            self.app.record_explain_trace(
                &input.channel,
                &input.chat_id,
                ExplainTrace {
                    request_id: request_id.clone(),
                    capability: request.capability.clone(),
                    target_message_id: ctx.event.reply_to_id.clone(),
                    ok,
                    recorded_unix_ms: current_unix_timestamp_ms(),
                },
            );
        }
        Ok(DispatchOutcome::Completed {
            request_id,
            ok,
            replayed,
        })
    }

    async fn record_failure(&self, request_id: &str, capability: &str, error_code: &str, error: &str) {
        tracing::warn!(request_id, capability, error_code, error, "dispatch failed");
        self.app
            .ledger()
            .append_or_warn(&json!({
                "record_type": DISPATCH_ERROR_RECORD_TYPE,
                "timestamp_unix_ms": current_unix_timestamp_ms(),
                "request_id": request_id,
                "capability": capability,
                "error_code": error_code,
                "error": error,
            }))
            .await;
    }
}

/// Limiter module for a capability: its first dotted segment (`alerts`, `ops`).
pub fn limiter_module(capability: &str) -> &str {
    capability
        .trim()
        .split('.')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or("default")
}

/// Strings pass through, objects with a `text` field use it, anything else is
/// pretty JSON.
pub fn render_handler_output(body: &Value) -> String {
    match body {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Object(map) => match map.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => serde_json::to_string_pretty(body).unwrap_or_default(),
        },
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

/// Applies line then character limits. A cut is marked with a trailing `…`
/// that counts toward `max_chars`.
pub fn truncate_output(text: &str, max_lines: Option<u32>, max_chars: Option<u32>) -> String {
    let mut output = text.to_string();
    if let Some(max_lines) = max_lines.map(|max| max as usize) {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() > max_lines {
            output = lines[..max_lines].join("\n");
            output.push(TRUNCATION_MARKER);
        }
    }
    if let Some(max_chars) = max_chars.map(|max| max as usize) {
        if output.chars().count() > max_chars {
            output = output.chars().take(max_chars.saturating_sub(1)).collect();
            output.push(TRUNCATION_MARKER);
        }
    }
    output
}
