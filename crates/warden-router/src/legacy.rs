//! Dispatch for messages no pipeline step handled: feedback capture,
//! explain/summary resolution through the explain gate, then the fixed set
//! of slash commands.

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use warden_access::capability::{
    CAPABILITY_ALERTS_EXPLAIN, CAPABILITY_OPS_CHART_DAILY_ACTIVITY,
    CAPABILITY_OPS_CHART_FACTOR_TIMELINE, CAPABILITY_OPS_LOGS, CAPABILITY_OPS_PS,
    CAPABILITY_OPS_STATUS,
};
use warden_access::{check_explain_gate, ExplainBlock, ExplainGateDecision};
use warden_core::current_unix_timestamp_ms;

use crate::context::{ExplicitIntent, RouteContext};
use crate::services::{DispatchOutcome, DispatchRequest, DispatchServices};

pub const FEEDBACK_RECORD_TYPE: &str = "feedback";
pub const FEEDBACK_ACK_REPLY: &str = "Thanks, feedback recorded.";
pub const EXPLAIN_MISSING_TARGET_REPLY: &str =
    "Nothing to explain yet; reply to an alert message.";
pub const COMMAND_PARSE_ERROR_REPLY: &str = "Could not parse that command.";
const LOGS_USAGE: &str = "Usage: /logs <service>";
const CHART_USAGE: &str = "Usage: /chart factor_timeline|daily_activity";

/// Pure classification of a message on the legacy path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum LegacyRoute {
    Feedback,
    Explain { intent: ExplicitIntent },
    Command { capability: String, params: Value },
    Usage { command: String, message: String },
    ParseError { detail: String },
    Unhandled,
}

pub fn classify_legacy(ctx: &RouteContext) -> LegacyRoute {
    if ctx.feedback {
        return if !ctx.is_group || ctx.mentions_bot {
            LegacyRoute::Feedback
        } else {
            LegacyRoute::Unhandled
        };
    }
    if let Some(intent) = ctx.explicit_intent {
        return LegacyRoute::Explain { intent };
    }
    if !ctx.is_slash_command {
        return LegacyRoute::Unhandled;
    }
    let words = match shell_words::split(&ctx.cleaned_text) {
        Ok(words) => words,
        Err(error) => {
            return LegacyRoute::ParseError {
                detail: error.to_string(),
            }
        }
    };
    let Some((command, args)) = words.split_first() else {
        return LegacyRoute::Unhandled;
    };
    let command = command.to_ascii_lowercase();
    let usage = |message: &str| LegacyRoute::Usage {
        command: command.clone(),
        message: message.to_string(),
    };
    match command.as_str() {
        "/status" => LegacyRoute::Command {
            capability: CAPABILITY_OPS_STATUS.to_string(),
            params: json!({}),
        },
        "/ps" => LegacyRoute::Command {
            capability: CAPABILITY_OPS_PS.to_string(),
            params: json!({}),
        },
        "/logs" => match args.first() {
            Some(service) => LegacyRoute::Command {
                capability: CAPABILITY_OPS_LOGS.to_string(),
                params: json!({"service": service}),
            },
            None => usage(LOGS_USAGE),
        },
        "/chart" => match args.first().map(|chart| chart.to_ascii_lowercase()).as_deref() {
            Some("factor_timeline") => LegacyRoute::Command {
                capability: CAPABILITY_OPS_CHART_FACTOR_TIMELINE.to_string(),
                params: json!({"chart": "factor_timeline", "args": &args[1..]}),
            },
            Some("daily_activity") => LegacyRoute::Command {
                capability: CAPABILITY_OPS_CHART_DAILY_ACTIVITY.to_string(),
                params: json!({"chart": "daily_activity", "args": &args[1..]}),
            },
            _ => usage(CHART_USAGE),
        },
        _ => LegacyRoute::Unhandled,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "legacy", rename_all = "snake_case")]
pub enum LegacyOutcome {
    Feedback,
    ExplainBlocked { block: ExplainBlock },
    ExplainMissingTarget,
    Dispatched { outcome: DispatchOutcome },
    Replied,
    Unhandled,
}

impl LegacyOutcome {
    pub fn handled(&self) -> bool {
        !matches!(
            self,
            Self::Unhandled | Self::ExplainBlocked { block: ExplainBlock::Ignore }
        )
    }
}

pub async fn dispatch_legacy(services: &DispatchServices, ctx: &RouteContext) -> Result<LegacyOutcome> {
    match classify_legacy(ctx) {
        LegacyRoute::Feedback => {
            record_feedback(services, ctx).await;
            services.reply(ctx, FEEDBACK_ACK_REPLY).await?;
            Ok(LegacyOutcome::Feedback)
        }
        LegacyRoute::Explain { intent } => dispatch_explain(services, ctx, intent).await,
        LegacyRoute::Command { capability, params } => {
            let outcome = services
                .execute(ctx, DispatchRequest::new(&capability, params))
                .await?;
            Ok(LegacyOutcome::Dispatched { outcome })
        }
        LegacyRoute::Usage { message, .. } => {
            services.reply(ctx, &message).await?;
            Ok(LegacyOutcome::Replied)
        }
        LegacyRoute::ParseError { detail } => {
            tracing::debug!(chat_id = %ctx.event.chat_id, %detail, "slash command parse failed");
            services.reply(ctx, COMMAND_PARSE_ERROR_REPLY).await?;
            Ok(LegacyOutcome::Replied)
        }
        LegacyRoute::Unhandled => Ok(LegacyOutcome::Unhandled),
    }
}

async fn record_feedback(services: &DispatchServices, ctx: &RouteContext) {
    let app = services.app();
    let last_explain = app.last_explain_trace(&ctx.event.channel, &ctx.event.chat_id);
    app.ledger()
        .append_or_warn(&json!({
            "record_type": FEEDBACK_RECORD_TYPE,
            "timestamp_unix_ms": current_unix_timestamp_ms(),
            "channel": ctx.event.channel,
            "chat_id": ctx.event.chat_id,
            "user_id": ctx.event.user_id,
            "reply_to_id": ctx.event.reply_to_id,
            "explain_request_id": last_explain.map(|trace| trace.request_id),
            "text": ctx.cleaned_text,
        }))
        .await;
}

async fn dispatch_explain(
    services: &DispatchServices,
    ctx: &RouteContext,
    intent: ExplicitIntent,
) -> Result<LegacyOutcome> {
    let app = services.app();
    let input = ctx.policy_input(CAPABILITY_ALERTS_EXPLAIN);
    let decision = check_explain_gate(&app.policy(), &app.allowlist(), &input);
    if let ExplainGateDecision::Blocked(block) = decision {
        tracing::debug!(
            chat_id = %input.chat_id,
            user_id = %input.user_id,
            block = block.as_str(),
            "explain gate blocked"
        );
        if let ExplainBlock::Reply { message } = &block {
            services.reply(ctx, message).await?;
        }
        return Ok(LegacyOutcome::ExplainBlocked { block });
    }

    let reply_target = ctx
        .event
        .reply_to_text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(|text| (text.to_string(), ctx.event.reply_to_id.clone()));
    let target = reply_target.or_else(|| {
        app.last_alert(&ctx.event.channel, &ctx.event.chat_id)
            .map(|alert| (alert.text, alert.message_id))
    });
    let Some((target_text, target_message_id)) = target else {
        services.reply(ctx, EXPLAIN_MISSING_TARGET_REPLY).await?;
        return Ok(LegacyOutcome::ExplainMissingTarget);
    };

    let mode = match intent {
        ExplicitIntent::Explain => "explain",
        ExplicitIntent::Summarize => "summarize",
    };
    let request = DispatchRequest::new(
        CAPABILITY_ALERTS_EXPLAIN,
        json!({
            "mode": mode,
            "question": ctx.arguments(),
            "target_text": target_text,
            "target_message_id": target_message_id,
            "project_id": ctx.project_id,
        }),
    )
    .preauthorized();
    let outcome = services.execute(ctx, request).await?;
    Ok(LegacyOutcome::Dispatched { outcome })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use warden_access::explain_gate::EXPLAIN_REPLY_NUDGE;
    use warden_access::ExplainBlock;
    use warden_core::read_ledger_records;

    use super::{
        classify_legacy, dispatch_legacy, LegacyOutcome, LegacyRoute, EXPLAIN_MISSING_TARGET_REPLY,
        FEEDBACK_ACK_REPLY,
    };
    use crate::app_context::LastAlert;
    use crate::context::ExplicitIntent;
    use crate::services::{DispatchOutcome, DispatchServices};
    use crate::test_support::{
        app_with_policy, group_event, private_event, RecordingReplier, ScriptedHandler,
    };

    fn explain_policy() -> serde_json::Value {
        json!({
            "version": 1,
            "principals": {"owner": {"user_id": "1001"}},
            "rules": [
                {
                    "name": "ops-group",
                    "match": {"chat_id": "-100200"},
                    "allow": ["alerts.explain"],
                    "require": {"mention_bot_for_explain": true, "reply_required_for_explain": true}
                },
                {"name": "owner", "match": {"user_id": "1001"}, "allow": ["*"]}
            ]
        })
    }

    #[tokio::test]
    async fn unit_classify_slash_commands_and_usage() {
        let (_temp, app) = app_with_policy(explain_policy());
        let route = |text: &str| classify_legacy(&app.build_context(private_event("1001", text)));

        assert!(matches!(route("/status"), LegacyRoute::Command { capability, .. } if capability == "ops.status"));
        assert!(matches!(route("/PS"), LegacyRoute::Command { capability, .. } if capability == "ops.ps"));
        let LegacyRoute::Command { params, .. } = route("/logs \"api gateway\"") else {
            panic!("expected logs command");
        };
        assert_eq!(params["service"], "api gateway");
        assert!(matches!(route("/logs"), LegacyRoute::Usage { .. }));
        assert!(matches!(route("/chart daily_activity 7d"), LegacyRoute::Command { capability, .. } if capability == "ops.chart.daily_activity"));
        assert!(matches!(route("/chart pie"), LegacyRoute::Usage { .. }));
        assert!(matches!(route("/logs \"unterminated"), LegacyRoute::ParseError { .. }));
        assert_eq!(route("/unknown"), LegacyRoute::Unhandled);
        assert_eq!(route("hello"), LegacyRoute::Unhandled);
        assert_eq!(
            route("tldr"),
            LegacyRoute::Explain {
                intent: ExplicitIntent::Summarize
            }
        );
    }

    #[tokio::test]
    async fn functional_group_explain_gate_paths() {
        let (_temp, app) = app_with_policy(explain_policy());
        let handler = ScriptedHandler::ok(json!("because"));
        let replier = RecordingReplier::new();
        let services = DispatchServices::new(app.clone(), handler.clone(), replier.clone());

        let unaddressed = app.build_context(group_event("-100200", "42", "explain", false));
        let outcome = dispatch_legacy(&services, &unaddressed).await.expect("dispatch");
        assert_eq!(outcome, LegacyOutcome::ExplainBlocked { block: ExplainBlock::Ignore });
        assert!(!outcome.handled());

        let no_reply = app.build_context(group_event("-100200", "42", "explain", true));
        dispatch_legacy(&services, &no_reply).await.expect("dispatch");
        assert_eq!(replier.texts(), vec![EXPLAIN_REPLY_NUDGE]);

        let mut replied = group_event("-100200", "42", "explain", true);
        replied.reply_to_id = Some("5".to_string());
        replied.reply_to_text = Some("CPU high on api-1".to_string());
        let outcome = dispatch_legacy(&services, &app.build_context(replied))
            .await
            .expect("dispatch");
        assert!(matches!(
            outcome,
            LegacyOutcome::Dispatched {
                outcome: DispatchOutcome::Completed { ok: true, .. }
            }
        ));
        let requests = handler.requests.lock().expect("requests").clone();
        assert_eq!(requests[0].params["target_text"], "CPU high on api-1");
        assert_eq!(requests[0].params["mode"], "explain");
        assert!(app.last_explain_trace("telegram", "-100200").is_some());
    }

    #[tokio::test]
    async fn functional_private_explain_uses_last_alert_or_asks_for_target() {
        let (_temp, app) = app_with_policy(explain_policy());
        let handler = ScriptedHandler::ok(json!("summary"));
        let replier = RecordingReplier::new();
        let services = DispatchServices::new(app.clone(), handler.clone(), replier.clone());

        let ctx = app.build_context(private_event("1001", "summarize"));
        let outcome = dispatch_legacy(&services, &ctx).await.expect("dispatch");
        assert_eq!(outcome, LegacyOutcome::ExplainMissingTarget);
        assert_eq!(replier.texts(), vec![EXPLAIN_MISSING_TARGET_REPLY]);

        app.record_alert(
            "telegram",
            "1001",
            LastAlert {
                message_id: Some("77".to_string()),
                text: "disk 91%".to_string(),
                priority: Some("high".to_string()),
                recorded_unix_ms: 1,
            },
        );
        let mut retry = private_event("1001", "retry summarize");
        retry.message_id = Some("11".to_string());
        dispatch_legacy(&services, &app.build_context(retry))
            .await
            .expect("dispatch");
        let requests = handler.requests.lock().expect("requests").clone();
        assert_eq!(requests[0].params["target_text"], "disk 91%");
        assert_eq!(requests[0].params["target_message_id"], "77");
        assert_eq!(requests[0].params["mode"], "summarize");

        let stranger = app.build_context(private_event("9", "explain"));
        let outcome = dispatch_legacy(&services, &stranger).await.expect("dispatch");
        assert_eq!(outcome, LegacyOutcome::ExplainBlocked { block: ExplainBlock::Consume });
    }

    #[tokio::test]
    async fn integration_feedback_is_acknowledged_and_audited() {
        let (_temp, app) = app_with_policy(explain_policy());
        let replier = RecordingReplier::new();
        let services = DispatchServices::new(app.clone(), ScriptedHandler::ok(json!("ok")), replier.clone());

        let ctx = app.build_context(private_event("1001", "feedback: root cause was dns"));
        assert_eq!(dispatch_legacy(&services, &ctx).await.expect("dispatch"), LegacyOutcome::Feedback);
        assert_eq!(replier.texts(), vec![FEEDBACK_ACK_REPLY]);

        let group = app.build_context(group_event("-100200", "42", "fb: noise", false));
        assert_eq!(classify_legacy(&group), LegacyRoute::Unhandled);

        let records = read_ledger_records(app.ledger().storage_dir()).expect("ledger");
        let feedback = records
            .iter()
            .find(|record| record["record_type"] == "feedback")
            .expect("feedback record");
        assert_eq!(feedback["text"], "root cause was dns");
    }
}
