//! Primary intent steps. Priority order: strategy (30) > query (20) >
//! dashboard export (10).

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use warden_access::capability::{
    CAPABILITY_ALERTS_QUERY, CAPABILITY_ALERTS_STRATEGY, CAPABILITY_OPS_DASHBOARD_EXPORT,
};

use crate::capability_registry::{INTENT_ALERT_QUERY, INTENT_ALERT_STRATEGY, INTENT_DASHBOARD_EXPORT};
use crate::context::RouteContext;
use crate::pipeline::{IntentMatch, IntentPipelineStep, StepOutcome};
use crate::services::{DispatchRequest, DispatchServices};

pub const STRATEGY_STEP_PRIORITY: i32 = 30;
pub const QUERY_STEP_PRIORITY: i32 = 20;
pub const DASHBOARD_STEP_PRIORITY: i32 = 10;

pub const NO_PROJECT_REPLY: &str = "No project is configured for this chat.";

/// First word is one of `commands`, or (when the message may be resolved
/// as free text) one of `keywords`.
fn matches_command(ctx: &RouteContext, commands: &[&str], keywords: &[&str]) -> bool {
    let Some(word) = ctx.first_word_lowercase() else {
        return false;
    };
    if ctx.is_slash_command {
        return commands.contains(&word.as_str());
    }
    ctx.allow_resolve && ctx.explicit_intent.is_none() && keywords.contains(&word.as_str())
}

pub struct StrategyCommandStep {
    services: DispatchServices,
}

impl StrategyCommandStep {
    pub fn new(services: DispatchServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl IntentPipelineStep for StrategyCommandStep {
    fn name(&self) -> &str {
        "alert_strategy_command"
    }

    fn priority(&self) -> i32 {
        STRATEGY_STEP_PRIORITY
    }

    fn match_intent(&self, ctx: &RouteContext) -> Option<IntentMatch> {
        matches_command(ctx, &["/strategy"], &["strategy"]).then(|| {
            IntentMatch::new(json!({
                "args": ctx.arguments(),
                "project_id": ctx.project_id,
            }))
        })
    }

    async fn run(&self, ctx: &RouteContext, matched: IntentMatch) -> Result<StepOutcome> {
        let request = DispatchRequest::new(CAPABILITY_ALERTS_STRATEGY, matched.data)
            .with_intent(INTENT_ALERT_STRATEGY);
        Ok(self.services.execute(ctx, request).await?.step_outcome())
    }
}

pub struct QueryCommandStep {
    services: DispatchServices,
}

impl QueryCommandStep {
    pub fn new(services: DispatchServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl IntentPipelineStep for QueryCommandStep {
    fn name(&self) -> &str {
        "alert_query_command"
    }

    fn priority(&self) -> i32 {
        QUERY_STEP_PRIORITY
    }

    fn match_intent(&self, ctx: &RouteContext) -> Option<IntentMatch> {
        matches_command(ctx, &["/alerts", "/query"], &["alerts", "query"]).then(|| {
            IntentMatch::new(json!({
                "query": ctx.arguments(),
                "project_id": ctx.project_id,
            }))
        })
    }

    async fn run(&self, ctx: &RouteContext, matched: IntentMatch) -> Result<StepOutcome> {
        let request = DispatchRequest::new(CAPABILITY_ALERTS_QUERY, matched.data)
            .with_intent(INTENT_ALERT_QUERY);
        Ok(self.services.execute(ctx, request).await?.step_outcome())
    }
}

/// Exports a dashboard panel for the chat's project. Matches `/dashboard`,
/// `/export`, or addressed free text mentioning "dashboard". The optional
/// first argument is the panel id and must pass the registry allow-list.
pub struct DashboardExportStep {
    services: DispatchServices,
}

impl DashboardExportStep {
    pub fn new(services: DispatchServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl IntentPipelineStep for DashboardExportStep {
    fn name(&self) -> &str {
        "dashboard_export_intent"
    }

    fn priority(&self) -> i32 {
        DASHBOARD_STEP_PRIORITY
    }

    fn match_intent(&self, ctx: &RouteContext) -> Option<IntentMatch> {
        let matched = matches_command(ctx, &["/dashboard", "/export"], &[])
            || (ctx.allow_resolve
                && ctx.explicit_intent.is_none()
                && ctx.cleaned_text.to_ascii_lowercase().contains("dashboard"));
        if !matched {
            return None;
        }
        let panel_id = if ctx.is_slash_command {
            ctx.arguments().split_whitespace().next().map(str::to_string)
        } else {
            None
        };
        Some(IntentMatch::new(json!({
            "project_id": ctx.project_id,
            "window_spec_id": ctx.window_spec_id,
            "panel_id": panel_id,
        })))
    }

    async fn run(&self, ctx: &RouteContext, matched: IntentMatch) -> Result<StepOutcome> {
        if matched.data["project_id"].is_null() {
            self.services.reply(ctx, NO_PROJECT_REPLY).await?;
            return Ok(StepOutcome::HANDLED);
        }
        if let Some(panel_id) = matched.data["panel_id"].as_str() {
            let snapshot = self.services.app().registry().snapshot();
            if !snapshot.is_panel_allowed(INTENT_DASHBOARD_EXPORT, panel_id) {
                tracing::debug!(panel_id, chat_id = %ctx.event.chat_id, "dashboard panel not allow-listed");
                self.services
                    .reply(ctx, &format!("Panel '{panel_id}' is not available for export."))
                    .await?;
                return Ok(StepOutcome::HANDLED);
            }
        }
        let request = DispatchRequest::new(CAPABILITY_OPS_DASHBOARD_EXPORT, matched.data)
            .with_intent(INTENT_DASHBOARD_EXPORT);
        Ok(self.services.execute(ctx, request).await?.step_outcome())
    }
}

/// The three primary steps, unsorted; [`crate::pipeline::IntentPipeline::new`]
/// orders them.
pub fn standard_steps(services: &DispatchServices) -> Vec<Arc<dyn IntentPipelineStep>> {
    vec![
        Arc::new(DashboardExportStep::new(services.clone())),
        Arc::new(QueryCommandStep::new(services.clone())),
        Arc::new(StrategyCommandStep::new(services.clone())),
    ]
}
