use std::cmp::Reverse;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::context::RouteContext;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentMatch {
    pub data: Value,
}

impl IntentMatch {
    pub fn new(data: Value) -> Self {
        Self { data }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub handled: bool,
}

impl StepOutcome {
    pub const HANDLED: Self = Self { handled: true };
    pub const PASS: Self = Self { handled: false };
}

/// One matcher/handler in the intent pipeline.
///
/// `match_intent` must be cheap and side-effect free. `run` may still decline
/// with [`StepOutcome::PASS`], letting lower-priority steps see the message.
#[async_trait]
pub trait IntentPipelineStep: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn match_intent(&self, ctx: &RouteContext) -> Option<IntentMatch>;
    async fn run(&self, ctx: &RouteContext, matched: IntentMatch) -> Result<StepOutcome>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutcome {
    pub handled: bool,
    pub step: Option<String>,
    /// Steps that matched, ran and passed, in execution order.
    pub fallthrough: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepMatchPreview {
    pub step: String,
    pub priority: i32,
    pub data: Value,
}

#[derive(Clone, Default)]
pub struct IntentPipeline {
    steps: Vec<Arc<dyn IntentPipelineStep>>,
}

impl IntentPipeline {
    /// Sorts once by descending priority; ties keep declaration order.
    pub fn new(mut steps: Vec<Arc<dyn IntentPipelineStep>>) -> Self {
        steps.sort_by_key(|step| Reverse(step.priority()));
        Self { steps }
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    pub async fn run(&self, ctx: &RouteContext) -> Result<PipelineOutcome> {
        let mut fallthrough = Vec::new();
        for step in &self.steps {
            let Some(matched) = step.match_intent(ctx) else {
                continue;
            };
            let outcome = step.run(ctx, matched).await?;
            if outcome.handled {
                return Ok(PipelineOutcome {
                    handled: true,
                    step: Some(step.name().to_string()),
                    fallthrough,
                });
            }
            tracing::debug!(
                step = step.name(),
                priority = step.priority(),
                chat_id = %ctx.event.chat_id,
                "pipeline_step_fallthrough"
            );
            fallthrough.push(step.name().to_string());
        }
        Ok(PipelineOutcome {
            handled: false,
            step: None,
            fallthrough,
        })
    }

    /// Every step whose matcher accepts `ctx`, in execution order. Nothing runs.
    pub fn preview(&self, ctx: &RouteContext) -> Vec<StepMatchPreview> {
        self.steps
            .iter()
            .filter_map(|step| {
                step.match_intent(ctx).map(|matched| StepMatchPreview {
                    step: step.name().to_string(),
                    priority: step.priority(),
                    data: matched.data,
                })
            })
            .collect()
    }
}
