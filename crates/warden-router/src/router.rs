use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use warden_core::current_unix_timestamp_ms;

use crate::app_context::AppContext;
use crate::context::{MessageEvent, RouteContext};
use crate::legacy::{classify_legacy, dispatch_legacy, LegacyOutcome, LegacyRoute};
use crate::pipeline::{IntentPipeline, StepMatchPreview};
use crate::request_id::derive_request_id;
use crate::services::{DispatchServices, IntentHandler, Replier, HANDLER_FAILED_REPLY};
use crate::steps::standard_steps;

pub const ROUTE_ERROR_RECORD_TYPE: &str = "route_error";
pub const ERROR_CODE_ROUTE_FAILED: &str = "route_failed";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteOutcome {
    pub handled: bool,
    pub step: Option<String>,
    pub fallthrough: Vec<String>,
    pub legacy: Option<LegacyOutcome>,
    pub error: Option<String>,
}

impl RouteOutcome {
    fn failed(error: String) -> Self {
        Self {
            handled: false,
            step: None,
            fallthrough: Vec::new(),
            legacy: None,
            error: Some(error),
        }
    }
}

/// Dry-run view of how a message would route. Nothing executes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteInspection {
    pub context: RouteContext,
    pub request_id: String,
    pub pipeline_matches: Vec<StepMatchPreview>,
    pub legacy: LegacyRoute,
}

/// Inbound message entry point: pipeline first, legacy dispatch for
/// whatever the pipeline leaves unhandled.
#[derive(Clone)]
pub struct Router {
    services: DispatchServices,
    pipeline: IntentPipeline,
}

impl Router {
    pub fn new(
        app: Arc<AppContext>,
        handler: Arc<dyn IntentHandler>,
        replier: Arc<dyn Replier>,
    ) -> Self {
        let services = DispatchServices::new(app, handler, replier);
        let pipeline = IntentPipeline::new(standard_steps(&services));
        Self { services, pipeline }
    }

    pub fn from_parts(services: DispatchServices, pipeline: IntentPipeline) -> Self {
        Self { services, pipeline }
    }

    pub fn app(&self) -> &Arc<AppContext> {
        self.services.app()
    }

    pub fn pipeline(&self) -> &IntentPipeline {
        &self.pipeline
    }

    pub fn inspect(&self, event: MessageEvent) -> RouteInspection {
        let context = self.app().build_context(event);
        let request_id = derive_request_id(
            &context.event.channel,
            &context.event.chat_id,
            context.event.message_id.as_deref().unwrap_or_default(),
            0,
        );
        RouteInspection {
            pipeline_matches: if context.feedback {
                Vec::new()
            } else {
                self.pipeline.preview(&context)
            },
            legacy: classify_legacy(&context),
            request_id,
            context,
        }
    }

    /// Never fails: errors are logged, audited and answered here.
    pub async fn handle_event(&self, event: MessageEvent) -> RouteOutcome {
        let ctx = self.app().build_context(event);
        match self.route(&ctx).await {
            Ok(outcome) => outcome,
            Err(error) => {
                let error = format!("{error:#}");
                tracing::warn!(
                    chat_id = %ctx.event.chat_id,
                    user_id = %ctx.event.user_id,
                    %error,
                    "message routing failed"
                );
                self.app()
                    .ledger()
                    .append_or_warn(&json!({
                        "record_type": ROUTE_ERROR_RECORD_TYPE,
                        "timestamp_unix_ms": current_unix_timestamp_ms(),
                        "channel": ctx.event.channel,
                        "chat_id": ctx.event.chat_id,
                        "message_id": ctx.event.message_id,
                        "error_code": ERROR_CODE_ROUTE_FAILED,
                        "error": error,
                    }))
                    .await;
                if let Err(reply_error) = self.services.reply(&ctx, HANDLER_FAILED_REPLY).await {
                    tracing::warn!(error = %format!("{reply_error:#}"), "failed to send error reply");
                }
                RouteOutcome::failed(error)
            }
        }
    }

    async fn route(&self, ctx: &RouteContext) -> anyhow::Result<RouteOutcome> {
        let (step, fallthrough) = if ctx.feedback {
            (None, Vec::new())
        } else {
            let outcome = self.pipeline.run(ctx).await?;
            if outcome.handled {
                return Ok(RouteOutcome {
                    handled: true,
                    step: outcome.step,
                    fallthrough: outcome.fallthrough,
                    legacy: None,
                    error: None,
                });
            }
            (outcome.step, outcome.fallthrough)
        };
        let legacy = dispatch_legacy(&self.services, ctx).await?;
        Ok(RouteOutcome {
            handled: legacy.handled(),
            step,
            fallthrough,
            legacy: Some(legacy),
            error: None,
        })
    }

    /// Periodic refresh of on-disk sources, cache flush and limiter metrics.
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let app = Arc::clone(self.app());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(error) = app.refresh() {
                    tracing::warn!(error = %format!("{error:#}"), "context refresh failed");
                }
                if let Err(error) = app.flush().await {
                    tracing::warn!(error = %format!("{error:#}"), "context flush failed");
                }
                app.limiter().flush_if_contended();
            }
        })
    }
}
