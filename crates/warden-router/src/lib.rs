//! Inbound message routing.
//!
//! A [`Router`] turns a platform [`MessageEvent`] into a [`RouteContext`],
//! runs the priority-ordered intent pipeline, and falls back to legacy
//! dispatch (explain/summary, slash commands). Every capability goes through
//! [`DispatchServices::execute`]: registry toggle, policy, rate window,
//! idempotent execution under the concurrency limiter, output limits.

pub mod app_context;
pub mod capability_registry;
pub mod context;
pub mod legacy;
pub mod pipeline;
pub mod request_id;
pub mod router;
pub mod services;
pub mod steps;

#[cfg(test)]
mod test_support;

pub use app_context::{
    chat_key, context_state_path, AppConfig, AppContext, ExplainTrace, LastAlert, RefreshReport,
    CONTEXT_STATE_SCHEMA_VERSION,
};
pub use capability_registry::{
    content_hash, CapabilityRegistry, CapabilityRegistryDocument, CapabilityRegistryError,
    CapabilitySnapshot, IntentToggle, CAPABILITY_REGISTRY_VERSION, INTENT_ALERT_QUERY,
    INTENT_ALERT_STRATEGY, INTENT_DASHBOARD_EXPORT,
};
pub use context::{ExplicitIntent, MessageEvent, RouteContext, RouteSettings};
pub use legacy::{classify_legacy, dispatch_legacy, LegacyOutcome, LegacyRoute};
pub use pipeline::{
    IntentMatch, IntentPipeline, IntentPipelineStep, PipelineOutcome, StepMatchPreview,
    StepOutcome,
};
pub use request_id::{
    derive_request_id, derive_retry_request_id, request_id_for_context, REQUEST_ID_PREFIX,
};
pub use router::{RouteInspection, RouteOutcome, Router};
pub use services::{
    render_handler_output, truncate_output, Authorization, DispatchOutcome, DispatchRequest,
    DispatchServices, HandlerRequest, IntentHandler, Replier,
};
pub use steps::{
    standard_steps, DashboardExportStep, QueryCommandStep, StrategyCommandStep,
};
