//! Outbound alert gating: request schema, layered minimum-priority gate,
//! per-target overrides, audited delivery planning and dispatch.

pub mod dispatcher;
pub mod gate;
pub mod overrides;
pub mod plan;
pub mod request;

pub use dispatcher::{
    NotifyChannel, NotifyDispatchReport, NotifyDispatcher, NotifySendFailure,
    NOTIFY_LIMITER_MODULE,
};
pub use gate::{
    decide_notify_gate, extract_notify_gate_info, NotifyGateDecision, NotifyGateInfo,
    NotifySkipReason,
};
pub use overrides::{
    is_valid_target_name, resolve_target_overrides, DroppedOverride, TargetOverride,
    TargetOverrides,
};
pub use plan::{plan_notify_delivery, NotifyGateAuditRecord, NotifyPlan, PlannedDelivery};
pub use request::{NotifyMeta, NotifyRequest};
