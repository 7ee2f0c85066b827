use serde::Serialize;
use serde_json::Value;
use warden_access::PriorityOrder;
use warden_core::current_unix_timestamp_ms;

use crate::gate::{decide_notify_gate, extract_notify_gate_info, NotifyGateDecision};
use crate::overrides::TargetOverrides;
use crate::request::NotifyRequest;

pub const NOTIFY_GATE_RECORD_TYPE: &str = "notify_gate";

/// One per target × chat id. Records every priority value consulted, so a
/// skipped alert can be explained after the fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyGateAuditRecord {
    pub record_type: &'static str,
    pub timestamp_unix_ms: u64,
    pub target: String,
    pub project_id: Option<String>,
    pub chat_id: String,
    pub sent: bool,
    pub skip_gate: bool,
    pub delivery_priority: Option<String>,
    pub global_min_priority: Option<String>,
    pub channel_min_priority: Option<String>,
    pub override_min_priority: Option<String>,
    pub override_source: Option<String>,
    pub effective_min_priority: Option<String>,
    pub skip_reason: Option<&'static str>,
}

impl NotifyGateAuditRecord {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDelivery {
    pub chat_id: String,
    pub decision: NotifyGateDecision,
    pub audit: NotifyGateAuditRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NotifyPlan {
    pub target: String,
    pub deliveries: Vec<PlannedDelivery>,
}

impl NotifyPlan {
    pub fn allowed(&self) -> impl Iterator<Item = &PlannedDelivery> {
        self.deliveries
            .iter()
            .filter(|delivery| delivery.decision.allowed)
    }

    pub fn audit_records(&self) -> impl Iterator<Item = &NotifyGateAuditRecord> {
        self.deliveries.iter().map(|delivery| &delivery.audit)
    }
}

/// Gate decision for every chat the request addresses on its target.
pub fn plan_notify_delivery(
    request: &NotifyRequest,
    order: &PriorityOrder,
    overrides: &TargetOverrides,
) -> NotifyPlan {
    let target = request.target().to_string();
    let gate = extract_notify_gate_info(request, order);
    let chat_ids = request.chat_ids_for_target(&target);
    if chat_ids.is_empty() {
        tracing::warn!(target_name = %target, "notify request addresses no chat ids");
    }
    let timestamp_unix_ms = current_unix_timestamp_ms();
    let deliveries = chat_ids
        .into_iter()
        .map(|chat_id| {
            let target_override = overrides.get(&target, &chat_id);
            let decision = decide_notify_gate(
                gate.as_ref(),
                target_override.map(|entry| &entry.min_priority),
            );
            let audit = NotifyGateAuditRecord {
                record_type: NOTIFY_GATE_RECORD_TYPE,
                timestamp_unix_ms,
                target: target.clone(),
                project_id: request.project_id.clone(),
                chat_id: chat_id.clone(),
                sent: decision.allowed,
                skip_gate: request.meta.skip_gate,
                delivery_priority: request.delivery_priority_raw().map(str::to_string),
                global_min_priority: request.meta.global_min_priority.clone(),
                channel_min_priority: request.meta.channel_min_priority.clone(),
                override_min_priority: target_override
                    .map(|entry| entry.min_priority.name().to_string()),
                override_source: target_override.map(|entry| entry.source.clone()),
                effective_min_priority: decision
                    .effective_min_priority
                    .as_ref()
                    .map(|level| level.name().to_string()),
                skip_reason: decision.reason.map(|reason| reason.as_str()),
            };
            PlannedDelivery {
                chat_id,
                decision,
                audit,
            }
        })
        .collect();
    NotifyPlan { target, deliveries }
}
