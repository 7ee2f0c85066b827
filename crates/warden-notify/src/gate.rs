//! Layered minimum-severity gate for outbound alerts.
//!
//! Missing or unparseable priority metadata fails closed: the alert is not
//! sent and the decision carries `missing_gate_meta`.

use serde::Serialize;
use warden_access::{max_priority_level, PriorityLevel, PriorityOrder};

use crate::request::NotifyRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifySkipReason {
    MissingGateMeta,
    BelowMinPriority,
}

impl NotifySkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingGateMeta => "missing_gate_meta",
            Self::BelowMinPriority => "below_min_priority",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyGateInfo {
    pub skip_gate: bool,
    /// `None` only when `skip_gate` is set.
    pub delivery_priority: Option<PriorityLevel>,
    pub global_min_priority: PriorityLevel,
    pub channel_min_priority: PriorityLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyGateDecision {
    pub allowed: bool,
    pub reason: Option<NotifySkipReason>,
    pub effective_min_priority: Option<PriorityLevel>,
}

/// Reads gate metadata from `request`.
///
/// `None` when the gate is undefined: no delivery priority without
/// `skip_gate`, or a consulted level name outside `order`.
pub fn extract_notify_gate_info(
    request: &NotifyRequest,
    order: &PriorityOrder,
) -> Option<NotifyGateInfo> {
    let skip_gate = request.meta.skip_gate;
    let parse = |field: &'static str, raw: &str| {
        let level = order.parse(raw);
        if level.is_none() && !skip_gate {
            tracing::warn!(field, value = raw, "unknown priority level in notify meta");
        }
        level
    };

    let delivery_priority = match request.delivery_priority_raw() {
        Some(raw) => match parse("delivery_priority", raw) {
            Some(level) => Some(level),
            None if skip_gate => None,
            None => return None,
        },
        None if skip_gate => None,
        None => return None,
    };
    let global_min_priority = match request.meta.global_min_priority.as_deref() {
        Some(raw) => match parse("global_min_priority", raw) {
            Some(level) => level,
            None if skip_gate => order.lowest(),
            None => return None,
        },
        None => order.lowest(),
    };
    let channel_min_priority = match request.meta.channel_min_priority.as_deref() {
        Some(raw) => match parse("channel_min_priority", raw) {
            Some(level) => level,
            None if skip_gate => global_min_priority.clone(),
            None => return None,
        },
        None => global_min_priority.clone(),
    };
    Some(NotifyGateInfo {
        skip_gate,
        delivery_priority,
        global_min_priority,
        channel_min_priority,
    })
}

pub fn decide_notify_gate(
    gate: Option<&NotifyGateInfo>,
    target_override: Option<&PriorityLevel>,
) -> NotifyGateDecision {
    let Some(gate) = gate else {
        return NotifyGateDecision {
            allowed: false,
            reason: Some(NotifySkipReason::MissingGateMeta),
            effective_min_priority: None,
        };
    };
    if gate.skip_gate {
        return NotifyGateDecision {
            allowed: true,
            reason: None,
            effective_min_priority: None,
        };
    }
    let effective_min = max_priority_level(
        [
            Some(&gate.global_min_priority),
            Some(&gate.channel_min_priority),
            target_override,
        ]
        .into_iter()
        .flatten(),
    )
    .cloned();
    let allowed = match (&gate.delivery_priority, &effective_min) {
        (Some(delivery), Some(minimum)) => delivery >= minimum,
        (Some(_), None) => true,
        (None, _) => false,
    };
    NotifyGateDecision {
        allowed,
        reason: (!allowed).then_some(if gate.delivery_priority.is_none() {
            NotifySkipReason::MissingGateMeta
        } else {
            NotifySkipReason::BelowMinPriority
        }),
        effective_min_priority: effective_min,
    }
}
