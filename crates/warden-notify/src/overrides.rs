//! Per-target, per-chat minimum-priority overrides from project config.
//!
//! Two shapes are accepted under `notify`:
//! - `min_priority_overrides: [{target, chat_id, min_priority}]`
//! - `min_priority_by_target: {<target>: {<chat_id>: <level>}}`
//!
//! The list is resolved first and the map second; a later entry replaces an
//! earlier one for the same `(target, chat_id)` as a whole.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use warden_access::{PriorityLevel, PriorityOrder};

use crate::request::scalar_to_string;

pub const OVERRIDE_LIST_SOURCE: &str = "notify.min_priority_overrides";
pub const OVERRIDE_MAP_SOURCE: &str = "notify.min_priority_by_target";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetOverride {
    pub target: String,
    pub chat_id: String,
    pub min_priority: PriorityLevel,
    /// Config path the winning entry came from.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedOverride {
    pub source: String,
    pub reason_code: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetOverrides {
    entries: BTreeMap<(String, String), TargetOverride>,
    dropped: Vec<DroppedOverride>,
}

impl TargetOverrides {
    pub fn get(&self, target: &str, chat_id: &str) -> Option<&TargetOverride> {
        self.entries
            .get(&(target.trim().to_string(), chat_id.trim().to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetOverride> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dropped(&self) -> &[DroppedOverride] {
        &self.dropped
    }

    fn insert(&mut self, entry: TargetOverride) {
        let key = (entry.target.clone(), entry.chat_id.clone());
        if let Some(previous) = self.entries.get(&key) {
            tracing::debug!(
                target_name = %entry.target,
                chat_id = %entry.chat_id,
                previous_source = %previous.source,
                source = %entry.source,
                "min-priority override replaced"
            );
        }
        self.entries.insert(key, entry);
    }

    fn drop_entry(&mut self, source: String, reason_code: &'static str, detail: String) {
        tracing::warn!(%source, reason_code, %detail, "dropping invalid min-priority override");
        self.dropped.push(DroppedOverride {
            source,
            reason_code,
            detail,
        });
    }
}

/// Target names are lowercase ascii identifiers (`telegram`, `ops-slack`).
pub fn is_valid_target_name(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-')
}

pub fn resolve_target_overrides(project_config: &Value, order: &PriorityOrder) -> TargetOverrides {
    let mut overrides = TargetOverrides::default();
    let Some(notify) = project_config.get("notify") else {
        return overrides;
    };

    match notify.get("min_priority_overrides") {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for (index, item) in items.iter().enumerate() {
                let source = format!("{OVERRIDE_LIST_SOURCE}[{index}]");
                let target = item.get("target").and_then(scalar_to_string);
                let chat_id = item.get("chat_id").and_then(scalar_to_string);
                let min_priority = item.get("min_priority").and_then(scalar_to_string);
                add_entry(
                    &mut overrides,
                    order,
                    source,
                    target.as_deref(),
                    chat_id.as_deref(),
                    min_priority.as_deref(),
                );
            }
        }
        Some(other) => overrides.drop_entry(
            OVERRIDE_LIST_SOURCE.to_string(),
            "invalid_shape",
            format!("expected array, found {}", json_kind(other)),
        ),
    }

    match notify.get("min_priority_by_target") {
        None | Some(Value::Null) => {}
        Some(Value::Object(targets)) => {
            for (target, chats) in targets {
                let Some(chats) = chats.as_object() else {
                    overrides.drop_entry(
                        format!("{OVERRIDE_MAP_SOURCE}.{target}"),
                        "invalid_shape",
                        format!("expected object, found {}", json_kind(chats)),
                    );
                    continue;
                };
                for (chat_id, level) in chats {
                    let level = scalar_to_string(level);
                    add_entry(
                        &mut overrides,
                        order,
                        format!("{OVERRIDE_MAP_SOURCE}.{target}.{chat_id}"),
                        Some(target.as_str()),
                        Some(chat_id.as_str()),
                        level.as_deref(),
                    );
                }
            }
        }
        Some(other) => overrides.drop_entry(
            OVERRIDE_MAP_SOURCE.to_string(),
            "invalid_shape",
            format!("expected object, found {}", json_kind(other)),
        ),
    }
    overrides
}

fn add_entry(
    overrides: &mut TargetOverrides,
    order: &PriorityOrder,
    source: String,
    target: Option<&str>,
    chat_id: Option<&str>,
    min_priority: Option<&str>,
) {
    let target = target.map(str::trim).unwrap_or_default();
    if !is_valid_target_name(target) {
        overrides.drop_entry(source, "invalid_target", format!("target '{target}'"));
        return;
    }
    let Some(chat_id) = chat_id.map(str::trim).filter(|id| !id.is_empty()) else {
        overrides.drop_entry(source, "missing_chat_id", format!("target '{target}'"));
        return;
    };
    let raw_priority = min_priority.unwrap_or_default();
    let Some(min_priority) = order.parse(raw_priority) else {
        overrides.drop_entry(
            source,
            "invalid_priority",
            format!("min_priority '{raw_priority}'"),
        );
        return;
    };
    overrides.insert(TargetOverride {
        target: target.to_string(),
        chat_id: chat_id.to_string(),
        min_priority,
        source,
    });
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
