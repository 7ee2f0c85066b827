use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

fn deserialize_optional_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(scalar_to_string))
}

fn deserialize_scalar_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(values.iter().filter_map(scalar_to_string).collect())
}

fn deserialize_scalar_list_map<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Option::<BTreeMap<String, Vec<Value>>>::deserialize(deserializer)?
        .unwrap_or_default();
    Ok(values
        .into_iter()
        .map(|(target, ids)| {
            (
                target.trim().to_string(),
                ids.iter().filter_map(scalar_to_string).collect(),
            )
        })
        .collect())
}

/// Accepts `true`, `"true"`, `1` and similar truthy spellings.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(flag)) => flag,
        Some(Value::Number(number)) => number.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(text)) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        ),
        _ => false,
    })
}

pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyMeta {
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub skip_gate: bool,
    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub delivery_priority: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub global_min_priority: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub channel_min_priority: Option<String>,
}

/// Outbound notification as handed over by alert producers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyRequest {
    #[serde(default)]
    pub target: String,
    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub project_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub chat_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_scalar_list")]
    pub chat_ids: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_scalar_list_map")]
    pub chat_ids_by_target: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub meta: NotifyMeta,
    /// Legacy producers put the priority at top level.
    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub delivery_priority: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub priority: Option<String>,
}

impl NotifyRequest {
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn target(&self) -> &str {
        self.target.trim()
    }

    /// `meta.delivery_priority`, then legacy top-level `delivery_priority`,
    /// then legacy `priority`.
    pub fn delivery_priority_raw(&self) -> Option<&str> {
        self.meta
            .delivery_priority
            .as_deref()
            .or(self.delivery_priority.as_deref())
            .or(self.priority.as_deref())
    }

    /// Chat ids for `target`: `chat_ids_by_target[target]` when present, else
    /// `chat_ids`, else `chat_id`. Order preserved, duplicates removed.
    pub fn chat_ids_for_target(&self, target: &str) -> Vec<String> {
        let candidates: Vec<&String> = match self.chat_ids_by_target.get(target.trim()) {
            Some(ids) if !ids.is_empty() => ids.iter().collect(),
            _ if !self.chat_ids.is_empty() => self.chat_ids.iter().collect(),
            _ => self.chat_id.iter().collect(),
        };
        let mut resolved: Vec<String> = Vec::with_capacity(candidates.len());
        for chat_id in candidates {
            if !resolved.contains(chat_id) {
                resolved.push(chat_id.clone());
            }
        }
        resolved
    }
}
