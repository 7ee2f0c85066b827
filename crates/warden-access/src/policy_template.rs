//! `${a.b.c}` and `${ENV:NAME}` references inside policy match values.

use serde_json::Value;

const ENV_REFERENCE_PREFIX: &str = "ENV:";
const POLICY_REFERENCE_PREFIX: &str = "policy.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateReference<'a> {
    Env(&'a str),
    PolicyPath(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart<'a> {
    Literal(&'a str),
    Reference(TemplateReference<'a>),
}

pub fn contains_template_reference(raw: &str) -> bool {
    raw.contains("${")
}

/// Rejects empty references (`${}`, `${ENV:}`) and dangling `${`.
pub fn validate_template_syntax(raw: &str) -> Result<(), String> {
    split_template(raw).map(|_| ())
}

fn split_template(raw: &str) -> Result<Vec<TemplatePart<'_>>, String> {
    let mut parts = Vec::new();
    let mut rest = raw;
    while let Some(open) = rest.find("${") {
        if open > 0 {
            parts.push(TemplatePart::Literal(&rest[..open]));
        }
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find('}') else {
            return Err(format!("unterminated template reference in '{raw}'"));
        };
        let inner = &after_open[..close];
        if inner.contains('{') {
            return Err(format!("nested template reference in '{raw}'"));
        }
        let reference = parse_reference(inner)
            .ok_or_else(|| format!("empty template reference in '{raw}'"))?;
        parts.push(TemplatePart::Reference(reference));
        rest = &after_open[close + 1..];
    }
    if !rest.is_empty() {
        parts.push(TemplatePart::Literal(rest));
    }
    Ok(parts)
}

fn parse_reference(inner: &str) -> Option<TemplateReference<'_>> {
    let inner = inner.trim();
    if let Some(name) = inner.strip_prefix(ENV_REFERENCE_PREFIX) {
        let name = name.trim();
        return (!name.is_empty()).then_some(TemplateReference::Env(name));
    }
    (!inner.is_empty()).then_some(TemplateReference::PolicyPath(inner))
}

/// Expands every reference in `raw`. Returns `None` when any reference cannot
/// be resolved, which callers treat as "this value can never match".
pub fn resolve_policy_template(
    raw: &str,
    policy_source: &Value,
    env: &dyn Fn(&str) -> Option<String>,
) -> Option<String> {
    if !contains_template_reference(raw) {
        return Some(raw.to_string());
    }
    let parts = split_template(raw).ok()?;
    let mut resolved = String::with_capacity(raw.len());
    for part in parts {
        match part {
            TemplatePart::Literal(text) => resolved.push_str(text),
            TemplatePart::Reference(TemplateReference::Env(name)) => {
                let value = env(name).filter(|value| !value.trim().is_empty())?;
                resolved.push_str(value.trim());
            }
            TemplatePart::Reference(TemplateReference::PolicyPath(path)) => {
                resolved.push_str(&lookup_policy_path(policy_source, path)?);
            }
        }
    }
    Some(resolved)
}

/// Walks dotted `path` through objects (and numeric array indexes). Only
/// scalar leaves resolve. A leading `policy.` is accepted as an alias for the root.
pub fn lookup_policy_path(policy_source: &Value, path: &str) -> Option<String> {
    let path = path.trim();
    let path = match path.strip_prefix(POLICY_REFERENCE_PREFIX) {
        Some(rest) if policy_source.get("policy").is_none() => rest,
        _ => path,
    };
    let mut current = policy_source;
    for segment in path.split('.') {
        let segment = segment.trim();
        if segment.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    scalar_to_string(current)
}

/// Stringifies scalar JSON values (chat ids arrive as strings or integers).
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
