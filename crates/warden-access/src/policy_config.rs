//! Access policy document, validated once at load time.
//!
//! The document is JSON shaped like the YAML policy the operators maintain
//! (YAML-to-JSON conversion happens outside this crate). A document that fails
//! to parse or validate is replaced by a synthetic owner-private-chat-only
//! policy and flagged with `policy_ok = false`; loading never aborts the process.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::policy_template::{contains_template_reference, scalar_to_string, validate_template_syntax};

pub const POLICY_SCHEMA_VERSION: u32 = 1;
pub const ALLOW_ALL_CAPABILITIES: &str = "*";
pub const SYNTHETIC_OWNER_RULE_NAME: &str = "synthetic_owner_private_only";
pub const PRIVATE_CHAT_TYPE: &str = "private";

fn policy_schema_version() -> u32 {
    POLICY_SCHEMA_VERSION
}

fn default_true() -> bool {
    true
}

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

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PolicyOwner {
    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub user_id: Option<String>,
    #[serde(
        default,
        alias = "chat_id",
        deserialize_with = "deserialize_optional_scalar"
    )]
    pub private_chat_id: Option<String>,
}

impl PolicyOwner {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.private_chat_id.is_none()
    }

    /// Fills fields missing on `self` from `other`.
    pub fn or(self, other: &PolicyOwner) -> PolicyOwner {
        PolicyOwner {
            user_id: self.user_id.or_else(|| other.user_id.clone()),
            private_chat_id: self
                .private_chat_id
                .or_else(|| other.private_chat_id.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PolicyPrincipalAllowlist {
    #[serde(default, deserialize_with = "deserialize_scalar_list")]
    pub chat_ids: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_scalar_list")]
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PolicyPrincipals {
    #[serde(default)]
    pub owner: PolicyOwner,
    #[serde(default)]
    pub allowlist: PolicyPrincipalAllowlist,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PolicyRateLimit {
    #[serde(default)]
    pub rpm: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PolicyOutputLimits {
    #[serde(default)]
    pub max_lines: Option<u32>,
    #[serde(default)]
    pub max_chars: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PolicyDefaults {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub rate_limit: PolicyRateLimit,
    #[serde(default)]
    pub output_limits: PolicyOutputLimits,
}

/// Match predicate. `None` fields are wildcards; values may hold template references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PolicyMatch {
    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub channel: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub chat_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub chat_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub capability: Option<String>,
}

impl PolicyMatch {
    pub(crate) fn fields(&self) -> [(&'static str, Option<&str>); 5] {
        [
            ("channel", self.channel.as_deref()),
            ("chat_id", self.chat_id.as_deref()),
            ("chat_type", self.chat_type.as_deref()),
            ("user_id", self.user_id.as_deref()),
            ("capability", self.capability.as_deref()),
        ]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PolicyRequire {
    #[serde(default)]
    pub mention_bot_for_explain: bool,
    #[serde(default)]
    pub reply_required_for_explain: bool,
    #[serde(default)]
    pub mention_bot_for_ops: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyRule {
    pub name: String,
    #[serde(default, rename = "match")]
    pub match_: PolicyMatch,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub require: PolicyRequire,
    #[serde(default)]
    pub rate_limit: Option<PolicyRateLimit>,
    #[serde(default)]
    pub output_limits: Option<PolicyOutputLimits>,
    #[serde(default)]
    pub deny_message: Option<String>,
}

impl PolicyRule {
    pub fn allows(&self, capability: &str) -> bool {
        allow_list_contains(&self.allow, capability)
    }
}

pub(crate) fn allow_list_contains(allow: &[String], capability: &str) -> bool {
    let capability = capability.trim();
    allow
        .iter()
        .any(|entry| entry.trim() == ALLOW_ALL_CAPABILITIES || entry.trim() == capability)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyDocument {
    #[serde(default = "policy_schema_version")]
    pub version: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub principals: PolicyPrincipals,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub default: PolicyDefaults,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Immutable, validated policy plus the raw document used for `${path}` lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    document: PolicyDocument,
    source: Value,
}

impl PolicyConfig {
    pub fn document(&self) -> &PolicyDocument {
        &self.document
    }

    pub fn source(&self) -> &Value {
        &self.source
    }

    pub fn enabled(&self) -> bool {
        self.document.enabled
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.document.rules
    }

    pub fn principals(&self) -> &PolicyPrincipals {
        &self.document.principals
    }

    pub fn defaults(&self) -> &PolicyDefaults {
        &self.document.default
    }
}

/// One validation finding; `code()` is the stable identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyConfigIssue {
    #[error("invalid_json: {0}")]
    InvalidJson(String),
    #[error("unsupported_version: found {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("empty_rule_name: rule #{index} has no name")]
    EmptyRuleName { index: usize },
    #[error("duplicate_rule_name: '{0}' is declared more than once")]
    DuplicateRuleName(String),
    #[error("unknown_capability: {location} references undeclared capability '{capability}'")]
    UnknownCapability {
        location: String,
        capability: String,
    },
    #[error("invalid_template: {location}: {detail}")]
    InvalidTemplate { location: String, detail: String },
    #[error("invalid_limit: {location} must be greater than 0")]
    InvalidLimit { location: String },
}

impl PolicyConfigIssue {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::UnsupportedVersion { .. } => "unsupported_version",
            Self::EmptyRuleName { .. } => "empty_rule_name",
            Self::DuplicateRuleName(_) => "duplicate_rule_name",
            Self::UnknownCapability { .. } => "unknown_capability",
            Self::InvalidTemplate { .. } => "invalid_template",
            Self::InvalidLimit { .. } => "invalid_limit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid policy config ({})", render_issue_codes(.issues))]
pub struct PolicyConfigError {
    pub issues: Vec<PolicyConfigIssue>,
}

impl PolicyConfigError {
    pub fn codes(&self) -> Vec<&'static str> {
        self.issues.iter().map(PolicyConfigIssue::code).collect()
    }
}

fn render_issue_codes(issues: &[PolicyConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn parse_policy_config(raw: &str) -> Result<PolicyConfig, PolicyConfigError> {
    let source = serde_json::from_str::<Value>(raw).map_err(|error| PolicyConfigError {
        issues: vec![PolicyConfigIssue::InvalidJson(error.to_string())],
    })?;
    policy_config_from_value(source)
}

pub fn policy_config_from_value(source: Value) -> Result<PolicyConfig, PolicyConfigError> {
    let document =
        serde_json::from_value::<PolicyDocument>(source.clone()).map_err(|error| {
            PolicyConfigError {
                issues: vec![PolicyConfigIssue::InvalidJson(error.to_string())],
            }
        })?;
    let issues = validate_policy_document(&document);
    if !issues.is_empty() {
        return Err(PolicyConfigError { issues });
    }
    Ok(PolicyConfig { document, source })
}

/// Single validation pass; returns every issue found rather than the first.
pub fn validate_policy_document(document: &PolicyDocument) -> Vec<PolicyConfigIssue> {
    let mut issues = Vec::new();
    if document.version != POLICY_SCHEMA_VERSION {
        issues.push(PolicyConfigIssue::UnsupportedVersion {
            found: document.version,
            expected: POLICY_SCHEMA_VERSION,
        });
    }

    let declared: HashSet<&str> = document.capabilities.iter().map(|c| c.trim()).collect();
    let check_capability = |issues: &mut Vec<PolicyConfigIssue>, location: String, raw: &str| {
        let capability = raw.trim();
        if declared.is_empty()
            || capability == ALLOW_ALL_CAPABILITIES
            || contains_template_reference(capability)
            || declared.contains(capability)
        {
            return;
        }
        issues.push(PolicyConfigIssue::UnknownCapability {
            location,
            capability: capability.to_string(),
        });
    };

    for capability in &document.default.allow {
        check_capability(&mut issues, "default.allow".to_string(), capability);
    }
    check_limits(
        &mut issues,
        "default",
        Some(&document.default.rate_limit),
        Some(&document.default.output_limits),
    );

    let mut seen_names = HashSet::new();
    for (index, rule) in document.rules.iter().enumerate() {
        let name = rule.name.trim();
        if name.is_empty() {
            issues.push(PolicyConfigIssue::EmptyRuleName { index });
        } else if !seen_names.insert(name.to_string()) {
            issues.push(PolicyConfigIssue::DuplicateRuleName(name.to_string()));
        }
        let label = if name.is_empty() {
            format!("rules[{index}]")
        } else {
            format!("rules.{name}")
        };
        for capability in &rule.allow {
            check_capability(&mut issues, format!("{label}.allow"), capability);
        }
        if let Some(capability) = rule.match_.capability.as_deref() {
            check_capability(&mut issues, format!("{label}.match.capability"), capability);
        }
        for (field, value) in rule.match_.fields() {
            let Some(value) = value else {
                continue;
            };
            if let Err(detail) = validate_template_syntax(value) {
                issues.push(PolicyConfigIssue::InvalidTemplate {
                    location: format!("{label}.match.{field}"),
                    detail,
                });
            }
        }
        check_limits(
            &mut issues,
            &label,
            rule.rate_limit.as_ref(),
            rule.output_limits.as_ref(),
        );
    }
    issues
}

fn check_limits(
    issues: &mut Vec<PolicyConfigIssue>,
    label: &str,
    rate_limit: Option<&PolicyRateLimit>,
    output_limits: Option<&PolicyOutputLimits>,
) {
    let candidates = [
        ("rate_limit.rpm", rate_limit.and_then(|limit| limit.rpm)),
        (
            "output_limits.max_lines",
            output_limits.and_then(|limit| limit.max_lines),
        ),
        (
            "output_limits.max_chars",
            output_limits.and_then(|limit| limit.max_chars),
        ),
    ];
    for (field, value) in candidates {
        if value == Some(0) {
            issues.push(PolicyConfigIssue::InvalidLimit {
                location: format!("{label}.{field}"),
            });
        }
    }
}

/// Minimal policy used when the real one cannot be loaded: the owner, in a
/// private chat, may use everything; nothing else is allowed.
pub fn synthetic_owner_policy(owner: &PolicyOwner) -> PolicyConfig {
    let mut rules = Vec::new();
    if !owner.is_empty() {
        rules.push(PolicyRule {
            name: SYNTHETIC_OWNER_RULE_NAME.to_string(),
            match_: PolicyMatch {
                chat_type: Some(PRIVATE_CHAT_TYPE.to_string()),
                user_id: owner.user_id.clone(),
                chat_id: if owner.user_id.is_none() {
                    owner.private_chat_id.clone()
                } else {
                    None
                },
                ..PolicyMatch::default()
            },
            allow: vec![ALLOW_ALL_CAPABILITIES.to_string()],
            require: PolicyRequire::default(),
            rate_limit: None,
            output_limits: None,
            deny_message: None,
        });
    }
    let document = PolicyDocument {
        version: POLICY_SCHEMA_VERSION,
        enabled: true,
        principals: PolicyPrincipals {
            owner: owner.clone(),
            allowlist: PolicyPrincipalAllowlist::default(),
        },
        capabilities: Vec::new(),
        default: PolicyDefaults::default(),
        rules,
    };
    let source = serde_json::to_value(&document).unwrap_or(Value::Null);
    PolicyConfig { document, source }
}

/// Outcome of loading a policy. `policy_ok == false` means `config` is the
/// synthetic fallback and evaluator-driven decisions must not be trusted.
#[derive(Debug, Clone)]
pub struct LoadedPolicy {
    pub config: Arc<PolicyConfig>,
    pub policy_ok: bool,
    pub issues: Vec<PolicyConfigIssue>,
}

impl LoadedPolicy {
    pub fn trusted(config: PolicyConfig) -> Self {
        Self {
            config: Arc::new(config),
            policy_ok: true,
            issues: Vec::new(),
        }
    }
}

/// Parses `raw`, or substitutes the synthetic policy for `fallback_owner`.
///
/// Owner fields missing from `fallback_owner` are taken from the rejected
/// document when it is at least valid JSON.
pub fn load_policy_or_fallback(raw: Option<&str>, fallback_owner: &PolicyOwner) -> LoadedPolicy {
    let Some(raw) = raw else {
        tracing::warn!("policy source missing; using synthetic owner-only policy");
        return fallback_policy(fallback_owner.clone(), Vec::new());
    };
    match parse_policy_config(raw) {
        Ok(config) => LoadedPolicy::trusted(config),
        Err(error) => {
            tracing::warn!(
                codes = ?error.codes(),
                %error,
                "policy rejected; using synthetic owner-only policy"
            );
            let owner = fallback_owner.clone().or(&owner_hint_from_raw(raw));
            fallback_policy(owner, error.issues)
        }
    }
}

pub fn load_policy_file_or_fallback(path: &Path, fallback_owner: &PolicyOwner) -> LoadedPolicy {
    match std::fs::read_to_string(path) {
        Ok(raw) => load_policy_or_fallback(Some(&raw), fallback_owner),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to read policy file");
            load_policy_or_fallback(None, fallback_owner)
        }
    }
}

fn fallback_policy(owner: PolicyOwner, issues: Vec<PolicyConfigIssue>) -> LoadedPolicy {
    LoadedPolicy {
        config: Arc::new(synthetic_owner_policy(&owner)),
        policy_ok: false,
        issues,
    }
}

fn owner_hint_from_raw(raw: &str) -> PolicyOwner {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|value| value.pointer("/principals/owner").cloned())
        .and_then(|owner| serde_json::from_value::<PolicyOwner>(owner).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        load_policy_file_or_fallback, load_policy_or_fallback, parse_policy_config,
        PolicyConfigIssue, PolicyOwner, SYNTHETIC_OWNER_RULE_NAME,
    };

    const VALID_POLICY: &str = r#"{
  "version": 1,
  "enabled": true,
  "principals": {
    "owner": {"user_id": 1001, "private_chat_id": "1001"},
    "allowlist": {"chat_ids": [-100200]}
  },
  "capabilities": ["alerts.explain", "alerts.query", "ops.status"],
  "default": {
    "allow": ["alerts.query"],
    "rate_limit": {"rpm": 20},
    "output_limits": {"max_lines": 40, "max_chars": 3000}
  },
  "rules": [
    {
      "name": "group_explain",
      "match": {"chat_type": "group", "chat_id": "${ENV:OPS_GROUP}"},
      "allow": ["alerts.explain"],
      "require": {"mention_bot_for_explain": true, "reply_required_for_explain": true},
      "deny_message": "explain is not enabled here"
    }
  ]
}"#;

    #[test]
    fn unit_parse_policy_config_accepts_numeric_ids_and_defaults() {
        let config = parse_policy_config(VALID_POLICY).expect("valid policy");
        assert!(config.enabled());
        assert_eq!(
            config.principals().owner.user_id.as_deref(),
            Some("1001")
        );
        assert_eq!(config.principals().allowlist.chat_ids, vec!["-100200"]);
        assert_eq!(config.rules()[0].match_.chat_id.as_deref(), Some("${ENV:OPS_GROUP}"));
        assert!(config.rules()[0].require.mention_bot_for_explain);
        assert!(!config.rules()[0].require.mention_bot_for_ops);
        assert_eq!(config.defaults().rate_limit.rpm, Some(20));
    }

    #[test]
    fn functional_validation_enumerates_every_issue_code() {
        let raw = json!({
            "version": 2,
            "capabilities": ["alerts.explain"],
            "default": {"allow": ["ops.status"], "rate_limit": {"rpm": 0}},
            "rules": [
                {"name": "a", "allow": ["alerts.explain"]},
                {"name": "a", "allow": ["*"]},
                {"name": " ", "match": {"chat_id": "${ENV:}"}}
            ]
        })
        .to_string();
        let error = parse_policy_config(&raw).expect_err("invalid policy");
        assert_eq!(
            error.codes(),
            vec![
                "unsupported_version",
                "unknown_capability",
                "invalid_limit",
                "duplicate_rule_name",
                "empty_rule_name",
                "invalid_template",
            ]
        );
        assert!(error.to_string().contains("unsupported_version"));
    }

    #[test]
    fn functional_unparsable_policy_falls_back_to_synthetic_owner_policy() {
        let fallback_owner = PolicyOwner {
            user_id: Some("1001".to_string()),
            private_chat_id: None,
        };
        let loaded = load_policy_or_fallback(Some("{not json"), &fallback_owner);
        assert!(!loaded.policy_ok);
        assert!(matches!(loaded.issues[0], PolicyConfigIssue::InvalidJson(_)));
        let rules = loaded.config.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, SYNTHETIC_OWNER_RULE_NAME);
        assert_eq!(rules[0].match_.chat_type.as_deref(), Some("private"));
        assert_eq!(rules[0].match_.user_id.as_deref(), Some("1001"));
        assert!(loaded.config.defaults().allow.is_empty());
    }

    #[test]
    fn integration_rejected_document_still_contributes_owner_hint() {
        let raw = json!({
            "version": 9,
            "principals": {"owner": {"user_id": "55", "chat_id": "55"}}
        })
        .to_string();
        let loaded = load_policy_or_fallback(Some(&raw), &PolicyOwner::default());
        assert!(!loaded.policy_ok);
        assert_eq!(loaded.config.principals().owner.user_id.as_deref(), Some("55"));
        assert_eq!(
            loaded.config.principals().owner.private_chat_id.as_deref(),
            Some("55")
        );
    }

    #[test]
    fn regression_missing_policy_file_never_fails_and_owner_less_fallback_allows_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded =
            load_policy_file_or_fallback(&temp.path().join("policy.json"), &PolicyOwner::default());
        assert!(!loaded.policy_ok);
        assert!(loaded.config.rules().is_empty());
        assert!(loaded.config.defaults().allow.is_empty());
    }
}
