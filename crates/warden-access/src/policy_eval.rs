use serde::Serialize;
use serde_json::{json, Value};

use crate::capability::{capability_family, CapabilityFamily};
use crate::policy_config::{
    allow_list_contains, PolicyConfig, PolicyMatch, PolicyOutputLimits, PolicyRateLimit,
    PolicyRequire, PolicyRule,
};
use crate::policy_template::resolve_policy_template;

pub const POLICY_DECISION_RECORD_TYPE: &str = "policy_decision";

/// Identity and addressing facts for one inbound message, plus the capability
/// being requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicyInput {
    pub channel: String,
    pub chat_id: String,
    pub chat_type: String,
    pub user_id: String,
    pub capability: String,
    pub is_group: bool,
    pub mentions_bot: bool,
    pub has_reply: bool,
}

impl PolicyInput {
    pub fn with_capability(&self, capability: &str) -> Self {
        Self {
            capability: capability.to_string(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDenyReason {
    NotAllowed,
    MissingMention,
    MissingReply,
}

impl PolicyDenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotAllowed => "not_allowed",
            Self::MissingMention => "missing_mention",
            Self::MissingReply => "missing_reply",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PolicyLimits {
    pub rpm: Option<u32>,
    pub max_lines: Option<u32>,
    pub max_chars: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub deny_message: Option<String>,
    pub limits: PolicyLimits,
    pub require: PolicyRequire,
    pub reason: Option<PolicyDenyReason>,
    pub matched_rule: Option<String>,
}

impl PolicyDecision {
    fn denied(reason: PolicyDenyReason, limits: PolicyLimits) -> Self {
        Self {
            allowed: false,
            deny_message: None,
            limits,
            require: PolicyRequire::default(),
            reason: Some(reason),
            matched_rule: None,
        }
    }
}

/// Evaluates `input` against `config`, reading `${ENV:NAME}` references from
/// the process environment.
pub fn evaluate_policy(config: &PolicyConfig, input: &PolicyInput) -> PolicyDecision {
    evaluate_policy_with_env(config, input, &|name| std::env::var(name).ok())
}

/// First matching rule in declaration order decides; otherwise `default.allow`.
pub fn evaluate_policy_with_env(
    config: &PolicyConfig,
    input: &PolicyInput,
    env: &dyn Fn(&str) -> Option<String>,
) -> PolicyDecision {
    let default_limits = limits_from(
        &config.defaults().rate_limit,
        &config.defaults().output_limits,
    );
    if !config.enabled() {
        return PolicyDecision::denied(PolicyDenyReason::NotAllowed, default_limits);
    }

    let Some(rule) = config
        .rules()
        .iter()
        .find(|rule| rule_matches(&rule.match_, input, config.source(), env))
    else {
        let allowed = allow_list_contains(&config.defaults().allow, &input.capability);
        return PolicyDecision {
            allowed,
            deny_message: None,
            limits: default_limits,
            require: PolicyRequire::default(),
            reason: (!allowed).then_some(PolicyDenyReason::NotAllowed),
            matched_rule: None,
        };
    };

    let limits = effective_limits(rule, default_limits);
    if !rule.allows(&input.capability) {
        return PolicyDecision {
            allowed: false,
            deny_message: rule
                .deny_message
                .as_deref()
                .map(str::trim)
                .filter(|message| !message.is_empty())
                .map(str::to_string),
            limits,
            require: rule.require,
            reason: Some(PolicyDenyReason::NotAllowed),
            matched_rule: Some(rule.name.clone()),
        };
    }

    let reason = precondition_failure(&rule.require, input);
    PolicyDecision {
        allowed: reason.is_none(),
        deny_message: None,
        limits,
        require: rule.require,
        reason,
        matched_rule: Some(rule.name.clone()),
    }
}

fn rule_matches(
    predicate: &PolicyMatch,
    input: &PolicyInput,
    policy_source: &Value,
    env: &dyn Fn(&str) -> Option<String>,
) -> bool {
    predicate.fields().into_iter().all(|(field, expected)| {
        let Some(expected) = expected else {
            return true;
        };
        let Some(expected) = resolve_policy_template(expected, policy_source, env) else {
            return false;
        };
        let expected = expected.trim();
        let actual = match field {
            "channel" => input.channel.as_str(),
            "chat_id" => input.chat_id.as_str(),
            "chat_type" => input.chat_type.as_str(),
            "user_id" => input.user_id.as_str(),
            _ => input.capability.as_str(),
        };
        if field == "capability" && expected == crate::policy_config::ALLOW_ALL_CAPABILITIES {
            return true;
        }
        expected == actual.trim()
    })
}

/// Group-chat preconditions only; private chats have nobody else to address.
fn precondition_failure(require: &PolicyRequire, input: &PolicyInput) -> Option<PolicyDenyReason> {
    if !input.is_group {
        return None;
    }
    match capability_family(&input.capability) {
        CapabilityFamily::Explain => {
            if require.mention_bot_for_explain && !input.mentions_bot {
                Some(PolicyDenyReason::MissingMention)
            } else if require.reply_required_for_explain && !input.has_reply {
                Some(PolicyDenyReason::MissingReply)
            } else {
                None
            }
        }
        CapabilityFamily::Ops if require.mention_bot_for_ops && !input.mentions_bot => {
            Some(PolicyDenyReason::MissingMention)
        }
        _ => None,
    }
}

fn limits_from(rate_limit: &PolicyRateLimit, output_limits: &PolicyOutputLimits) -> PolicyLimits {
    PolicyLimits {
        rpm: rate_limit.rpm,
        max_lines: output_limits.max_lines,
        max_chars: output_limits.max_chars,
    }
}

fn effective_limits(rule: &PolicyRule, defaults: PolicyLimits) -> PolicyLimits {
    PolicyLimits {
        rpm: rule
            .rate_limit
            .and_then(|limit| limit.rpm)
            .or(defaults.rpm),
        max_lines: rule
            .output_limits
            .and_then(|limit| limit.max_lines)
            .or(defaults.max_lines),
        max_chars: rule
            .output_limits
            .and_then(|limit| limit.max_chars)
            .or(defaults.max_chars),
    }
}

pub fn policy_decision_ledger_record(input: &PolicyInput, decision: &PolicyDecision) -> Value {
    json!({
        "record_type": POLICY_DECISION_RECORD_TYPE,
        "channel": input.channel,
        "chat_id": input.chat_id,
        "chat_type": input.chat_type,
        "user_id": input.user_id,
        "capability": input.capability,
        "allowed": decision.allowed,
        "reason": decision.reason.map(PolicyDenyReason::as_str),
        "matched_rule": decision.matched_rule,
        "limits": decision.limits,
    })
}
