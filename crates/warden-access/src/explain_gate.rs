//! Gate for reply/mention-addressed capabilities such as explaining an alert.
//!
//! The three block kinds are separate caller contracts:
//! - `Ignore`: stay silent, the group message was not addressed to the bot.
//! - `Reply`: answer with the carried message (usage nudge or deny text).
//! - `Consume`: swallow the message without any reply.

use serde::Serialize;
use serde_json::{json, Value};

use crate::allowlist::ChatAllowlist;
use crate::policy_config::LoadedPolicy;
use crate::policy_eval::{evaluate_policy_with_env, PolicyInput};

pub const EXPLAIN_REPLY_NUDGE: &str =
    "Reply to the alert you want explained and mention me, e.g. \"@bot explain\".";
pub const EXPLAIN_GENERIC_DENY: &str = "Explain is not available in this chat.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "block", rename_all = "snake_case")]
pub enum ExplainBlock {
    Ignore,
    Reply { message: String },
    Consume,
}

impl ExplainBlock {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Reply { .. } => "reply",
            Self::Consume => "consume",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExplainGateDecision {
    Allowed,
    Blocked(ExplainBlock),
}

impl ExplainGateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn block(&self) -> Option<&ExplainBlock> {
        match self {
            Self::Allowed => None,
            Self::Blocked(block) => Some(block),
        }
    }

    /// `{"allowed":true}` or `{"allowed":false,"block":..,"message"?:..}`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Allowed => json!({"allowed": true}),
            Self::Blocked(ExplainBlock::Reply { message }) => {
                json!({"allowed": false, "block": "reply", "message": message})
            }
            Self::Blocked(block) => json!({"allowed": false, "block": block.as_str()}),
        }
    }

    fn reply(message: impl Into<String>) -> Self {
        Self::Blocked(ExplainBlock::Reply {
            message: message.into(),
        })
    }
}

pub fn check_explain_gate(
    policy: &LoadedPolicy,
    allowlist: &ChatAllowlist,
    input: &PolicyInput,
) -> ExplainGateDecision {
    check_explain_gate_with_env(policy, allowlist, input, &|name| std::env::var(name).ok())
}

pub fn check_explain_gate_with_env(
    policy: &LoadedPolicy,
    allowlist: &ChatAllowlist,
    input: &PolicyInput,
    env: &dyn Fn(&str) -> Option<String>,
) -> ExplainGateDecision {
    let config = policy.config.as_ref();
    if !input.is_group {
        let principals = config.principals();
        let owner = &principals.owner;
        let chat_id = input.chat_id.trim();
        let user_id = input.user_id.trim();
        let owner_chat = owner
            .private_chat_id
            .as_deref()
            .is_some_and(|owner_chat| !chat_id.is_empty() && owner_chat == chat_id);
        let owner_user = owner
            .user_id
            .as_deref()
            .is_some_and(|owner_user| !user_id.is_empty() && owner_user == user_id);
        if owner_chat
            || owner_user
            || allowlist
                .merged_with(&principals.allowlist.chat_ids)
                .contains(chat_id)
        {
            return ExplainGateDecision::Allowed;
        }
        return ExplainGateDecision::Blocked(ExplainBlock::Consume);
    }

    if !policy.policy_ok {
        // Evaluator output is untrusted on the synthetic policy.
        return if input.mentions_bot && allowlist.contains(&input.chat_id) {
            ExplainGateDecision::Allowed
        } else {
            ExplainGateDecision::Blocked(ExplainBlock::Ignore)
        };
    }

    let decision = evaluate_policy_with_env(config, input, env);
    if decision.require.mention_bot_for_explain && !input.mentions_bot {
        return ExplainGateDecision::Blocked(ExplainBlock::Ignore);
    }
    if decision.require.reply_required_for_explain && !input.has_reply {
        return ExplainGateDecision::reply(EXPLAIN_REPLY_NUDGE);
    }
    if !decision.allowed {
        return ExplainGateDecision::reply(
            decision
                .deny_message
                .unwrap_or_else(|| EXPLAIN_GENERIC_DENY.to_string()),
        );
    }
    ExplainGateDecision::Allowed
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::{check_explain_gate_with_env, ExplainBlock, ExplainGateDecision, EXPLAIN_REPLY_NUDGE};
    use crate::allowlist::ChatAllowlist;
    use crate::policy_config::{load_policy_or_fallback, LoadedPolicy, PolicyOwner};
    use crate::policy_eval::PolicyInput;

    const GROUP_ID: &str = "-100200";

    fn group_explain_policy() -> LoadedPolicy {
        let raw = json!({
            "version": 1,
            "principals": {"owner": {"user_id": "1001", "private_chat_id": "1001"}},
            "capabilities": ["alerts.explain", "alerts.query"],
            "rules": [{
                "name": "group_explain",
                "match": {"chat_type": "group", "chat_id": "${ENV:OPS_GROUP}"},
                "allow": ["alerts.explain"],
                "require": {"mention_bot_for_explain": true, "reply_required_for_explain": true}
            }]
        })
        .to_string();
        let loaded = load_policy_or_fallback(Some(&raw), &PolicyOwner::default());
        assert!(loaded.policy_ok);
        loaded
    }

    fn env(name: &str) -> Option<String> {
        BTreeMap::from([("OPS_GROUP", GROUP_ID)])
            .get(name)
            .map(|value| value.to_string())
    }

    fn group(mentions_bot: bool, has_reply: bool) -> PolicyInput {
        PolicyInput {
            channel: "telegram".to_string(),
            chat_id: GROUP_ID.to_string(),
            chat_type: "group".to_string(),
            user_id: "42".to_string(),
            capability: "alerts.explain".to_string(),
            is_group: true,
            mentions_bot,
            has_reply,
        }
    }

    fn private(user_id: &str) -> PolicyInput {
        PolicyInput {
            channel: "telegram".to_string(),
            chat_id: user_id.to_string(),
            chat_type: "private".to_string(),
            user_id: user_id.to_string(),
            capability: "alerts.explain".to_string(),
            is_group: false,
            mentions_bot: false,
            has_reply: false,
        }
    }

    #[test]
    fn functional_group_explain_scenarios_cover_every_block_kind() {
        let policy = group_explain_policy();
        let allowlist = ChatAllowlist::default();
        let check = |input: PolicyInput| check_explain_gate_with_env(&policy, &allowlist, &input, &env);

        let no_mention = check(group(false, true));
        assert_eq!(no_mention, ExplainGateDecision::Blocked(ExplainBlock::Ignore));
        assert_eq!(no_mention.to_json(), json!({"allowed": false, "block": "ignore"}));
        assert_eq!(
            check(group(false, false)),
            ExplainGateDecision::Blocked(ExplainBlock::Ignore)
        );

        let no_reply = check(group(true, false));
        assert_eq!(
            no_reply.to_json(),
            json!({"allowed": false, "block": "reply", "message": EXPLAIN_REPLY_NUDGE})
        );

        assert_eq!(check(group(true, true)), ExplainGateDecision::Allowed);
        assert_eq!(check(private("1001")).to_json(), json!({"allowed": true}));
        assert_eq!(
            check(private("31337")).to_json(),
            json!({"allowed": false, "block": "consume"})
        );
    }

    #[test]
    fn functional_private_branch_accepts_persisted_and_policy_allowlists() {
        let policy = group_explain_policy();
        let mut allowlist = ChatAllowlist::default();
        allowlist.insert("31337");
        assert!(check_explain_gate_with_env(&policy, &allowlist, &private("31337"), &env).is_allowed());

        let raw = json!({
            "principals": {"allowlist": {"chat_ids": [4242]}},
            "rules": []
        })
        .to_string();
        let loaded = load_policy_or_fallback(Some(&raw), &PolicyOwner::default());
        assert!(check_explain_gate_with_env(
            &loaded,
            &ChatAllowlist::default(),
            &private("4242"),
            &env
        )
        .is_allowed());
    }

    #[test]
    fn regression_outright_deny_replies_with_generic_message_in_unmatched_group() {
        let policy = group_explain_policy();
        let mut input = group(true, true);
        input.chat_id = "-999".to_string();
        let decision = check_explain_gate_with_env(&policy, &ChatAllowlist::default(), &input, &env);
        assert_eq!(decision.block().map(ExplainBlock::as_str), Some("reply"));
    }

    #[test]
    fn regression_untrusted_policy_uses_allowlist_and_mention_in_groups() {
        let owner = PolicyOwner {
            user_id: Some("1001".to_string()),
            private_chat_id: None,
        };
        let loaded = load_policy_or_fallback(Some("{broken"), &owner);
        assert!(!loaded.policy_ok);
        let mut allowlist = ChatAllowlist::default();
        assert_eq!(
            check_explain_gate_with_env(&loaded, &allowlist, &group(true, true), &env),
            ExplainGateDecision::Blocked(ExplainBlock::Ignore)
        );
        allowlist.insert(GROUP_ID);
        assert!(check_explain_gate_with_env(&loaded, &allowlist, &group(true, false), &env).is_allowed());
        assert!(check_explain_gate_with_env(&loaded, &allowlist, &private("1001"), &env).is_allowed());
    }
}
