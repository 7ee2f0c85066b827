#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_access::{
    evaluate_policy_with_env, load_policy_or_fallback, resolve_policy_template, PolicyInput,
    PolicyOwner,
};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let owner = PolicyOwner {
        user_id: Some("1".to_string()),
        private_chat_id: Some("1".to_string()),
    };
    let loaded = load_policy_or_fallback(Some(&raw), &owner);
    if !loaded.policy_ok {
        assert!(loaded.config.document().rules.len() <= 1);
    }

    let input = PolicyInput {
        channel: "telegram".to_string(),
        chat_id: "-100".to_string(),
        chat_type: "group".to_string(),
        is_group: true,
        user_id: "1".to_string(),
        capability: "ops.status".to_string(),
        mentions_bot: false,
        has_reply: false,
    };
    let source = serde_json::json!({"principals": {"owner": {"user_id": "1"}}});
    let resolved = resolve_policy_template(&raw, &source, &|_| None);
    if !raw.contains("${") {
        assert_eq!(resolved.as_deref(), Some(raw.as_ref()));
    }

    let decision = evaluate_policy_with_env(&loaded.config, &input, &|_| None);
    if !loaded.policy_ok {
        assert!(!decision.allowed);
    }
});
