//! Access decisions for inbound chat traffic.
//!
//! Holds the priority ranking shared with the notify gate, the validated
//! policy document and its evaluator, the persisted chat allow-list and the
//! explain/resolve gate built on top of them.

pub mod allowlist;
pub mod capability;
pub mod explain_gate;
pub mod policy_config;
pub mod policy_eval;
pub mod policy_template;
pub mod priority;

pub use allowlist::{
    allowlist_path_for_storage_dir, load_chat_allowlist, save_chat_allowlist, ChatAllowlist,
    ChatAllowlistStore, ALLOWLIST_SCHEMA_VERSION,
};
pub use capability::{capability_family, Capability, CapabilityFamily};
pub use explain_gate::{
    check_explain_gate, check_explain_gate_with_env, ExplainBlock, ExplainGateDecision,
};
pub use policy_config::{
    load_policy_file_or_fallback, load_policy_or_fallback, parse_policy_config,
    policy_config_from_value, synthetic_owner_policy, validate_policy_document, LoadedPolicy,
    PolicyConfig, PolicyConfigError, PolicyConfigIssue, PolicyDocument, PolicyOwner, PolicyRequire,
    PolicyRule,
};
pub use policy_eval::{
    evaluate_policy, evaluate_policy_with_env, policy_decision_ledger_record, PolicyDecision,
    PolicyDenyReason, PolicyInput, PolicyLimits,
};
pub use policy_template::resolve_policy_template;
pub use priority::{
    max_priority_level, PriorityLevel, PriorityOrder, PriorityOrderError, DEFAULT_PRIORITY_LEVELS,
    UNKNOWN_PRIORITY_RANK,
};
