use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use warden_access::capability::CAPABILITY_ALERTS_EXPLAIN;
use warden_access::{
    check_explain_gate, evaluate_policy, load_policy_file_or_fallback, load_policy_or_fallback,
    ChatAllowlistStore, LoadedPolicy, PolicyInput,
};
use warden_notify::{plan_notify_delivery, resolve_target_overrides, NotifyRequest, TargetOverrides};
use warden_router::{
    derive_request_id, AppContext, HandlerRequest, IntentHandler, MessageEvent, Replier,
    RouteContext, Router,
};

use crate::bootstrap::{app_config_from_cli, fallback_owner, lock_config, priority_order};
use crate::cli_args::{AllowlistAction, Cli, MessageArgs, WardenCommand};

/// Handler and replier for dry runs; inspection never reaches them.
struct DryRun;

#[async_trait]
impl IntentHandler for DryRun {
    async fn handle(&self, _ctx: &RouteContext, request: &HandlerRequest) -> Result<Value> {
        bail!("no handler attached (capability {})", request.capability)
    }
}

#[async_trait]
impl Replier for DryRun {
    async fn reply(&self, _ctx: &RouteContext, _text: &str) -> Result<()> {
        bail!("no reply transport attached")
    }
}

pub(crate) async fn execute_command(cli: &Cli) -> Result<Value> {
    match &cli.command {
        WardenCommand::PolicyEval {
            message,
            capability,
        } => {
            let policy = load_cli_policy(cli);
            let input = policy_input(message, capability);
            let decision = evaluate_policy(&policy.config, &input);
            Ok(json!({
                "policy_ok": policy.policy_ok,
                "issues": policy.issues.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "decision": decision,
            }))
        }
        WardenCommand::ExplainGate { message } => {
            let policy = load_cli_policy(cli);
            let allowlist =
                ChatAllowlistStore::for_storage_dir(&cli.storage_dir, lock_config(cli)).load()?;
            let input = policy_input(message, CAPABILITY_ALERTS_EXPLAIN);
            let decision = check_explain_gate(&policy, &allowlist, &input);
            let mut output = decision.to_json();
            output["policy_ok"] = json!(policy.policy_ok);
            Ok(output)
        }
        WardenCommand::NotifyPlan { request } => {
            let request = read_notify_request(request)?;
            let order = priority_order(cli)?;
            let overrides = match &cli.project_config_path {
                Some(path) => {
                    let raw = std::fs::read_to_string(path).with_context(|| {
                        format!("failed to read project config {}", path.display())
                    })?;
                    let value = serde_json::from_str::<Value>(&raw).with_context(|| {
                        format!("failed to parse project config {}", path.display())
                    })?;
                    resolve_target_overrides(&value, &order)
                }
                None => TargetOverrides::default(),
            };
            let plan = plan_notify_delivery(&request, &order, &overrides);
            Ok(json!({
                "target": plan.target,
                "dropped_overrides": overrides.dropped(),
                "records": plan.audit_records().collect::<Vec<_>>(),
            }))
        }
        WardenCommand::RouteInspect {
            message,
            text,
            reply_to_id,
        } => {
            let app = AppContext::init(app_config_from_cli(cli)?)?;
            let router = Router::new(app, Arc::new(DryRun), Arc::new(DryRun));
            let event = MessageEvent {
                channel: message.channel.clone(),
                chat_id: message.chat_id.clone(),
                chat_type: message.chat_type.clone(),
                user_id: message.user_id.clone(),
                message_id: message.message_id.clone(),
                reply_to_id: reply_to_id.clone(),
                reply_to_text: None,
                text: text.clone(),
                mentions_bot: message.mentions_bot,
            };
            serde_json::to_value(router.inspect(event)).context("failed to render inspection")
        }
        WardenCommand::RequestId {
            channel,
            chat_id,
            message_id,
            attempt,
        } => Ok(json!({
            "request_id": derive_request_id(channel, chat_id, message_id, *attempt),
        })),
        WardenCommand::Allowlist { action } => {
            let store = ChatAllowlistStore::for_storage_dir(&cli.storage_dir, lock_config(cli));
            let changed = match action {
                AllowlistAction::Add { chat_id } => Some(store.add(chat_id).await?),
                AllowlistAction::Remove { chat_id } => Some(store.remove(chat_id).await?),
                AllowlistAction::List => None,
            };
            let allowlist = store.load()?;
            Ok(json!({
                "path": store.path().display().to_string(),
                "changed": changed,
                "chat_ids": allowlist.chat_ids,
            }))
        }
    }
}

fn load_cli_policy(cli: &Cli) -> LoadedPolicy {
    let owner = fallback_owner(cli);
    match &cli.policy_path {
        Some(path) => load_policy_file_or_fallback(path, &owner),
        None => load_policy_or_fallback(None, &owner),
    }
}

fn policy_input(message: &MessageArgs, capability: &str) -> PolicyInput {
    let chat_type = message.chat_type.trim().to_ascii_lowercase();
    PolicyInput {
        channel: message.channel.trim().to_string(),
        chat_id: message.chat_id.trim().to_string(),
        is_group: !chat_type.is_empty() && chat_type != "private",
        chat_type,
        user_id: message.user_id.trim().to_string(),
        capability: capability.to_string(),
        mentions_bot: message.mentions_bot,
        has_reply: message.has_reply,
    }
}

fn read_notify_request(path: &Path) -> Result<NotifyRequest> {
    let raw = if path.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read notify request from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read notify request {}", path.display()))?
    };
    let value = serde_json::from_str::<Value>(&raw).context("notify request is not valid JSON")?;
    if !value.is_object() {
        return Err(anyhow!("notify request must be a JSON object"));
    }
    NotifyRequest::from_value(value).context("notify request does not match the expected shape")
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use serde_json::json;

    use super::execute_command;
    use crate::cli_args::Cli;

    fn cli(storage: &std::path::Path, args: &[&str]) -> Cli {
        let storage = storage.display().to_string();
        let mut argv = vec!["warden", "--storage-dir", storage.as_str()];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[tokio::test]
    async fn functional_policy_eval_reports_fallback_policy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = execute_command(&cli(
            temp.path(),
            &[
                "--owner-user-id",
                "1001",
                "policy-eval",
                "--chat-id",
                "1001",
                "--user-id",
                "1001",
                "--capability",
                "ops.status",
            ],
        ))
        .await
        .expect("policy-eval");
        assert_eq!(output["policy_ok"], false);
        assert_eq!(output["decision"]["allowed"], true);
        assert_eq!(output["decision"]["matched_rule"], "synthetic_owner_private_only");
    }

    #[tokio::test]
    async fn functional_allowlist_add_list_and_explain_gate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let added = execute_command(&cli(temp.path(), &["allowlist", "add", "-100200"]))
            .await
            .expect("add");
        assert_eq!(added["changed"], true);
        let listed = execute_command(&cli(temp.path(), &["allowlist", "list"]))
            .await
            .expect("list");
        assert_eq!(listed["chat_ids"], json!(["-100200"]));

        let gate = execute_command(&cli(
            temp.path(),
            &[
                "explain-gate",
                "--chat-id",
                "-100200",
                "--chat-type",
                "group",
                "--user-id",
                "42",
                "--mentions-bot",
            ],
        ))
        .await
        .expect("explain-gate");
        assert_eq!(gate["allowed"], true);
        assert_eq!(gate["policy_ok"], false);
    }

    #[tokio::test]
    async fn functional_notify_plan_applies_project_overrides() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request_path = temp.path().join("request.json");
        let project_path = temp.path().join("project.json");
        std::fs::write(
            &request_path,
            json!({
                "target": "telegram",
                "chat_ids": [1, "2"],
                "text": "disk",
                "meta": {"delivery_priority": "medium", "global_min_priority": "low"}
            })
            .to_string(),
        )
        .expect("write request");
        std::fs::write(
            &project_path,
            json!({"notify": {"min_priority_by_target": {"telegram": {"2": "high"}}}}).to_string(),
        )
        .expect("write project");
        let output = execute_command(&cli(
            temp.path(),
            &[
                "--project-config-path",
                project_path.to_str().expect("utf8"),
                "notify-plan",
                "--request",
                request_path.to_str().expect("utf8"),
            ],
        ))
        .await
        .expect("notify-plan");
        let records = output["records"].as_array().expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["sent"], true);
        assert_eq!(records[1]["sent"], false);
        assert_eq!(records[1]["skip_reason"], "below_min_priority");
    }

    #[tokio::test]
    async fn integration_route_inspect_and_request_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let inspection = execute_command(&cli(
            temp.path(),
            &[
                "--bot-username",
                "wardenbot",
                "route-inspect",
                "--chat-id",
                "-100200",
                "--chat-type",
                "supergroup",
                "--user-id",
                "42",
                "--message-id",
                "9",
                "--text",
                "@wardenbot /alerts cpu",
            ],
        ))
        .await
        .expect("route-inspect");
        assert_eq!(inspection["context"]["cleaned_text"], "/alerts cpu");
        assert_eq!(inspection["pipeline_matches"][0]["step"], "alert_query_command");

        let id = execute_command(&cli(
            temp.path(),
            &["request-id", "--chat-id", "-100200", "--message-id", "9"],
        ))
        .await
        .expect("request-id");
        assert_eq!(id["request_id"], inspection["request_id"]);
    }
}
