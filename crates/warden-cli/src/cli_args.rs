use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "warden",
    about = "Policy-gated intent routing and priority notification gating",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "WARDEN_STORAGE_DIR",
        default_value = ".warden",
        global = true,
        help = "Directory holding the ledger, allow-list, task cache and chat state"
    )]
    pub storage_dir: PathBuf,

    #[arg(
        long,
        env = "WARDEN_POLICY_PATH",
        global = true,
        help = "Policy document (JSON). Missing or invalid falls back to the owner-only policy"
    )]
    pub policy_path: Option<PathBuf>,

    #[arg(
        long,
        env = "WARDEN_CAPABILITY_REGISTRY_PATH",
        global = true,
        help = "Capability toggle registry (JSON), polled for changes"
    )]
    pub capability_registry_path: Option<PathBuf>,

    #[arg(
        long,
        env = "WARDEN_PROJECT_CONFIG_PATH",
        global = true,
        help = "Project config (JSON) carrying notify.min_priority_* overrides"
    )]
    pub project_config_path: Option<PathBuf>,

    #[arg(
        long,
        env = "WARDEN_PRIORITY_LEVELS",
        value_delimiter = ',',
        default_value = "low,medium,high,critical",
        global = true,
        help = "Priority levels, lowest first"
    )]
    pub priority_levels: Vec<String>,

    #[arg(
        long,
        env = "WARDEN_OWNER_USER_ID",
        global = true,
        help = "Owner user id used by the fallback policy"
    )]
    pub owner_user_id: Option<String>,

    #[arg(
        long,
        env = "WARDEN_OWNER_CHAT_ID",
        global = true,
        help = "Owner private chat id used by the fallback policy"
    )]
    pub owner_chat_id: Option<String>,

    #[arg(
        long = "bot-username",
        env = "WARDEN_BOT_USERNAMES",
        value_delimiter = ',',
        global = true,
        help = "Bot usernames stripped from addressed group messages"
    )]
    pub bot_usernames: Vec<String>,

    #[arg(long, env = "WARDEN_DEFAULT_PROJECT_ID", global = true)]
    pub default_project_id: Option<String>,

    #[arg(long, env = "WARDEN_DEFAULT_WINDOW_SPEC_ID", global = true)]
    pub default_window_spec_id: Option<String>,

    #[arg(
        long,
        env = "WARDEN_LIMITER_GLOBAL_MAX",
        default_value_t = 4,
        value_parser = parse_positive_usize,
        global = true,
        help = "Concurrent limited operations across all modules"
    )]
    pub limiter_global_max: usize,

    #[arg(
        long,
        env = "WARDEN_LIMITER_MODULE_MAX",
        default_value_t = 2,
        value_parser = parse_positive_usize,
        global = true,
        help = "Concurrent limited operations per module"
    )]
    pub limiter_module_max: usize,

    #[arg(
        long,
        env = "WARDEN_OPERATION_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        global = true
    )]
    pub operation_timeout_ms: u64,

    #[arg(
        long,
        env = "WARDEN_LOCK_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        global = true,
        help = "Upper bound on waiting for a durable state lock"
    )]
    pub lock_timeout_ms: u64,

    #[command(subcommand)]
    pub command: WardenCommand,
}

#[derive(Debug, Subcommand)]
pub enum WardenCommand {
    /// Evaluate the policy for one message and capability.
    PolicyEval {
        #[command(flatten)]
        message: MessageArgs,
        #[arg(long)]
        capability: String,
    },
    /// Run the explain/resolve gate for one message.
    ExplainGate {
        #[command(flatten)]
        message: MessageArgs,
    },
    /// Print the gate audit records a notify request would produce.
    NotifyPlan {
        /// Notify request JSON file, or `-` for stdin.
        #[arg(long)]
        request: PathBuf,
    },
    /// Show how a message would route without executing anything.
    RouteInspect {
        #[command(flatten)]
        message: MessageArgs,
        #[arg(long)]
        text: String,
        #[arg(long)]
        reply_to_id: Option<String>,
    },
    /// Derive the deterministic request id for a message.
    RequestId {
        #[arg(long, default_value = "telegram")]
        channel: String,
        #[arg(long, allow_hyphen_values = true)]
        chat_id: String,
        #[arg(long)]
        message_id: String,
        #[arg(long, default_value_t = 0)]
        attempt: u32,
    },
    /// Manage the persisted chat allow-list.
    Allowlist {
        #[command(subcommand)]
        action: AllowlistAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum AllowlistAction {
    Add {
        #[arg(allow_hyphen_values = true)]
        chat_id: String,
    },
    Remove {
        #[arg(allow_hyphen_values = true)]
        chat_id: String,
    },
    List,
}

#[derive(Debug, Clone, Args)]
pub struct MessageArgs {
    #[arg(long, default_value = "telegram")]
    pub channel: String,
    #[arg(long, allow_hyphen_values = true)]
    pub chat_id: String,
    #[arg(long, default_value = "private")]
    pub chat_type: String,
    #[arg(long)]
    pub user_id: String,
    #[arg(long)]
    pub message_id: Option<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    pub mentions_bot: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    pub has_reply: bool,
}
