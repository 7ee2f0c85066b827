use std::time::Duration;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use warden_access::{PolicyOwner, PriorityOrder};
use warden_core::{FileLockConfig, LogRotationPolicy};
use warden_router::AppConfig;
use warden_runtime::LimiterConfig;

use crate::cli_args::Cli;

pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

pub(crate) fn fallback_owner(cli: &Cli) -> PolicyOwner {
    PolicyOwner {
        user_id: cli.owner_user_id.clone(),
        private_chat_id: cli.owner_chat_id.clone(),
    }
}

pub(crate) fn priority_order(cli: &Cli) -> Result<PriorityOrder> {
    PriorityOrder::new(cli.priority_levels.iter().map(String::as_str))
        .context("invalid --priority-levels")
}

pub(crate) fn lock_config(cli: &Cli) -> FileLockConfig {
    FileLockConfig {
        acquire_timeout: Duration::from_millis(cli.lock_timeout_ms),
        ..FileLockConfig::default()
    }
}

pub(crate) fn app_config_from_cli(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::new(&cli.storage_dir);
    config.policy_path = cli.policy_path.clone();
    config.capability_registry_path = cli.capability_registry_path.clone();
    config.project_config_path = cli.project_config_path.clone();
    config.fallback_owner = fallback_owner(cli);
    config.priority_order = priority_order(cli)?;
    config.route.bot_usernames = cli.bot_usernames.clone();
    config.route.default_project_id = cli.default_project_id.clone();
    config.route.default_window_spec_id = cli.default_window_spec_id.clone();
    config.limiter = LimiterConfig::new(
        cli.limiter_global_max,
        cli.limiter_module_max,
        Duration::from_millis(cli.operation_timeout_ms),
    );
    config.lock = lock_config(cli);
    config.ledger_rotation = LogRotationPolicy::from_env();
    Ok(config)
}
