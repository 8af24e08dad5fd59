use std::{env, path::PathBuf, process};

use clap::Parser;
use tracing::error;

use sheet_dispatch::{
    config::{ConfigManager, EnvConfigManager},
    logger::{LogConfig, init_tracing},
    secret::{EnvSecretsManager, SecretsManager},
};

mod cli;

use cli::{Cli, CliContext, default_command, execute};

/// Resolve the root directory from the environment or use the default.
fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("DISPATCH_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./sheet-dispatch")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();

    let log_config = LogConfig::new(
        cli.log_level.clone(),
        Some(root.join("logs")),
        cli.otel_endpoint.clone(),
    );
    let telemetry = init_tracing(&log_config)?;

    let config_manager = ConfigManager(EnvConfigManager::new(root.join("config").join(".env")));
    let secrets_manager = SecretsManager(EnvSecretsManager::new(Some(root.join("secrets"))));
    let context = CliContext::new(root, config_manager, secrets_manager);

    let result = execute(&context, cli.command.unwrap_or_else(default_command)).await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    telemetry.shutdown();

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
    Ok(())
}
