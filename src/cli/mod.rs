use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};

pub mod dispatch;
pub mod fetch;
pub mod push;
pub mod schema;
pub mod secrets;
pub mod serve;

use dispatch::DispatchArgs;
use fetch::FetchArgs;
use push::PushArgs;
use schema::SchemaArgs;
use secrets::SecretArgs;
use serve::ServeArgs;

use sheet_dispatch::{
    config::{ConfigManager, DispatchersFile, Settings},
    dispatch::Dispatcher,
    node::DispatcherNode,
    secret::SecretsManager,
    status::MemoryReporter,
    transport::HttpTransport,
};

pub const DISPATCHERS_FILE: &str = "dispatchers.yaml";

#[derive(Parser, Debug)]
#[command(
    name = "sheet-dispatch",
    about = "Dispatch a Node-RED sheet and its subflows to another runtime",
    version
)]
pub struct Cli {
    /// Log level filter (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// OpenTelemetry endpoint (e.g. http://localhost:4317)
    #[arg(long, global = true)]
    pub otel_endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch, prune and push one configured sheet
    Dispatch(DispatchArgs),

    /// Fetch and prune only, writing the sheet as JSON
    Fetch(FetchArgs),

    /// Push a previously fetched sheet
    Push(PushArgs),

    /// Run the admin server and the start-up dispatches
    Serve(ServeArgs),

    /// Emit the JSON schema of dispatchers.yaml
    Schema(SchemaArgs),

    /// Handle dispatcher credentials
    Secrets(SecretArgs),
}

#[derive(Clone)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
    pub secrets_manager: SecretsManager,
}

impl CliContext {
    pub fn new(
        root: PathBuf,
        config_manager: ConfigManager,
        secrets_manager: SecretsManager,
    ) -> Self {
        Self {
            root,
            config_manager,
            secrets_manager,
        }
    }

    pub async fn settings(&self) -> anyhow::Result<Settings> {
        Settings::load(&self.config_manager)
            .await
            .context("invalid configuration")
    }

    pub fn dispatchers(&self) -> anyhow::Result<DispatchersFile> {
        let path = self.root.join(DISPATCHERS_FILE);
        DispatchersFile::load(&path).with_context(|| format!("loading {}", path.display()))
    }

    /// The configured dispatcher `id`, with its credentials.
    pub async fn node(&self, id: &str, settings: &Settings) -> anyhow::Result<DispatcherNode> {
        let file = self.dispatchers()?;
        let config = file
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("no dispatcher `{id}` in {DISPATCHERS_FILE}"))?;
        let credentials = if config.auth {
            self.secrets_manager
                .credentials_for(id)
                .await
                .map_err(|e| anyhow!("credentials for `{id}`: {e}"))?
        } else {
            Default::default()
        };
        Ok(DispatcherNode::new(config, settings, credentials))
    }
}

/// A dispatcher over real HTTP whose reports stay inspectable.
pub fn http_dispatcher() -> (Dispatcher, Arc<MemoryReporter>) {
    let reporter = Arc::new(MemoryReporter::new());
    let dispatcher = Dispatcher::new(Arc::new(HttpTransport::new()), reporter.clone());
    (dispatcher, reporter)
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Dispatch(args) => dispatch::execute(args, context).await,
        Commands::Fetch(args) => fetch::execute(args, context).await,
        Commands::Push(args) => push::execute(args, context).await,
        Commands::Serve(args) => serve::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
        Commands::Secrets(args) => secrets::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Serve(ServeArgs::default())
}
