use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Args;
use tracing::info;

use super::{CliContext, http_dispatcher};
use sheet_dispatch::node::NodeRegistry;
use sheet_dispatch::server::{self, AdminState};

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Listen address; overrides DISPATCH_ADMIN_ADDR
    #[arg(long)]
    pub addr: Option<SocketAddr>,
}

pub async fn execute(args: ServeArgs, context: &CliContext) -> anyhow::Result<()> {
    let settings = context.settings().await?;
    let file = context.dispatchers()?;
    let (dispatcher, reporter) = http_dispatcher();

    let registry = NodeRegistry::from_file(&file, &settings, &context.secrets_manager, dispatcher)
        .await
        .map_err(|e| anyhow!("loading credentials: {e}"))?;
    let registry = Arc::new(registry);
    info!(dispatchers = ?registry.ids(), "dispatchers registered");

    let scheduled = registry.start_all();
    info!(count = scheduled.len(), "start-up dispatches scheduled");

    let addr = args.addr.unwrap_or(settings.admin_addr);
    println!("sheet-dispatch admin on http://{addr}; press Ctrl-C to exit");
    server::serve(addr, AdminState { registry, reporter }).await?;

    info!("admin server stopped");
    Ok(())
}
