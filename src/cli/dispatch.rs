use clap::Args;
use tracing::info;

use sheet_dispatch::prune::PruneMode;

use super::{CliContext, http_dispatcher};

#[derive(Args, Debug)]
pub struct DispatchArgs {
    /// Dispatcher id from dispatchers.yaml
    pub id: String,

    /// Copy the sheet as is, without relay rewiring
    #[arg(long)]
    pub plain: bool,
}

pub async fn execute(args: DispatchArgs, context: &CliContext) -> anyhow::Result<()> {
    let settings = context.settings().await?;
    let node = context.node(&args.id, &settings).await?;
    let (dispatcher, reporter) = http_dispatcher();

    info!(node = %args.id, sheet = %node.config().sheet, "dispatching");
    let result = if args.plain {
        let target = node.target().clone().with_mode(PruneMode::Plain);
        dispatcher.dispatch(&target).await
    } else {
        node.trigger(&dispatcher).await
    };

    if let Some(out) = reporter.last_output(&args.id) {
        println!("{}", out.payload);
    }
    let report = result?;
    info!(
        url = %report.destination_url,
        elapsed_ms = (report.finished - report.started).num_milliseconds(),
        "dispatch finished"
    );
    Ok(())
}
