use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use sheet_dispatch::prune::PruneMode;

use super::{CliContext, http_dispatcher};

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Dispatcher id from dispatchers.yaml
    pub id: String,

    /// Write the pruned sheet here instead of stdout
    #[arg(long, short)]
    pub out: Option<PathBuf>,

    /// Copy the sheet as is, without relay rewiring
    #[arg(long)]
    pub plain: bool,
}

pub async fn execute(args: FetchArgs, context: &CliContext) -> anyhow::Result<()> {
    let settings = context.settings().await?;
    let node = context.node(&args.id, &settings).await?;
    let (dispatcher, reporter) = http_dispatcher();

    let mut target = node.target().clone();
    if args.plain {
        target = target.with_mode(PruneMode::Plain);
    }

    let sheet = match dispatcher.fetch_sheet(&target).await {
        Ok(sheet) => sheet,
        Err(e) => {
            if let Some(out) = reporter.last_output(&args.id) {
                eprintln!("{}", out.payload);
            }
            return Err(e.into());
        }
    };

    let json = serde_json::to_string_pretty(&sheet.nodes)?;
    match args.out {
        Some(path) => {
            fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
            println!("Sheet `{}` written to {}", node.config().sheet, path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
