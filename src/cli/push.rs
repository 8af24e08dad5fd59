use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use super::{CliContext, http_dispatcher};
use sheet_dispatch::{graph::ConfigGraph, prune::PrunedSheet};

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Dispatcher id from dispatchers.yaml; selects destination and auth
    pub id: String,

    /// Sheet written by `fetch`
    pub file: PathBuf,
}

pub async fn execute(args: PushArgs, context: &CliContext) -> anyhow::Result<()> {
    let settings = context.settings().await?;
    let node = context.node(&args.id, &settings).await?;

    let body = fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let sheet = PrunedSheet::from_graph(ConfigGraph::from_json(&body)?)
        .with_context(|| format!("{} is not a fetched sheet", args.file.display()))?;

    let (dispatcher, reporter) = http_dispatcher();
    let result = dispatcher.push_flows(node.target(), &sheet).await;
    if let Some(out) = reporter.last_output(&args.id) {
        println!("{}", out.payload);
    }
    result?;
    Ok(())
}
