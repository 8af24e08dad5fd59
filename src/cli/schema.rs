use std::fs;

use clap::Args;

use super::CliContext;
use sheet_dispatch::config::DispatchersFile;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Print to stdout instead of `<root>/schemas`
    #[arg(long, default_value_t = false)]
    pub stdout: bool,
}

pub async fn execute(args: SchemaArgs, context: &CliContext) -> anyhow::Result<()> {
    let schema = DispatchersFile::schema()?;
    if args.stdout {
        println!("{schema}");
        return Ok(());
    }

    let out_dir = context.root.join("schemas");
    fs::create_dir_all(&out_dir)?;
    let path = out_dir.join("dispatchers.schema.json");
    fs::write(&path, schema)?;
    println!("Schema written to {}", path.display());
    Ok(())
}
