//! `machinactl collect` command.

use std::path::PathBuf;

use clap::Args;
use machina_engine::{collect_targets, ImportFile, RegistryClient};

#[derive(Args)]
pub struct CollectArgs {
    /// Import file describing the product's targets (YAML)
    #[arg(long)]
    pub file: PathBuf,

    /// Destination registry address (e.g., "10.0.2.2:5000")
    #[arg(long)]
    pub repo: String,
}

pub async fn execute(args: CollectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let import = ImportFile::from_file(&args.file)?;
    let client = RegistryClient::connect(&args.repo).await?;

    let targets = collect_targets(&import, &client).await?;
    for target in &targets {
        println!(
            "{}  {}:{}  {} ({} bytes)",
            target.service_name, target.imagepath, target.version, target.digest, target.size
        );
    }
    Ok(())
}
