//! `machinactl publish` command.

use std::path::PathBuf;

use clap::Args;
use machina_engine::{ImportFile, Publisher, RegistryClient, RegistryRef};

#[derive(Args)]
pub struct PublishArgs {
    /// Import file describing the product's targets (YAML)
    #[arg(long)]
    pub file: PathBuf,

    /// PKCS#8 PEM manifest signing key
    #[arg(long)]
    pub key: PathBuf,

    /// Certificate for the signing key
    #[arg(long)]
    pub cert: PathBuf,

    /// Destination registry address (e.g., "10.0.2.2:5000")
    #[arg(long)]
    pub repo: String,

    /// Destination path (e.g., "machine/install:1.0.0")
    #[arg(long)]
    pub dest_path: String,
}

pub async fn execute(args: PublishArgs) -> Result<(), Box<dyn std::error::Error>> {
    let import = ImportFile::from_file(&args.file)?;
    let dest = RegistryRef::parse(&format!("{}/{}", args.repo, args.dest_path))?;
    let client = RegistryClient::connect(&dest.addr).await?;

    let publisher = Publisher::new(&args.key, &args.cert);
    let pushed = publisher
        .publish(&import, &client, &dest.name, &dest.tag)
        .await?;

    println!("Published {} ({})", dest, pushed.digest);
    Ok(())
}
