//! `machinactl install` command.

use std::path::PathBuf;

use clap::Args;
use machina_engine::{ImportSource, Machine, RegistryClient, RegistryRef};

use super::MachineOpts;

#[derive(Args)]
pub struct InstallArgs {
    /// Install bundle reference (e.g., "10.0.2.2:5000/machine/install:1.0.0")
    pub reference: String,

    /// Read the bundle from this directory (install media) instead of the
    /// registry; target images are still imported from the registry
    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    #[command(flatten)]
    pub machine: MachineOpts,
}

pub async fn execute(args: InstallArgs) -> Result<(), Box<dyn std::error::Error>> {
    let machine = Machine::open(args.machine.to_config())?;

    let manifest = match args.source_dir {
        Some(dir) => {
            let source = ImportSource::from_files(
                &dir.join("install.json"),
                &dir.join("manifestCert.pem"),
                &dir.join("install.json.signed"),
            )?;
            let reference = RegistryRef::parse(&args.reference)?;
            let client = RegistryClient::connect(&reference.addr).await?;
            machine.install_from_source(&client, &source).await?
        }
        None => machine.install(&args.reference).await?,
    };

    println!(
        "Installed {} target(s) from {}",
        manifest.targets.len(),
        args.reference
    );
    Ok(())
}
