//! CLI command definitions and dispatch.

mod collect;
mod identity;
mod install;
mod publish;
mod update;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use machina_core::MachineConfig;

/// Machina — trusted install and update for image-based devices.
#[derive(Parser)]
#[command(name = "machinactl", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Initialize the device from a signed install bundle
    Install(install::InstallArgs),
    /// Apply a signed update bundle
    Update(update::UpdateArgs),
    /// Sign and publish an install bundle to a registry
    Publish(publish::PublishArgs),
    /// Copy a product's target images into a registry
    Collect(collect::CollectArgs),
    /// Manage device identities
    Identity(identity::IdentityArgs),
}

/// Machine paths shared by the on-device commands.
#[derive(Args)]
pub struct MachineOpts {
    /// Config directory holding the system manifest
    #[arg(long, default_value = "/config")]
    pub config_dir: PathBuf,

    /// Image store directory
    #[arg(long, default_value = "/image-store")]
    pub store_dir: PathBuf,

    /// Provisioned manifest CA certificate
    #[arg(long, default_value = "/factory/secure/manifestCA.pem")]
    pub ca_path: PathBuf,
}

impl MachineOpts {
    pub(crate) fn to_config(&self) -> MachineConfig {
        MachineConfig::new(&self.config_dir, &self.store_dir, &self.ca_path)
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Install(args) => install::execute(args).await,
        Command::Update(args) => update::execute(args).await,
        Command::Publish(args) => publish::execute(args).await,
        Command::Collect(args) => collect::execute(args).await,
        Command::Identity(args) => identity::execute(args).await,
    }
}
