//! `machinactl identity` command.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use machina_engine::TrustDir;
use uuid::Uuid;

#[derive(Args)]
pub struct IdentityArgs {
    /// Trust keystore location (defaults to the per-user data dir)
    #[arg(long)]
    pub trust_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: IdentityCommand,
}

#[derive(Subcommand)]
pub enum IdentityCommand {
    /// List keysets, a keyset's projects, or a project's devices
    List {
        keyset: Option<String>,
        project: Option<String>,
    },
    /// Issue a new device identity under a project
    Add {
        keyset: String,
        project: String,
        /// Device UUID; generated when omitted
        uuid: Option<Uuid>,
    },
}

pub async fn execute(args: IdentityArgs) -> Result<(), Box<dyn std::error::Error>> {
    let trust = match args.trust_dir {
        Some(dir) => TrustDir::new(dir),
        None => TrustDir::default_location()?,
    };

    match args.command {
        IdentityCommand::List { keyset, project } => {
            let names = match (&keyset, &project) {
                (None, _) => trust.keysets()?,
                (Some(keyset), None) => trust.projects(keyset)?,
                (Some(keyset), Some(project)) => trust.devices(keyset, project)?,
            };
            for name in names {
                println!("{name}");
            }
        }
        IdentityCommand::Add {
            keyset,
            project,
            uuid,
        } => {
            let identity = trust.add_device(&keyset, &project, uuid)?;
            println!("{}", identity.uuid);
            println!("  {}", identity.dir.display());
        }
    }

    Ok(())
}
