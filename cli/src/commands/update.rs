//! `machinactl update` command.

use clap::Args;
use machina_engine::Machine;

use super::MachineOpts;

#[derive(Args)]
pub struct UpdateArgs {
    /// Update bundle reference (e.g., "10.0.2.2:5000/machine/install:1.0.1")
    pub reference: String,

    #[command(flatten)]
    pub machine: MachineOpts,
}

pub async fn execute(args: UpdateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let machine = Machine::open(args.machine.to_config())?;
    let manifest = machine.update(&args.reference).await?;

    println!(
        "Updated; system now runs {} target(s)",
        manifest.targets.len()
    );
    Ok(())
}
