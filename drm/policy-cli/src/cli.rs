use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{ApplyCommand, CheckCommand, ShowStateCommand};

/**
    Reconciles DRM license delivery policies for Widevine, PlayReady
    and FairPlay against a media key service.
*/
#[derive(Parser)]
#[command(name = "drm-policy")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile CENC and CBCS policies once and report the result.
    Apply(ApplyCommand),
    /// Validate configuration without touching any service.
    Check(CheckCommand),
    /// Print the contents of a local state file.
    ShowState(ShowStateCommand),
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Apply(cmd) => cmd.run().await,
            Command::Check(cmd) => cmd.run(),
            Command::ShowState(cmd) => cmd.run(),
        }
    }
}
