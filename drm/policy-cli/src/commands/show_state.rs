use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use drm_policy::MemoryService;

/**
    Print the policies and keys held in a local state file.
    Key values are never printed.
*/
#[derive(Args, Debug)]
pub struct ShowStateCommand {
    /// State file written by `apply --state`.
    pub state: PathBuf,
}

impl ShowStateCommand {
    pub fn run(self) -> Result<()> {
        let json = std::fs::read_to_string(&self.state)
            .with_context(|| format!("failed to read {}", self.state.display()))?;
        let service = MemoryService::from_json(&json).context("failed to parse state file")?;
        let state = service.snapshot();

        println!("Key delivery host: {}", state.key_delivery_host());

        println!();
        println!("Authorization policies:");
        for name in state.authorization_policy_names() {
            let Some(policy) = service.authorization_policy(name) else {
                continue;
            };
            println!("  {} ({})", policy.name, policy.id);
            for option in &policy.options {
                println!(
                    "    {} option {} ({}), {} restriction(s)",
                    option.mechanism,
                    option.name,
                    option.id,
                    option.restrictions.len()
                );
            }
        }

        println!();
        println!("Delivery policies:");
        for policy in state.delivery_policies() {
            println!(
                "  {} ({}): {} for {}",
                policy.name, policy.id, policy.policy_type, policy.protocols
            );
            for (key, value) in &policy.configuration {
                println!("    {key}: {value}");
            }
        }

        println!();
        println!("Content keys:");
        for key in state.content_keys() {
            println!("  {} {} ({})", key.id, key.name, key.key_type);
        }

        Ok(())
    }
}
