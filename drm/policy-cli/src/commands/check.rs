use anyhow::{Context, Result};
use clap::Args;

use drm_policy::{DeliveryMechanism, Scheme, build_restriction};

use super::settings::ConfigArgs;

/**
    Resolve configuration and build the JWT restriction without calling
    any service, then print what `apply` would reconcile.
*/
#[derive(Args, Debug)]
pub struct CheckCommand {
    #[command(flatten)]
    config: ConfigArgs,
}

impl CheckCommand {
    pub fn run(self) -> Result<()> {
        let config = self.config.load()?;
        let restriction = build_restriction(
            &config.jwt.verification_key,
            &config.jwt.audience,
            &config.jwt.issuer,
        )
        .context("failed to build JWT restriction")?;

        println!("Restriction:   {}", restriction.name());
        println!("  Issuer:      {}", config.jwt.issuer);
        println!("  Audience:    {}", config.jwt.audience);

        let cenc = &config.cenc;
        println!();
        println!("{} ({}):", Scheme::Cenc, Scheme::Cenc.protocols());
        println!("  Authorization policy: {}", cenc.authorization_policy_name);
        println!(
            "  {} option: {} (template {} bytes)",
            DeliveryMechanism::Widevine,
            cenc.widevine_option_name,
            cenc.widevine_template.len()
        );
        println!(
            "  {} option: {} (template {} bytes)",
            DeliveryMechanism::PlayReady,
            cenc.playready_option_name,
            cenc.playready_template.len()
        );
        println!("  Delivery policy: {}", cenc.delivery_policy_name);

        println!();
        match &config.cbcs {
            Some(cbcs) => {
                println!("{} ({}):", Scheme::Cbcs, Scheme::Cbcs.protocols());
                println!("  Authorization policy: {}", cbcs.authorization_policy_name);
                println!(
                    "  {} option: {} (certificate {} bytes)",
                    DeliveryMechanism::FairPlay,
                    cbcs.option_name,
                    cbcs.certificate.len()
                );
                println!("  Delivery policy: {}", cbcs.delivery_policy_name);
                println!("  ASK key: {}", cbcs.ask_key_name);
                println!("  Certificate password key: {}", cbcs.certificate_password_key_name);
            }
            None => println!("{}: disabled", Scheme::Cbcs),
        }

        Ok(())
    }
}
