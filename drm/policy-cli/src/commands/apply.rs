use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use log::{info, warn};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use drm_policy::{DEFAULT_KEY_DELIVERY_HOST, MemoryService, Orchestrator, RetryPolicy, RetryingService};

use super::settings::ConfigArgs;
use super::state::{load_state, save_state};

/**
    Reconcile CENC and CBCS policies once.
*/
#[derive(Args, Debug)]
pub struct ApplyCommand {
    #[command(flatten)]
    config: ConfigArgs,

    /**
        Local state file acting as the media key service. Created if
        missing and rewritten after the run. It holds the FairPlay ASK and
        certificate password in clear, so it is written owner-only on Unix.
        Without it the run works on a throwaway in-memory state.
    */
    #[arg(short, long)]
    state: Option<PathBuf>,

    /**
        Key delivery host used in acquisition URLs of a new state.
    */
    #[arg(long, default_value = DEFAULT_KEY_DELIVERY_HOST)]
    key_delivery_host: String,

    /**
        Retries for each service call that fails transiently.
    */
    #[arg(long, default_value = "2")]
    retries: u32,

    /**
        Delay before the first retry in milliseconds, growing linearly.
    */
    #[arg(long, default_value = "500")]
    retry_delay_ms: u64,
}

impl ApplyCommand {
    pub async fn run(self) -> Result<()> {
        let config = self.config.load()?;

        let store = match &self.state {
            Some(path) => load_state(path, &self.key_delivery_host)?,
            None => {
                warn!("No --state given, changes will not be kept");
                MemoryService::with_key_delivery_host(&self.key_delivery_host)
            }
        };
        let policy = RetryPolicy::new(self.retries, Duration::from_millis(self.retry_delay_ms));
        let service = RetryingService::new(store, policy);

        let cancel = CancellationToken::new();
        let interrupt = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, stopping at the next step");
                    cancel.cancel();
                }
            }
        });

        let report = Orchestrator::new(&service)
            .with_cancellation(cancel)
            .run(&config)
            .await;
        interrupt.abort();
        let report = report.context("failed to build JWT restriction")?;

        println!();
        print!("{report}");

        // Partial progress is kept so the next run picks up from it.
        if let Some(path) = &self.state {
            save_state(path, service.inner())?;
        }

        let failed = report.failures().count();
        if failed > 0 {
            bail!("{failed} scheme(s) failed to reconcile");
        }
        info!("Reconciliation complete");
        Ok(())
    }
}
