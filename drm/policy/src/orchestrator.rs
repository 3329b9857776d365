use core::fmt;

use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::config::ReconcileConfig;
use crate::error::{PolicyResult, ReconcileError};
use crate::reconcile::{SchemeOutcome, SchemeReconciler};
use crate::restriction::build_restriction;
use crate::service::MediaKeyService;
use crate::types::Scheme;

/**
    Combined outcome of one run over both schemes.
*/
#[derive(Debug, Clone)]
pub struct RunReport {
    pub cenc: SchemeOutcome,
    pub cbcs: SchemeOutcome,
}

impl RunReport {
    /**
        True when each scheme was applied or deliberately skipped.
    */
    pub fn is_success(&self) -> bool {
        self.cenc.is_ok() && self.cbcs.is_ok()
    }

    pub fn outcome(&self, scheme: Scheme) -> &SchemeOutcome {
        match scheme {
            Scheme::Cenc => &self.cenc,
            Scheme::Cbcs => &self.cbcs,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReconcileError> {
        [&self.cenc, &self.cbcs]
            .into_iter()
            .filter_map(SchemeOutcome::error)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for scheme in [Scheme::Cenc, Scheme::Cbcs] {
            match self.outcome(scheme) {
                SchemeOutcome::Applied(summary) => {
                    writeln!(f, "{scheme}: applied")?;
                    write!(f, "{summary}")?;
                }
                SchemeOutcome::Skipped => writeln!(f, "{scheme}: skipped")?,
                SchemeOutcome::Failed(err) => writeln!(f, "{scheme}: failed: {err}")?,
            }
        }
        Ok(())
    }
}

/**
    Runs the whole reconciliation: builds the shared restriction once,
    then CENC, then CBCS.

    The schemes share nothing but the restriction, so a failure in one
    never stops the other.
*/
pub struct Orchestrator<'a, S: ?Sized> {
    service: &'a S,
    cancel: CancellationToken,
}

impl<'a, S: MediaKeyService + ?Sized> Orchestrator<'a, S> {
    pub fn new(service: &'a S) -> Self {
        Self {
            service,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /**
        Reconcile both schemes against `config`.

        Only an unusable restriction fails the call itself; scheme
        failures are carried in the returned [`RunReport`].
    */
    pub async fn run(&self, config: &ReconcileConfig) -> PolicyResult<RunReport> {
        let restrictions = vec![build_restriction(
            &config.jwt.verification_key,
            &config.jwt.audience,
            &config.jwt.issuer,
        )?];
        info!("JWT restriction ready");

        let reconciler = SchemeReconciler::new(self.service, &restrictions)
            .with_cancellation(self.cancel.clone());

        info!("Applying CENC (Widevine + PlayReady) policies...");
        let cenc = reconciler.reconcile_cenc(&config.cenc).await;
        log_outcome(Scheme::Cenc, &cenc);

        info!("Applying CBCS (FairPlay) policies...");
        let cbcs = reconciler.reconcile_cbcs(config.cbcs.as_ref()).await;
        log_outcome(Scheme::Cbcs, &cbcs);

        Ok(RunReport { cenc, cbcs })
    }
}

fn log_outcome(scheme: Scheme, outcome: &SchemeOutcome) {
    match outcome {
        SchemeOutcome::Applied(_) => info!("{scheme} policies applied"),
        SchemeOutcome::Skipped => info!("{scheme} policies skipped"),
        SchemeOutcome::Failed(err) => error!("{err}"),
    }
}
