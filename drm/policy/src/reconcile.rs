use core::fmt;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::{CbcsConfig, CencConfig};
use crate::error::{PolicyError, PolicyResult, ReconcileError, Step};
use crate::fairplay::{ContentEncryptionIv, FairPlayDescriptor};
use crate::keys::{CONTENT_KEY_LENGTH, KeyRotationManager, PersistentKey};
use crate::restriction::Restriction;
use crate::service::MediaKeyService;
use crate::types::{
    AuthorizationPolicy, ContentKeyType, DeliveryConfigKey, DeliveryConfiguration,
    DeliveryMechanism, DeliveryPolicy, DesiredDeliveryPolicy, DesiredOption, KeyId, PolicyOption,
    Scheme,
};

const SECURE_TRANSPORT_PREFIX: &str = "https://";
const FAIRPLAY_KEY_DELIVERY_PREFIX: &str = "skd://";

// ── Change tracking ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Unchanged,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        })
    }
}

/**
    Remote entity after an upsert, and what the upsert did to it.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<T> {
    pub value: T,
    pub action: Action,
}

impl<T> Change<T> {
    fn created(value: T) -> Self {
        Self {
            value,
            action: Action::Created,
        }
    }

    fn updated(value: T) -> Self {
        Self {
            value,
            action: Action::Updated,
        }
    }

    fn unchanged(value: T) -> Self {
        Self {
            value,
            action: Action::Unchanged,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    AuthorizationPolicy,
    PolicyOption(DeliveryMechanism),
    DeliveryPolicy,
    PersistentKey(ContentKeyType),
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthorizationPolicy => f.write_str("authorization policy"),
            Self::PolicyOption(mechanism) => write!(f, "{mechanism} policy option"),
            Self::DeliveryPolicy => f.write_str("delivery policy"),
            Self::PersistentKey(key_type) => write!(f, "{key_type} key"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityChange {
    pub kind: EntityKind,
    pub name: String,
    pub action: Action,
}

/**
    What one successful scheme reconciliation did.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeSummary {
    pub scheme: Scheme,
    pub changes: Vec<EntityChange>,
    /// Superseded persistent keys removed after repointing.
    pub deleted_keys: Vec<KeyId>,
}

impl SchemeSummary {
    fn new(scheme: Scheme) -> Self {
        Self {
            scheme,
            changes: Vec::new(),
            deleted_keys: Vec::new(),
        }
    }

    fn record(&mut self, kind: EntityKind, name: &str, action: Action) {
        self.changes.push(EntityChange {
            kind,
            name: name.to_owned(),
            action,
        });
    }

    pub fn action(&self, kind: EntityKind) -> Option<Action> {
        self.changes.iter().find(|c| c.kind == kind).map(|c| c.action)
    }

    pub fn is_unchanged(&self) -> bool {
        self.deleted_keys.is_empty() && self.changes.iter().all(|c| c.action == Action::Unchanged)
    }
}

impl fmt::Display for SchemeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for change in &self.changes {
            writeln!(f, "  {} '{}': {}", change.kind, change.name, change.action)?;
        }
        for id in &self.deleted_keys {
            writeln!(f, "  superseded key {id}: deleted")?;
        }
        Ok(())
    }
}

/**
    Final state of one scheme after a run.
*/
#[derive(Debug, Clone)]
pub enum SchemeOutcome {
    Applied(SchemeSummary),
    Skipped,
    Failed(ReconcileError),
}

impl SchemeOutcome {
    /**
        Applied and skipped both count as success.
    */
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    pub fn summary(&self) -> Option<&SchemeSummary> {
        match self {
            Self::Applied(summary) => Some(summary),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ReconcileError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

impl From<Result<SchemeSummary, ReconcileError>> for SchemeOutcome {
    fn from(result: Result<SchemeSummary, ReconcileError>) -> Self {
        match result {
            Ok(summary) => Self::Applied(summary),
            Err(error) => Self::Failed(error),
        }
    }
}

// ── URL handling ────────────────────────────────────────────────────

/**
    Drop the query string of `url`, keeping any fragment.
*/
pub fn strip_query(url: &str) -> String {
    let Some(start) = url.find('?') else {
        return url.to_owned();
    };
    let fragment = url[start..].find('#').map_or("", |i| &url[start + i..]);
    format!("{}{}", &url[..start], fragment)
}

/**
    Swap the first `https://` for the FairPlay `skd://` scheme.
*/
pub fn to_key_delivery_scheme(url: &str) -> String {
    url.replacen(SECURE_TRANSPORT_PREFIX, FAIRPLAY_KEY_DELIVERY_PREFIX, 1)
}

fn delivery_entry(mechanism: DeliveryMechanism, url: String) -> (DeliveryConfigKey, String) {
    match mechanism {
        DeliveryMechanism::PlayReady => (DeliveryConfigKey::PlayReadyLicenseAcquisitionUrl, url),
        DeliveryMechanism::Widevine => (
            DeliveryConfigKey::WidevineBaseLicenseAcquisitionUrl,
            strip_query(&url),
        ),
        DeliveryMechanism::FairPlay => (
            DeliveryConfigKey::FairPlayLicenseAcquisitionUrl,
            to_key_delivery_scheme(&url),
        ),
    }
}

fn at(scheme: Scheme, step: Step) -> impl FnOnce(PolicyError) -> ReconcileError {
    move |error| ReconcileError {
        scheme,
        step,
        error,
    }
}

fn key_action(key: &PersistentKey) -> Action {
    match (key.created, key.has_superseded()) {
        (true, true) => Action::Updated,
        (true, false) => Action::Created,
        // Leftovers are reported through `deleted_keys`.
        (false, _) => Action::Unchanged,
    }
}

// ── Reconciler ──────────────────────────────────────────────────────

/**
    Reconciles one DRM scheme's authorization policy, options and
    delivery policy against desired configuration.

    The restriction list is handed in by the caller and shared,
    unchanged, by every option this reconciler writes.
*/
pub struct SchemeReconciler<'a, S: ?Sized> {
    service: &'a S,
    restrictions: &'a [Restriction],
    cancel: CancellationToken,
}

impl<'a, S: MediaKeyService + ?Sized> SchemeReconciler<'a, S> {
    pub fn new(service: &'a S, restrictions: &'a [Restriction]) -> Self {
        Self {
            service,
            restrictions,
            cancel: CancellationToken::new(),
        }
    }

    /**
        Stop at the next step boundary once `token` is cancelled. Never
        checked while a superseded key is waiting for cleanup.
    */
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub async fn reconcile_cenc(&self, config: &CencConfig) -> SchemeOutcome {
        self.try_reconcile_cenc(config).await.into()
    }

    /**
        Reconcile FairPlay. `None` means FairPlay is switched off: no
        remote call is made and the scheme is reported as skipped.
    */
    pub async fn reconcile_cbcs(&self, config: Option<&CbcsConfig>) -> SchemeOutcome {
        match config {
            Some(config) => self.try_reconcile_cbcs(config).await.into(),
            None => {
                info!("Skipping CBCS (FairPlay) policies: disabled by configuration");
                SchemeOutcome::Skipped
            }
        }
    }

    async fn try_reconcile_cenc(&self, config: &CencConfig) -> Result<SchemeSummary, ReconcileError> {
        let scheme = Scheme::Cenc;
        let mut summary = SchemeSummary::new(scheme);

        self.checkpoint(scheme, Step::AuthorizationPolicy)?;
        let policy = self
            .ensure_authorization_policy(&config.authorization_policy_name)
            .await
            .map_err(at(scheme, Step::AuthorizationPolicy))?;
        summary.record(
            EntityKind::AuthorizationPolicy,
            &config.authorization_policy_name,
            policy.action,
        );

        let options = [
            (
                DeliveryMechanism::Widevine,
                &config.widevine_option_name,
                &config.widevine_template,
            ),
            (
                DeliveryMechanism::PlayReady,
                &config.playready_option_name,
                &config.playready_template,
            ),
        ];
        for (mechanism, name, template) in options {
            let step = Step::PolicyOption(mechanism);
            self.checkpoint(scheme, step)?;
            let desired = self.desired_option(name, mechanism, template.clone());
            let option = self
                .upsert_option(&policy.value, desired)
                .await
                .map_err(at(scheme, step))?;
            summary.record(EntityKind::PolicyOption(mechanism), name, option.action);
        }

        self.checkpoint(scheme, Step::AcquisitionUrls)?;
        let configuration: DeliveryConfiguration = self
            .acquisition_urls(scheme)
            .await
            .map_err(at(scheme, Step::AcquisitionUrls))?
            .into_iter()
            .map(|(mechanism, url)| delivery_entry(mechanism, url))
            .collect();

        self.checkpoint(scheme, Step::DeliveryPolicy)?;
        let delivery = self
            .upsert_delivery_policy(self.desired_delivery_policy(
                scheme,
                &config.delivery_policy_name,
                configuration,
            ))
            .await
            .map_err(at(scheme, Step::DeliveryPolicy))?;
        summary.record(
            EntityKind::DeliveryPolicy,
            &config.delivery_policy_name,
            delivery.action,
        );

        Ok(summary)
    }

    async fn try_reconcile_cbcs(&self, config: &CbcsConfig) -> Result<SchemeSummary, ReconcileError> {
        let scheme = Scheme::Cbcs;
        let mut summary = SchemeSummary::new(scheme);

        self.checkpoint(scheme, Step::AuthorizationPolicy)?;
        let policy = self
            .ensure_authorization_policy(&config.authorization_policy_name)
            .await
            .map_err(at(scheme, Step::AuthorizationPolicy))?;
        summary.record(
            EntityKind::AuthorizationPolicy,
            &config.authorization_policy_name,
            policy.action,
        );

        self.checkpoint(scheme, Step::PersistentKeys)?;
        let keys = KeyRotationManager::new(self.service);
        let ask = keys
            .ensure_persistent(
                &config.ask_key_name,
                &config.ask,
                ContentKeyType::FairPlayApplicationSecret,
            )
            .await
            .map_err(at(scheme, Step::PersistentKeys))?;
        let password = keys
            .ensure_persistent(
                &config.certificate_password_key_name,
                config.certificate_password.as_bytes(),
                ContentKeyType::FairPlayCertificatePassword,
            )
            .await
            .map_err(at(scheme, Step::PersistentKeys))?;
        summary.record(
            EntityKind::PersistentKey(ContentKeyType::FairPlayApplicationSecret),
            &config.ask_key_name,
            key_action(&ask),
        );
        summary.record(
            EntityKind::PersistentKey(ContentKeyType::FairPlayCertificatePassword),
            &config.certificate_password_key_name,
            key_action(&password),
        );

        // From here on keys waiting for cleanup must be repointed away
        // from first, so cancellation is only honoured without any.
        let cleanup_pending = ask.has_superseded() || password.has_superseded();

        let step = Step::PolicyOption(DeliveryMechanism::FairPlay);
        if !cleanup_pending {
            self.checkpoint(scheme, step)?;
        }
        let iv = ContentEncryptionIv::generate();
        let descriptor =
            FairPlayDescriptor::new(&config.certificate, &password.key.id, &ask.key.id, &iv)
                .to_json()
                .map_err(at(scheme, step))?;
        let desired = self.desired_option(&config.option_name, DeliveryMechanism::FairPlay, descriptor);
        let option = self
            .upsert_option(&policy.value, desired)
            .await
            .map_err(at(scheme, step))?;
        summary.record(
            EntityKind::PolicyOption(DeliveryMechanism::FairPlay),
            &config.option_name,
            option.action,
        );

        if !cleanup_pending {
            self.checkpoint(scheme, Step::AcquisitionUrls)?;
        }
        let mut configuration: DeliveryConfiguration = self
            .acquisition_urls(scheme)
            .await
            .map_err(at(scheme, Step::AcquisitionUrls))?
            .into_iter()
            .map(|(mechanism, url)| delivery_entry(mechanism, url))
            .collect();
        configuration.insert(DeliveryConfigKey::CommonEncryptionIvForCbcs, iv.to_hex());

        if !cleanup_pending {
            self.checkpoint(scheme, Step::DeliveryPolicy)?;
        }
        let delivery = self
            .upsert_delivery_policy(self.desired_delivery_policy(
                scheme,
                &config.delivery_policy_name,
                configuration,
            ))
            .await
            .map_err(at(scheme, Step::DeliveryPolicy))?;
        summary.record(
            EntityKind::DeliveryPolicy,
            &config.delivery_policy_name,
            delivery.action,
        );

        // Everything referencing the replacement keys is written; the
        // superseded ones can go.
        for superseded in ask.superseded.into_iter().chain(password.superseded) {
            self.service
                .delete_content_key(&superseded)
                .await
                .map_err(|e| ReconcileError::new(scheme, Step::SupersededKeyCleanup, e))?;
            info!(
                "Deleted superseded {} key '{}' ({})",
                superseded.key_type, superseded.name, superseded.id
            );
            summary.deleted_keys.push(superseded.id);
        }

        Ok(summary)
    }

    fn checkpoint(&self, scheme: Scheme, step: Step) -> Result<(), ReconcileError> {
        if self.cancel.is_cancelled() {
            warn!("{scheme} reconciliation cancelled before {step}");
            return Err(ReconcileError::new(scheme, step, PolicyError::Cancelled));
        }
        Ok(())
    }

    fn desired_option(
        &self,
        name: &str,
        mechanism: DeliveryMechanism,
        configuration: String,
    ) -> DesiredOption {
        DesiredOption {
            name: name.to_owned(),
            mechanism,
            restrictions: self.restrictions.to_vec(),
            configuration,
        }
    }

    fn desired_delivery_policy(
        &self,
        scheme: Scheme,
        name: &str,
        configuration: DeliveryConfiguration,
    ) -> DesiredDeliveryPolicy {
        DesiredDeliveryPolicy {
            name: name.to_owned(),
            policy_type: scheme.delivery_policy_type(),
            protocols: scheme.protocols(),
            configuration,
        }
    }

    // ── Upserts ───────────────────────────────────────────────────────

    async fn ensure_authorization_policy(
        &self,
        name: &str,
    ) -> PolicyResult<Change<AuthorizationPolicy>> {
        if let Some(policy) = self.service.find_authorization_policy(name).await? {
            debug!("Authorization policy '{name}' exists ({})", policy.id);
            return Ok(Change::unchanged(policy));
        }
        let policy = self.service.create_authorization_policy(name).await?;
        info!("Created authorization policy '{name}' ({})", policy.id);
        Ok(Change::created(policy))
    }

    async fn upsert_option(
        &self,
        policy: &AuthorizationPolicy,
        desired: DesiredOption,
    ) -> PolicyResult<Change<PolicyOption>> {
        match policy.option(&desired.name) {
            None => {
                let option = self
                    .service
                    .create_policy_option(
                        &desired.name,
                        desired.mechanism,
                        &desired.restrictions,
                        &desired.configuration,
                    )
                    .await?;
                self.service.attach_policy_option(policy, &option).await?;
                info!(
                    "Created {} policy option '{}' on '{}'",
                    desired.mechanism, desired.name, policy.name
                );
                Ok(Change::created(option))
            }
            Some(existing) if existing.matches(&desired) => {
                debug!("{} policy option '{}' is up to date", desired.mechanism, desired.name);
                Ok(Change::unchanged(existing.clone()))
            }
            Some(existing) => {
                let updated = desired.apply_to(existing);
                self.service.update_policy_option(&updated).await?;
                info!("Updated {} policy option '{}'", desired.mechanism, desired.name);
                Ok(Change::updated(updated))
            }
        }
    }

    async fn upsert_delivery_policy(
        &self,
        desired: DesiredDeliveryPolicy,
    ) -> PolicyResult<Change<DeliveryPolicy>> {
        match self.service.find_delivery_policy(&desired.name).await? {
            None => {
                let policy = self
                    .service
                    .create_delivery_policy(
                        &desired.name,
                        desired.policy_type,
                        desired.protocols,
                        &desired.configuration,
                    )
                    .await?;
                info!(
                    "Created {} delivery policy '{}' for {}",
                    desired.policy_type, desired.name, desired.protocols
                );
                Ok(Change::created(policy))
            }
            Some(existing) if existing.matches(&desired) => {
                debug!("Delivery policy '{}' is up to date", desired.name);
                Ok(Change::unchanged(existing))
            }
            Some(existing) => {
                let updated = desired.apply_to(&existing);
                self.service.update_delivery_policy(&updated).await?;
                info!("Updated delivery policy '{}'", desired.name);
                Ok(Change::updated(updated))
            }
        }
    }

    /**
        Mint an ephemeral key, ask for one acquisition URL per mechanism
        of `scheme`, then delete the key again.

        A failed delete is logged and ignored: the URLs stay valid
        without the key.
    */
    async fn acquisition_urls(
        &self,
        scheme: Scheme,
    ) -> PolicyResult<Vec<(DeliveryMechanism, String)>> {
        let keys = KeyRotationManager::new(self.service);
        let key = keys
            .mint_ephemeral(scheme.ephemeral_key_type(), CONTENT_KEY_LENGTH)
            .await?;

        let mut urls = Vec::with_capacity(scheme.mechanisms().len());
        let mut failure = None;
        for &mechanism in scheme.mechanisms() {
            match self.service.get_acquisition_url(&key, mechanism).await {
                Ok(url) => urls.push((mechanism, url)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match self.service.delete_content_key(&key).await {
            Ok(()) => debug!("Deleted ephemeral key {}", key.id),
            Err(e) => warn!("Failed to delete ephemeral key {}: {e}", key.id),
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(urls),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_query_removes_query_only() {
        assert_eq!(
            strip_query("https://host/Widevine/?KID=abc"),
            "https://host/Widevine/"
        );
        assert_eq!(strip_query("https://host/path"), "https://host/path");
        assert_eq!(strip_query("https://host/p?q=1#frag"), "https://host/p#frag");
    }

    #[test]
    fn key_delivery_scheme_rewrites_prefix_once() {
        assert_eq!(
            to_key_delivery_scheme("https://host/path?query"),
            "skd://host/path?query"
        );
        assert_eq!(
            to_key_delivery_scheme("https://host/?r=https://x"),
            "skd://host/?r=https://x"
        );
        // Case-sensitive: nothing to replace.
        assert_eq!(to_key_delivery_scheme("HTTPS://host/"), "HTTPS://host/");
    }

    #[test]
    fn delivery_entries_map_mechanisms_to_keys() {
        let (key, url) = delivery_entry(DeliveryMechanism::PlayReady, "https://h/PlayReady/?x=1".into());
        assert_eq!(key, DeliveryConfigKey::PlayReadyLicenseAcquisitionUrl);
        assert_eq!(url, "https://h/PlayReady/?x=1");

        let (key, url) = delivery_entry(DeliveryMechanism::Widevine, "https://h/Widevine/?KID=1".into());
        assert_eq!(key, DeliveryConfigKey::WidevineBaseLicenseAcquisitionUrl);
        assert_eq!(url, "https://h/Widevine/");

        let (key, url) = delivery_entry(DeliveryMechanism::FairPlay, "https://h/FairPlay/?KID=1".into());
        assert_eq!(key, DeliveryConfigKey::FairPlayLicenseAcquisitionUrl);
        assert_eq!(url, "skd://h/FairPlay/?KID=1");
    }

    #[test]
    fn key_action_reflects_rotation() {
        let key = crate::types::ContentKey {
            id: KeyId::new_random(),
            name: "k".into(),
            key_type: ContentKeyType::FairPlayApplicationSecret,
        };
        let fresh = PersistentKey {
            key: key.clone(),
            superseded: Vec::new(),
            created: true,
        };
        let same = PersistentKey {
            created: false,
            ..fresh.clone()
        };
        let rotated = PersistentKey {
            superseded: vec![key.clone()],
            ..fresh.clone()
        };
        let leftover = PersistentKey {
            superseded: vec![key],
            created: false,
            ..fresh.clone()
        };
        assert_eq!(key_action(&fresh), Action::Created);
        assert_eq!(key_action(&same), Action::Unchanged);
        assert_eq!(key_action(&rotated), Action::Updated);
        assert_eq!(key_action(&leftover), Action::Unchanged);
    }

    #[test]
    fn unchanged_summary_has_no_writes() {
        let mut summary = SchemeSummary::new(Scheme::Cenc);
        summary.record(EntityKind::AuthorizationPolicy, "p", Action::Unchanged);
        assert!(summary.is_unchanged());
        summary.record(EntityKind::DeliveryPolicy, "d", Action::Updated);
        assert!(!summary.is_unchanged());
        assert_eq!(summary.action(EntityKind::DeliveryPolicy), Some(Action::Updated));
    }
}
