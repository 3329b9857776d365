use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Operation, ServiceError, ServiceResult};
use crate::restriction::Restriction;
use crate::service::MediaKeyService;
use crate::types::{
    AuthorizationPolicy, ContentKey, ContentKeyType, DeliveryConfiguration, DeliveryMechanism,
    DeliveryPolicy, DeliveryPolicyType, DeliveryProtocols, KeyId, PolicyOption,
};

/**
    Host used in acquisition URLs when none is configured.
*/
pub const DEFAULT_KEY_DELIVERY_HOST: &str = "keydelivery.localhost";

/**
    One call issued against a [`MemoryService`], in issue order.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCall {
    FindAuthorizationPolicy(String),
    CreateAuthorizationPolicy(String),
    CreatePolicyOption {
        name: String,
        configuration: String,
    },
    AttachPolicyOption {
        policy: String,
        option: String,
    },
    UpdatePolicyOption {
        name: String,
        configuration: String,
    },
    FindDeliveryPolicy(String),
    CreateDeliveryPolicy {
        name: String,
        configuration: DeliveryConfiguration,
    },
    UpdateDeliveryPolicy {
        name: String,
        configuration: DeliveryConfiguration,
    },
    CreateContentKey {
        id: KeyId,
        name: String,
        key_type: ContentKeyType,
    },
    FindContentKeysByName(String),
    GetClearValue(KeyId),
    DeleteContentKey(KeyId),
    GetAcquisitionUrl {
        id: KeyId,
        mechanism: DeliveryMechanism,
    },
}

impl ServiceCall {
    pub fn operation(&self) -> Operation {
        match self {
            Self::FindAuthorizationPolicy(_) => Operation::FindAuthorizationPolicy,
            Self::CreateAuthorizationPolicy(_) => Operation::CreateAuthorizationPolicy,
            Self::CreatePolicyOption { .. } => Operation::CreatePolicyOption,
            Self::AttachPolicyOption { .. } => Operation::AttachPolicyOption,
            Self::UpdatePolicyOption { .. } => Operation::UpdatePolicyOption,
            Self::FindDeliveryPolicy(_) => Operation::FindDeliveryPolicy,
            Self::CreateDeliveryPolicy { .. } => Operation::CreateDeliveryPolicy,
            Self::UpdateDeliveryPolicy { .. } => Operation::UpdateDeliveryPolicy,
            Self::CreateContentKey { .. } => Operation::CreateContentKey,
            Self::FindContentKeysByName(_) => Operation::FindContentKeysByName,
            Self::GetClearValue(_) => Operation::GetClearValue,
            Self::DeleteContentKey(_) => Operation::DeleteContentKey,
            Self::GetAcquisitionUrl { .. } => Operation::GetAcquisitionUrl,
        }
    }

    /**
        True for calls that change remote state.
    */
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::CreateAuthorizationPolicy(_)
                | Self::CreatePolicyOption { .. }
                | Self::AttachPolicyOption { .. }
                | Self::UpdatePolicyOption { .. }
                | Self::CreateDeliveryPolicy { .. }
                | Self::UpdateDeliveryPolicy { .. }
                | Self::CreateContentKey { .. }
                | Self::DeleteContentKey(_)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PolicyRecord {
    id: String,
    option_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct KeyRecord {
    key: ContentKey,
    #[serde(with = "hex")]
    value: Vec<u8>,
}

/**
    Serializable snapshot of everything a [`MemoryService`] stores.
*/
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryState {
    #[serde(default = "default_host")]
    key_delivery_host: String,
    #[serde(default)]
    authorization_policies: BTreeMap<String, PolicyRecord>,
    #[serde(default)]
    policy_options: BTreeMap<String, PolicyOption>,
    #[serde(default)]
    delivery_policies: BTreeMap<String, DeliveryPolicy>,
    /// Creation order; lookups by name list oldest first.
    #[serde(default)]
    content_keys: Vec<KeyRecord>,
}

fn default_host() -> String {
    DEFAULT_KEY_DELIVERY_HOST.to_owned()
}

impl MemoryState {
    pub fn key_delivery_host(&self) -> &str {
        &self.key_delivery_host
    }

    pub fn authorization_policy_names(&self) -> impl Iterator<Item = &str> {
        self.authorization_policies.keys().map(String::as_str)
    }

    pub fn delivery_policies(&self) -> impl Iterator<Item = &DeliveryPolicy> {
        self.delivery_policies.values()
    }

    pub fn policy_options(&self) -> impl Iterator<Item = &PolicyOption> {
        self.policy_options.values()
    }

    pub fn content_keys(&self) -> impl Iterator<Item = &ContentKey> {
        self.content_keys.iter().map(|r| &r.key)
    }
}

#[derive(Default)]
struct Inner {
    state: MemoryState,
    calls: Vec<ServiceCall>,
    failures: Vec<ServiceError>,
}

impl Inner {
    fn record(&mut self, call: ServiceCall) -> ServiceResult<()> {
        let operation = call.operation();
        self.calls.push(call);
        match self.failures.iter().position(|f| f.operation == operation) {
            Some(index) => Err(self.failures.remove(index)),
            None => Ok(()),
        }
    }

    fn assemble_policy(&self, name: &str) -> Option<AuthorizationPolicy> {
        let record = self.state.authorization_policies.get(name)?;
        let options = record
            .option_ids
            .iter()
            .filter_map(|id| self.state.policy_options.get(id).cloned())
            .collect();
        Some(AuthorizationPolicy {
            id: record.id.clone(),
            name: name.to_owned(),
            options,
        })
    }

    fn key_record(&self, id: &KeyId) -> Option<&KeyRecord> {
        self.state.content_keys.iter().find(|r| r.key.id == *id)
    }
}

/**
    In-memory media key service.

    Keeps every entity in name-indexed maps, records each call in issue
    order, and can be told to fail specific operations. Its state can be
    saved to and restored from JSON, which lets the CLI run against a
    local state file.
*/
pub struct MemoryService {
    inner: Mutex<Inner>,
}

impl Default for MemoryService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryService {
    pub fn new() -> Self {
        Self::from_state(MemoryState {
            key_delivery_host: default_host(),
            ..MemoryState::default()
        })
    }

    pub fn with_key_delivery_host(host: impl Into<String>) -> Self {
        Self::from_state(MemoryState {
            key_delivery_host: host.into(),
            ..MemoryState::default()
        })
    }

    pub fn from_state(state: MemoryState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                ..Inner::default()
            }),
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json).map(Self::from_state)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.inner.lock().state)
    }

    pub fn snapshot(&self) -> MemoryState {
        self.inner.lock().state.clone()
    }

    // ── Test hooks ────────────────────────────────────────────────────

    /**
        Make the next call of `operation` fail with a permanent error.
    */
    pub fn fail_next(&self, operation: Operation) {
        self.inject(ServiceError::new(operation, "injected failure"));
    }

    /**
        Make the next call of `operation` fail with a transient error.
    */
    pub fn fail_next_transient(&self, operation: Operation) {
        self.inject(ServiceError::transient(operation, "injected transient failure"));
    }

    fn inject(&self, error: ServiceError) {
        self.inner.lock().failures.push(error);
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.inner.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    pub fn clear_value(&self, id: &KeyId) -> Option<Vec<u8>> {
        self.inner.lock().key_record(id).map(|r| r.value.clone())
    }

    pub fn content_key_count(&self) -> usize {
        self.inner.lock().state.content_keys.len()
    }

    pub fn content_keys_named(&self, name: &str) -> Vec<ContentKey> {
        self.inner
            .lock()
            .state
            .content_keys
            .iter()
            .filter(|r| r.key.name == name)
            .map(|r| r.key.clone())
            .collect()
    }

    pub fn authorization_policy(&self, name: &str) -> Option<AuthorizationPolicy> {
        self.inner.lock().assemble_policy(name)
    }

    pub fn delivery_policy(&self, name: &str) -> Option<DeliveryPolicy> {
        self.inner.lock().state.delivery_policies.get(name).cloned()
    }

    /**
        Overwrite an option's restrictions, as an operator editing the
        policy by hand would.
    */
    pub fn set_option_restrictions(&self, option_name: &str, restrictions: Vec<Restriction>) {
        let mut inner = self.inner.lock();
        if let Some(option) = inner
            .state
            .policy_options
            .values_mut()
            .find(|o| o.name == option_name)
        {
            option.restrictions = restrictions;
        }
    }
}

fn entity_id(prefix: &str) -> String {
    format!("nb:{prefix}:UUID:{}", Uuid::new_v4())
}

#[async_trait]
impl MediaKeyService for MemoryService {
    async fn find_authorization_policy(
        &self,
        name: &str,
    ) -> ServiceResult<Option<AuthorizationPolicy>> {
        let mut inner = self.inner.lock();
        inner.record(ServiceCall::FindAuthorizationPolicy(name.to_owned()))?;
        Ok(inner.assemble_policy(name))
    }

    async fn create_authorization_policy(&self, name: &str) -> ServiceResult<AuthorizationPolicy> {
        let mut inner = self.inner.lock();
        inner.record(ServiceCall::CreateAuthorizationPolicy(name.to_owned()))?;
        if inner.state.authorization_policies.contains_key(name) {
            return Err(ServiceError::new(
                Operation::CreateAuthorizationPolicy,
                format!("authorization policy '{name}' already exists"),
            ));
        }
        let record = PolicyRecord {
            id: entity_id("ckpid"),
            option_ids: Vec::new(),
        };
        let policy = AuthorizationPolicy {
            id: record.id.clone(),
            name: name.to_owned(),
            options: Vec::new(),
        };
        inner
            .state
            .authorization_policies
            .insert(name.to_owned(), record);
        Ok(policy)
    }

    async fn create_policy_option(
        &self,
        name: &str,
        mechanism: DeliveryMechanism,
        restrictions: &[Restriction],
        configuration: &str,
    ) -> ServiceResult<PolicyOption> {
        let mut inner = self.inner.lock();
        inner.record(ServiceCall::CreatePolicyOption {
            name: name.to_owned(),
            configuration: configuration.to_owned(),
        })?;
        let option = PolicyOption {
            id: entity_id("ckpoid"),
            name: name.to_owned(),
            mechanism,
            restrictions: restrictions.to_vec(),
            configuration: configuration.to_owned(),
        };
        inner
            .state
            .policy_options
            .insert(option.id.clone(), option.clone());
        Ok(option)
    }

    async fn attach_policy_option(
        &self,
        policy: &AuthorizationPolicy,
        option: &PolicyOption,
    ) -> ServiceResult<()> {
        let mut inner = self.inner.lock();
        inner.record(ServiceCall::AttachPolicyOption {
            policy: policy.name.clone(),
            option: option.name.clone(),
        })?;
        if !inner.state.policy_options.contains_key(&option.id) {
            return Err(ServiceError::new(
                Operation::AttachPolicyOption,
                format!("policy option {} does not exist", option.id),
            ));
        }
        let record = inner
            .state
            .authorization_policies
            .get_mut(&policy.name)
            .ok_or_else(|| {
                ServiceError::new(
                    Operation::AttachPolicyOption,
                    format!("authorization policy '{}' does not exist", policy.name),
                )
            })?;
        if !record.option_ids.contains(&option.id) {
            record.option_ids.push(option.id.clone());
        }
        Ok(())
    }

    async fn update_policy_option(&self, option: &PolicyOption) -> ServiceResult<()> {
        let mut inner = self.inner.lock();
        inner.record(ServiceCall::UpdatePolicyOption {
            name: option.name.clone(),
            configuration: option.configuration.clone(),
        })?;
        match inner.state.policy_options.get_mut(&option.id) {
            Some(stored) => {
                *stored = option.clone();
                Ok(())
            }
            None => Err(ServiceError::new(
                Operation::UpdatePolicyOption,
                format!("policy option {} does not exist", option.id),
            )),
        }
    }

    async fn find_delivery_policy(&self, name: &str) -> ServiceResult<Option<DeliveryPolicy>> {
        let mut inner = self.inner.lock();
        inner.record(ServiceCall::FindDeliveryPolicy(name.to_owned()))?;
        Ok(inner.state.delivery_policies.get(name).cloned())
    }

    async fn create_delivery_policy(
        &self,
        name: &str,
        policy_type: DeliveryPolicyType,
        protocols: DeliveryProtocols,
        configuration: &DeliveryConfiguration,
    ) -> ServiceResult<DeliveryPolicy> {
        let mut inner = self.inner.lock();
        inner.record(ServiceCall::CreateDeliveryPolicy {
            name: name.to_owned(),
            configuration: configuration.clone(),
        })?;
        if inner.state.delivery_policies.contains_key(name) {
            return Err(ServiceError::new(
                Operation::CreateDeliveryPolicy,
                format!("delivery policy '{name}' already exists"),
            ));
        }
        let policy = DeliveryPolicy {
            id: entity_id("adpid"),
            name: name.to_owned(),
            policy_type,
            protocols,
            configuration: configuration.clone(),
        };
        inner
            .state
            .delivery_policies
            .insert(name.to_owned(), policy.clone());
        Ok(policy)
    }

    async fn update_delivery_policy(&self, policy: &DeliveryPolicy) -> ServiceResult<()> {
        let mut inner = self.inner.lock();
        inner.record(ServiceCall::UpdateDeliveryPolicy {
            name: policy.name.clone(),
            configuration: policy.configuration.clone(),
        })?;
        match inner.state.delivery_policies.get_mut(&policy.name) {
            Some(stored) if stored.id == policy.id => {
                *stored = policy.clone();
                Ok(())
            }
            _ => Err(ServiceError::new(
                Operation::UpdateDeliveryPolicy,
                format!("delivery policy {} does not exist", policy.id),
            )),
        }
    }

    async fn create_content_key(
        &self,
        id: KeyId,
        value: &[u8],
        name: &str,
        key_type: ContentKeyType,
    ) -> ServiceResult<ContentKey> {
        let mut inner = self.inner.lock();
        inner.record(ServiceCall::CreateContentKey {
            id,
            name: name.to_owned(),
            key_type,
        })?;
        if inner.key_record(&id).is_some() {
            return Err(ServiceError::new(
                Operation::CreateContentKey,
                format!("content key {id} already exists"),
            ));
        }
        let key = ContentKey {
            id,
            name: name.to_owned(),
            key_type,
        };
        inner.state.content_keys.push(KeyRecord {
            key: key.clone(),
            value: value.to_vec(),
        });
        Ok(key)
    }

    async fn find_content_keys_by_name(&self, name: &str) -> ServiceResult<Vec<ContentKey>> {
        let mut inner = self.inner.lock();
        inner.record(ServiceCall::FindContentKeysByName(name.to_owned()))?;
        Ok(inner
            .state
            .content_keys
            .iter()
            .filter(|r| r.key.name == name)
            .map(|r| r.key.clone())
            .collect())
    }

    async fn get_clear_value(&self, key: &ContentKey) -> ServiceResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.record(ServiceCall::GetClearValue(key.id))?;
        inner.key_record(&key.id).map(|r| r.value.clone()).ok_or_else(|| {
            ServiceError::new(
                Operation::GetClearValue,
                format!("content key {} does not exist", key.id),
            )
        })
    }

    async fn delete_content_key(&self, key: &ContentKey) -> ServiceResult<()> {
        let mut inner = self.inner.lock();
        inner.record(ServiceCall::DeleteContentKey(key.id))?;
        let before = inner.state.content_keys.len();
        inner.state.content_keys.retain(|r| r.key.id != key.id);
        if inner.state.content_keys.len() == before {
            return Err(ServiceError::new(
                Operation::DeleteContentKey,
                format!("content key {} does not exist", key.id),
            ));
        }
        Ok(())
    }

    async fn get_acquisition_url(
        &self,
        key: &ContentKey,
        mechanism: DeliveryMechanism,
    ) -> ServiceResult<String> {
        let mut inner = self.inner.lock();
        inner.record(ServiceCall::GetAcquisitionUrl {
            id: key.id,
            mechanism,
        })?;
        if inner.key_record(&key.id).is_none() {
            return Err(ServiceError::new(
                Operation::GetAcquisitionUrl,
                format!("content key {} does not exist", key.id),
            ));
        }
        let host = &inner.state.key_delivery_host;
        let kid = key.id.uuid();
        Ok(match mechanism {
            DeliveryMechanism::PlayReady => format!("https://{host}/PlayReady/"),
            DeliveryMechanism::Widevine => format!("https://{host}/Widevine/?KID={kid}"),
            DeliveryMechanism::FairPlay => format!("https://{host}/FairPlay/?KID={kid}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_in_order_including_failures() {
        let service = MemoryService::new();
        service.fail_next(Operation::CreateAuthorizationPolicy);

        assert!(service.find_authorization_policy("p").await.unwrap().is_none());
        let err = service.create_authorization_policy("p").await.unwrap_err();
        assert_eq!(err.operation, Operation::CreateAuthorizationPolicy);
        assert!(!err.transient);
        service.create_authorization_policy("p").await.unwrap();

        assert_eq!(
            service.calls(),
            vec![
                ServiceCall::FindAuthorizationPolicy("p".into()),
                ServiceCall::CreateAuthorizationPolicy("p".into()),
                ServiceCall::CreateAuthorizationPolicy("p".into()),
            ]
        );
    }

    #[tokio::test]
    async fn unattached_options_are_not_visible_on_the_policy() {
        let service = MemoryService::new();
        let policy = service.create_authorization_policy("p").await.unwrap();
        let option = service
            .create_policy_option("wv", DeliveryMechanism::Widevine, &[], "{}")
            .await
            .unwrap();
        assert!(service.authorization_policy("p").unwrap().options.is_empty());

        service.attach_policy_option(&policy, &option).await.unwrap();

        let found = service.find_authorization_policy("p").await.unwrap().unwrap();
        assert_eq!(found.options, vec![option]);
    }

    #[tokio::test]
    async fn find_by_name_lists_oldest_first() {
        let service = MemoryService::new();
        let old = service
            .create_content_key(KeyId::new_random(), b"a", "k", ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap();
        let new = service
            .create_content_key(KeyId::new_random(), b"b", "k", ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap();

        let found = service.find_content_keys_by_name("k").await.unwrap();
        assert_eq!(found, vec![old, new]);
        assert!(service.find_content_keys_by_name("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acquisition_urls_embed_key_id() {
        let service = MemoryService::with_key_delivery_host("acct.keydelivery.example.net");
        let key = service
            .create_content_key(KeyId::new_random(), &[0; 16], "k", ContentKeyType::CommonEncryption)
            .await
            .unwrap();

        let widevine = service
            .get_acquisition_url(&key, DeliveryMechanism::Widevine)
            .await
            .unwrap();
        let playready = service
            .get_acquisition_url(&key, DeliveryMechanism::PlayReady)
            .await
            .unwrap();

        assert_eq!(
            widevine,
            format!("https://acct.keydelivery.example.net/Widevine/?KID={}", key.id.uuid())
        );
        assert_eq!(playready, "https://acct.keydelivery.example.net/PlayReady/");
    }

    #[tokio::test]
    async fn state_survives_json_round_trip() {
        let service = MemoryService::new();
        service.create_authorization_policy("p").await.unwrap();
        service
            .create_content_key(KeyId::new_random(), &[1, 2, 3], "k", ContentKeyType::FairPlayCertificatePassword)
            .await
            .unwrap();

        let restored = MemoryService::from_json(&service.to_json().unwrap()).unwrap();

        assert_eq!(restored.snapshot(), service.snapshot());
        let key = restored.content_keys_named("k").pop().unwrap();
        assert_eq!(restored.clear_value(&key.id).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn deleting_missing_key_fails() {
        let service = MemoryService::new();
        let ghost = ContentKey {
            id: KeyId::new_random(),
            name: "ghost".into(),
            key_type: ContentKeyType::CommonEncryption,
        };
        let err = service.delete_content_key(&ghost).await.unwrap_err();
        assert_eq!(err.operation, Operation::DeleteContentKey);
    }
}
