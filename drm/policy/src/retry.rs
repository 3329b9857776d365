use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;

use crate::error::ServiceResult;
use crate::restriction::Restriction;
use crate::service::MediaKeyService;
use crate::types::{
    AuthorizationPolicy, ContentKey, ContentKeyType, DeliveryConfiguration, DeliveryMechanism,
    DeliveryPolicy, DeliveryPolicyType, DeliveryProtocols, KeyId, PolicyOption,
};

/**
    How often a transient service failure is retried.

    `attempts` counts the first call; a policy with one attempt never
    retries. The wait grows linearly: `delay`, `2 * delay`, ...
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(retries: u32, delay: Duration) -> Self {
        Self {
            attempts: retries.saturating_add(1),
            delay,
        }
    }
}

/**
    Media key service wrapper that retries transient failures.

    Each call is retried in place before returning, so the order of
    calls seen by the reconciler never changes.

    Creates are passed through without retrying. A create that timed out
    may still have landed, and repeating it would either fail with a
    name clash or leave a second entity behind. The reconciler's lookup
    on the next run finds whatever did land.
*/
pub struct RetryingService<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingService<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, mut call: F) -> ServiceResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = ServiceResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.transient && attempt < self.policy.attempts => {
                    warn!(
                        "{} failed (attempt {attempt}/{}): {}; retrying",
                        e.operation, self.policy.attempts, e.message
                    );
                    tokio::time::sleep(self.policy.delay * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl<S: MediaKeyService> MediaKeyService for RetryingService<S> {
    async fn find_authorization_policy(
        &self,
        name: &str,
    ) -> ServiceResult<Option<AuthorizationPolicy>> {
        self.retry(|| self.inner.find_authorization_policy(name))
            .await
    }

    async fn create_authorization_policy(&self, name: &str) -> ServiceResult<AuthorizationPolicy> {
        self.inner.create_authorization_policy(name).await
    }

    async fn create_policy_option(
        &self,
        name: &str,
        mechanism: DeliveryMechanism,
        restrictions: &[Restriction],
        configuration: &str,
    ) -> ServiceResult<PolicyOption> {
        self.inner
            .create_policy_option(name, mechanism, restrictions, configuration)
            .await
    }

    async fn attach_policy_option(
        &self,
        policy: &AuthorizationPolicy,
        option: &PolicyOption,
    ) -> ServiceResult<()> {
        self.retry(|| self.inner.attach_policy_option(policy, option))
            .await
    }

    async fn update_policy_option(&self, option: &PolicyOption) -> ServiceResult<()> {
        self.retry(|| self.inner.update_policy_option(option)).await
    }

    async fn find_delivery_policy(&self, name: &str) -> ServiceResult<Option<DeliveryPolicy>> {
        self.retry(|| self.inner.find_delivery_policy(name)).await
    }

    async fn create_delivery_policy(
        &self,
        name: &str,
        policy_type: DeliveryPolicyType,
        protocols: DeliveryProtocols,
        configuration: &DeliveryConfiguration,
    ) -> ServiceResult<DeliveryPolicy> {
        self.inner
            .create_delivery_policy(name, policy_type, protocols, configuration)
            .await
    }

    async fn update_delivery_policy(&self, policy: &DeliveryPolicy) -> ServiceResult<()> {
        self.retry(|| self.inner.update_delivery_policy(policy))
            .await
    }

    async fn create_content_key(
        &self,
        id: KeyId,
        value: &[u8],
        name: &str,
        key_type: ContentKeyType,
    ) -> ServiceResult<ContentKey> {
        self.inner
            .create_content_key(id, value, name, key_type)
            .await
    }

    async fn find_content_keys_by_name(&self, name: &str) -> ServiceResult<Vec<ContentKey>> {
        self.retry(|| self.inner.find_content_keys_by_name(name))
            .await
    }

    async fn get_clear_value(&self, key: &ContentKey) -> ServiceResult<Vec<u8>> {
        self.retry(|| self.inner.get_clear_value(key)).await
    }

    async fn delete_content_key(&self, key: &ContentKey) -> ServiceResult<()> {
        self.retry(|| self.inner.delete_content_key(key)).await
    }

    async fn get_acquisition_url(
        &self,
        key: &ContentKey,
        mechanism: DeliveryMechanism,
    ) -> ServiceResult<String> {
        self.retry(|| self.inner.get_acquisition_url(key, mechanism))
            .await
    }
}
