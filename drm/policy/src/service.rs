use async_trait::async_trait;

use crate::error::ServiceResult;
use crate::restriction::Restriction;
use crate::types::{
    AuthorizationPolicy, ContentKey, ContentKeyType, DeliveryConfiguration, DeliveryMechanism,
    DeliveryPolicy, DeliveryPolicyType, DeliveryProtocols, KeyId, PolicyOption,
};

/**
    Capabilities the reconciler needs from the remote media key service.

    Every call is awaited to completion before the next dependent step
    starts. Implementations must not retry on their own in a way that
    reorders calls; wrap them in [`RetryingService`](crate::RetryingService)
    instead.
*/
#[async_trait]
pub trait MediaKeyService: Send + Sync {
    // ── Authorization policies ────────────────────────────────────────

    async fn find_authorization_policy(
        &self,
        name: &str,
    ) -> ServiceResult<Option<AuthorizationPolicy>>;

    async fn create_authorization_policy(&self, name: &str) -> ServiceResult<AuthorizationPolicy>;

    async fn create_policy_option(
        &self,
        name: &str,
        mechanism: DeliveryMechanism,
        restrictions: &[Restriction],
        configuration: &str,
    ) -> ServiceResult<PolicyOption>;

    /**
        Link a freshly created option to its authorization policy.
    */
    async fn attach_policy_option(
        &self,
        policy: &AuthorizationPolicy,
        option: &PolicyOption,
    ) -> ServiceResult<()>;

    async fn update_policy_option(&self, option: &PolicyOption) -> ServiceResult<()>;

    // ── Delivery policies ─────────────────────────────────────────────

    async fn find_delivery_policy(&self, name: &str) -> ServiceResult<Option<DeliveryPolicy>>;

    async fn create_delivery_policy(
        &self,
        name: &str,
        policy_type: DeliveryPolicyType,
        protocols: DeliveryProtocols,
        configuration: &DeliveryConfiguration,
    ) -> ServiceResult<DeliveryPolicy>;

    async fn update_delivery_policy(&self, policy: &DeliveryPolicy) -> ServiceResult<()>;

    // ── Content keys ──────────────────────────────────────────────────

    async fn create_content_key(
        &self,
        id: KeyId,
        value: &[u8],
        name: &str,
        key_type: ContentKeyType,
    ) -> ServiceResult<ContentKey>;

    /**
        Every key named `name`, oldest first. Names are not unique: a
        rotation leaves the old and new key side by side until cleanup.
    */
    async fn find_content_keys_by_name(&self, name: &str) -> ServiceResult<Vec<ContentKey>>;

    async fn get_clear_value(&self, key: &ContentKey) -> ServiceResult<Vec<u8>>;

    async fn delete_content_key(&self, key: &ContentKey) -> ServiceResult<()>;

    async fn get_acquisition_url(
        &self,
        key: &ContentKey,
        mechanism: DeliveryMechanism,
    ) -> ServiceResult<String>;
}
