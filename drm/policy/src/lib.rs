#![allow(clippy::doc_overindented_list_items)]

mod config;
mod error;
mod fairplay;
mod keys;
mod memory;
mod orchestrator;
mod reconcile;
mod restriction;
mod retry;
mod service;
mod types;

pub use self::config::{
    CbcsConfig, CencConfig, ENV_PREFIX, FileSource, JwtConfig, ReconcileConfig, Settings,
};
pub use self::error::{
    Operation, ParseError, PolicyError, PolicyResult, ReconcileError, ServiceError,
    ServiceResult, Step,
};
pub use self::fairplay::{ContentEncryptionIv, FairPlayDescriptor};
pub use self::keys::{CONTENT_KEY_LENGTH, KeyRotationManager, PersistentKey, random_bytes};
pub use self::memory::{DEFAULT_KEY_DELIVERY_HOST, MemoryService, MemoryState, ServiceCall};
pub use self::orchestrator::{Orchestrator, RunReport};
pub use self::reconcile::{
    Action, Change, EntityChange, EntityKind, SchemeOutcome, SchemeReconciler, SchemeSummary,
    strip_query, to_key_delivery_scheme,
};
pub use self::restriction::{RESTRICTION_NAME, Restriction, RestrictionKind, build_restriction};
pub use self::retry::{RetryPolicy, RetryingService};
pub use self::service::MediaKeyService;
pub use self::types::{
    AuthorizationPolicy, CONTENT_KEY_ID_PREFIX, ContentKey, ContentKeyType, DeliveryConfigKey,
    DeliveryConfiguration, DeliveryMechanism, DeliveryPolicy, DeliveryPolicyType,
    DeliveryProtocols, DesiredDeliveryPolicy, DesiredOption, KeyId, PolicyOption, Scheme,
};
