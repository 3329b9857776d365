use core::fmt;

use thiserror::Error;

use crate::types::{DeliveryMechanism, Scheme};

/**
    A call on the media key service.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FindAuthorizationPolicy,
    CreateAuthorizationPolicy,
    CreatePolicyOption,
    AttachPolicyOption,
    UpdatePolicyOption,
    FindDeliveryPolicy,
    CreateDeliveryPolicy,
    UpdateDeliveryPolicy,
    CreateContentKey,
    FindContentKeysByName,
    GetClearValue,
    DeleteContentKey,
    GetAcquisitionUrl,
}

impl Operation {
    pub const fn to_name(self) -> &'static str {
        match self {
            Self::FindAuthorizationPolicy => "find_authorization_policy",
            Self::CreateAuthorizationPolicy => "create_authorization_policy",
            Self::CreatePolicyOption => "create_policy_option",
            Self::AttachPolicyOption => "attach_policy_option",
            Self::UpdatePolicyOption => "update_policy_option",
            Self::FindDeliveryPolicy => "find_delivery_policy",
            Self::CreateDeliveryPolicy => "create_delivery_policy",
            Self::UpdateDeliveryPolicy => "update_delivery_policy",
            Self::CreateContentKey => "create_content_key",
            Self::FindContentKeysByName => "find_content_keys_by_name",
            Self::GetClearValue => "get_clear_value",
            Self::DeleteContentKey => "delete_content_key",
            Self::GetAcquisitionUrl => "get_acquisition_url",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_name())
    }
}

/**
    Failure reported by a media key service implementation.

    `transient` marks failures worth retrying (timeouts, throttling).
*/
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {message}")]
pub struct ServiceError {
    pub operation: Operation,
    pub message: String,
    pub transient: bool,
}

impl ServiceError {
    pub fn new(operation: Operation, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(operation: Operation, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
            transient: true,
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/**
    Errors raised while building or reconciling DRM policy state.
*/
#[derive(Debug, Clone, Error)]
pub enum PolicyError {
    // ── Input ─────────────────────────────────────────────────────────
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
    #[error("required setting '{0}' is missing")]
    ConfigurationMissing(&'static str),
    #[error("invalid value for setting '{name}': {reason}")]
    InvalidConfiguration { name: &'static str, reason: String },

    // ── Remote ────────────────────────────────────────────────────────
    #[error("cannot read clear value of content key '{name}': {source}")]
    KeyReadFailure {
        name: String,
        #[source]
        source: ServiceError,
    },
    #[error(transparent)]
    Remote(#[from] ServiceError),

    // ── Local ─────────────────────────────────────────────────────────
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for PolicyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/**
    Type alias for results that may return a [`PolicyError`].
*/
pub type PolicyResult<T> = std::result::Result<T, PolicyError>;

/**
    Named step of a scheme reconciliation, used to locate failures.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AuthorizationPolicy,
    PersistentKeys,
    PolicyOption(DeliveryMechanism),
    AcquisitionUrls,
    DeliveryPolicy,
    SupersededKeyCleanup,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthorizationPolicy => f.write_str("authorization policy"),
            Self::PersistentKeys => f.write_str("persistent key rotation"),
            Self::PolicyOption(mechanism) => write!(f, "{mechanism} policy option"),
            Self::AcquisitionUrls => f.write_str("acquisition URLs"),
            Self::DeliveryPolicy => f.write_str("delivery policy"),
            Self::SupersededKeyCleanup => f.write_str("superseded key cleanup"),
        }
    }
}

/**
    A [`PolicyError`] bound to the scheme and step it aborted.
*/
#[derive(Debug, Clone, Error)]
#[error("{scheme} reconciliation failed at {step}: {error}")]
pub struct ReconcileError {
    pub scheme: Scheme,
    pub step: Step,
    #[source]
    pub error: PolicyError,
}

impl ReconcileError {
    pub fn new(scheme: Scheme, step: Step, error: impl Into<PolicyError>) -> Self {
        Self {
            scheme,
            step,
            error: error.into(),
        }
    }
}

/**
    Error returned by `FromStr` implementations on enum types.
*/
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_error_names_scheme_step_and_operation() {
        let err = ReconcileError::new(
            Scheme::Cbcs,
            Step::PolicyOption(DeliveryMechanism::FairPlay),
            ServiceError::new(Operation::UpdatePolicyOption, "HTTP 500"),
        );
        assert_eq!(
            err.to_string(),
            "CBCS reconciliation failed at FairPlay policy option: \
             update_policy_option failed: HTTP 500"
        );
    }

    #[test]
    fn key_read_failure_keeps_service_source() {
        let err = PolicyError::KeyReadFailure {
            name: "fairplay_ask".into(),
            source: ServiceError::new(Operation::GetClearValue, "forbidden"),
        };
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "get_clear_value failed: forbidden");
    }
}
