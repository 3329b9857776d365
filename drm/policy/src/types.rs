use core::fmt;
use core::ops::BitOr;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseError;
use crate::restriction::Restriction;

/**
    Wire prefix the key service puts in front of content key UUIDs.
*/
pub const CONTENT_KEY_ID_PREFIX: &str = "nb:kid:UUID:";

// ── Delivery mechanisms ─────────────────────────────────────────────

/**
    License delivery mechanism of a policy option.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeliveryMechanism {
    PlayReady,
    Widevine,
    FairPlay,
}

impl DeliveryMechanism {
    pub const fn to_name(self) -> &'static str {
        match self {
            Self::PlayReady => "PlayReady",
            Self::Widevine => "Widevine",
            Self::FairPlay => "FairPlay",
        }
    }
}

impl fmt::Display for DeliveryMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_name())
    }
}

impl FromStr for DeliveryMechanism {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "playready" => Ok(Self::PlayReady),
            "widevine" => Ok(Self::Widevine),
            "fairplay" => Ok(Self::FairPlay),
            _ => Err(ParseError {
                kind: "delivery mechanism",
                value: s.to_owned(),
            }),
        }
    }
}

// ── Content key types ───────────────────────────────────────────────

/**
    Type tag of a content key stored in the key service.

    `CommonEncryption` and `CommonEncryptionCbcs` keys are only ever
    created to mint acquisition URLs. The FairPlay types are long-lived
    auxiliary keys that get rotated.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContentKeyType {
    CommonEncryption,
    CommonEncryptionCbcs,
    FairPlayApplicationSecret,
    FairPlayCertificatePassword,
}

impl ContentKeyType {
    pub const fn to_name(self) -> &'static str {
        match self {
            Self::CommonEncryption => "CommonEncryption",
            Self::CommonEncryptionCbcs => "CommonEncryptionCbcs",
            Self::FairPlayApplicationSecret => "FairPlayApplicationSecret",
            Self::FairPlayCertificatePassword => "FairPlayCertificatePassword",
        }
    }

    /**
        Fixed name under which ephemeral keys of this type are created,
        or `None` for persistent key types.
    */
    pub const fn ephemeral_name(self) -> Option<&'static str> {
        match self {
            Self::CommonEncryption => Some("common_encryption_content_key"),
            Self::CommonEncryptionCbcs => Some("common_encryption_cbcs_content_key"),
            Self::FairPlayApplicationSecret | Self::FairPlayCertificatePassword => None,
        }
    }
}

impl fmt::Display for ContentKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_name())
    }
}

// ── Delivery policy types and protocols ─────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryPolicyType {
    DynamicCommonEncryption,
    DynamicCommonEncryptionCbcs,
}

impl DeliveryPolicyType {
    pub const fn to_name(self) -> &'static str {
        match self {
            Self::DynamicCommonEncryption => "DynamicCommonEncryption",
            Self::DynamicCommonEncryptionCbcs => "DynamicCommonEncryptionCbcs",
        }
    }
}

impl fmt::Display for DeliveryPolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_name())
    }
}

/**
    Set of streaming protocols a delivery policy applies to.

    Bitmask semantics: several protocols may share one policy.
*/
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryProtocols(u32);

impl DeliveryProtocols {
    pub const NONE: Self = Self(0);
    pub const SMOOTH_STREAMING: Self = Self(0x1);
    pub const DASH: Self = Self(0x2);
    pub const HLS: Self = Self(0x4);

    const NAMES: [(Self, &'static str); 3] = [
        (Self::SMOOTH_STREAMING, "SmoothStreaming"),
        (Self::DASH, "Dash"),
        (Self::HLS, "HLS"),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DeliveryProtocols {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for DeliveryProtocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/**
    Keys allowed in a delivery policy configuration map.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeliveryConfigKey {
    PlayReadyLicenseAcquisitionUrl,
    WidevineBaseLicenseAcquisitionUrl,
    FairPlayLicenseAcquisitionUrl,
    CommonEncryptionIvForCbcs,
}

impl fmt::Display for DeliveryConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PlayReadyLicenseAcquisitionUrl => "PlayReadyLicenseAcquisitionUrl",
            Self::WidevineBaseLicenseAcquisitionUrl => "WidevineBaseLicenseAcquisitionUrl",
            Self::FairPlayLicenseAcquisitionUrl => "FairPlayLicenseAcquisitionUrl",
            Self::CommonEncryptionIvForCbcs => "CommonEncryptionIVForCbcs",
        };
        f.write_str(name)
    }
}

pub type DeliveryConfiguration = BTreeMap<DeliveryConfigKey, String>;

// ── Schemes ─────────────────────────────────────────────────────────

/**
    DRM scheme grouping reconciled as one unit.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    /// Widevine and PlayReady under common encryption.
    Cenc,
    /// FairPlay under CBCS.
    Cbcs,
}

impl Scheme {
    pub const fn mechanisms(self) -> &'static [DeliveryMechanism] {
        match self {
            Self::Cenc => &[DeliveryMechanism::Widevine, DeliveryMechanism::PlayReady],
            Self::Cbcs => &[DeliveryMechanism::FairPlay],
        }
    }

    pub const fn delivery_policy_type(self) -> DeliveryPolicyType {
        match self {
            Self::Cenc => DeliveryPolicyType::DynamicCommonEncryption,
            Self::Cbcs => DeliveryPolicyType::DynamicCommonEncryptionCbcs,
        }
    }

    pub fn protocols(self) -> DeliveryProtocols {
        match self {
            Self::Cenc => DeliveryProtocols::DASH | DeliveryProtocols::SMOOTH_STREAMING,
            Self::Cbcs => DeliveryProtocols::HLS,
        }
    }

    pub const fn ephemeral_key_type(self) -> ContentKeyType {
        match self {
            Self::Cenc => ContentKeyType::CommonEncryption,
            Self::Cbcs => ContentKeyType::CommonEncryptionCbcs,
        }
    }

    pub const fn to_name(self) -> &'static str {
        match self {
            Self::Cenc => "CENC",
            Self::Cbcs => "CBCS",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_name())
    }
}

// ── Remote entities ─────────────────────────────────────────────────

/**
    Identity of a content key.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId(Uuid);

impl KeyId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CONTENT_KEY_ID_PREFIX}{}", self.0)
    }
}

/**
    Parse a key id in either `nb:kid:UUID:<uuid>` or bare `<uuid>` form.
*/
impl FromStr for KeyId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.trim();
        let bare = bare.strip_prefix(CONTENT_KEY_ID_PREFIX).unwrap_or(bare);
        Uuid::parse_str(bare).map(Self).map_err(|_| ParseError {
            kind: "content key id",
            value: s.to_owned(),
        })
    }
}

impl TryFrom<String> for KeyId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.to_string()
    }
}

/**
    A content key as the key service describes it. The clear value is
    never carried here; it has to be fetched explicitly.
*/
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentKey {
    pub id: KeyId,
    pub name: String,
    pub key_type: ContentKeyType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOption {
    pub id: String,
    pub name: String,
    pub mechanism: DeliveryMechanism,
    pub restrictions: Vec<Restriction>,
    pub configuration: String,
}

impl PolicyOption {
    /**
        True when the option already carries exactly the desired content.
    */
    pub fn matches(&self, desired: &DesiredOption) -> bool {
        self.mechanism == desired.mechanism
            && self.restrictions == desired.restrictions
            && self.configuration == desired.configuration
    }
}

/**
    Desired content of a policy option. Applying it to an existing
    option replaces every field; nothing is merged.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredOption {
    pub name: String,
    pub mechanism: DeliveryMechanism,
    pub restrictions: Vec<Restriction>,
    pub configuration: String,
}

impl DesiredOption {
    pub fn apply_to(&self, existing: &PolicyOption) -> PolicyOption {
        PolicyOption {
            id: existing.id.clone(),
            name: existing.name.clone(),
            mechanism: self.mechanism,
            restrictions: self.restrictions.clone(),
            configuration: self.configuration.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationPolicy {
    pub id: String,
    pub name: String,
    pub options: Vec<PolicyOption>,
}

impl AuthorizationPolicy {
    pub fn option(&self, name: &str) -> Option<&PolicyOption> {
        self.options.iter().find(|o| o.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    pub id: String,
    pub name: String,
    pub policy_type: DeliveryPolicyType,
    pub protocols: DeliveryProtocols,
    pub configuration: DeliveryConfiguration,
}

/**
    Desired content of a delivery policy; a full replacement on update.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredDeliveryPolicy {
    pub name: String,
    pub policy_type: DeliveryPolicyType,
    pub protocols: DeliveryProtocols,
    pub configuration: DeliveryConfiguration,
}

impl DeliveryPolicy {
    pub fn matches(&self, desired: &DesiredDeliveryPolicy) -> bool {
        self.policy_type == desired.policy_type
            && self.protocols == desired.protocols
            && self.configuration == desired.configuration
    }
}

impl DesiredDeliveryPolicy {
    pub fn apply_to(&self, existing: &DeliveryPolicy) -> DeliveryPolicy {
        DeliveryPolicy {
            id: existing.id.clone(),
            name: existing.name.clone(),
            policy_type: self.policy_type,
            protocols: self.protocols,
            configuration: self.configuration.clone(),
        }
    }
}
