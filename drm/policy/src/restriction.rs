use data_encoding::{BASE64, BASE64_NOPAD, BASE64URL_NOPAD};
use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, PolicyResult};

/**
    Name given to the JWT restriction on every policy option.
*/
pub const RESTRICTION_NAME: &str = "jwt_content_key_authorization_policy_restriction";

const TEMPLATE_NAMESPACE: &str =
    "http://schemas.microsoft.com/Azure/MediaServices/KeyDelivery/TokenRestrictionTemplate/v1";
const INSTANCE_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestrictionKind {
    TokenRestricted = 1,
}

/**
    Access rule attached to a policy option.

    Built once per run and shared by every scheme, so every license
    path validates tokens against the same key, audience and issuer.
    There are no setters; a restriction cannot change after it is built.
*/
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Restriction {
    name: String,
    kind: RestrictionKind,
    requirements: String,
}

impl Restriction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RestrictionKind {
        self.kind
    }

    /**
        Serialized token restriction template.
    */
    pub fn requirements(&self) -> &str {
        &self.requirements
    }
}

/**
    Build the token restriction shared by all DRM schemes.

    `verification_key` is the symmetric JWT signing key, base64url
    encoded (standard base64 is tolerated). Fails with
    [`PolicyError::InvalidKeyMaterial`] if it is empty or undecodable.
*/
pub fn build_restriction(
    verification_key: &str,
    audience: &str,
    issuer: &str,
) -> PolicyResult<Restriction> {
    let key = decode_verification_key(verification_key)?;
    Ok(Restriction {
        name: RESTRICTION_NAME.to_owned(),
        kind: RestrictionKind::TokenRestricted,
        requirements: token_restriction_template(&key, audience, issuer),
    })
}

fn decode_verification_key(encoded: &str) -> PolicyResult<Vec<u8>> {
    let trimmed = encoded.trim().trim_end_matches('=');
    if trimmed.is_empty() {
        return Err(PolicyError::InvalidKeyMaterial(
            "verification key is empty".into(),
        ));
    }

    let key = BASE64URL_NOPAD
        .decode(trimmed.as_bytes())
        .or_else(|_| BASE64_NOPAD.decode(trimmed.as_bytes()))
        .map_err(|e| PolicyError::InvalidKeyMaterial(format!("verification key: {e}")))?;

    if key.is_empty() {
        return Err(PolicyError::InvalidKeyMaterial(
            "verification key decodes to zero bytes".into(),
        ));
    }
    Ok(key)
}

fn token_restriction_template(key: &[u8], audience: &str, issuer: &str) -> String {
    format!(
        "<TokenRestrictionTemplate xmlns:i=\"{INSTANCE_NAMESPACE}\" xmlns=\"{TEMPLATE_NAMESPACE}\">\
         <AlternateVerificationKeys />\
         <Audience>{audience}</Audience>\
         <Issuer>{issuer}</Issuer>\
         <PrimaryVerificationKey i:type=\"SymmetricVerificationKey\">\
         <KeyValue>{key}</KeyValue>\
         </PrimaryVerificationKey>\
         <RequiredClaims />\
         <TokenType>JWT</TokenType>\
         </TokenRestrictionTemplate>",
        audience = escape(audience),
        issuer = escape(issuer),
        key = BASE64.encode(key),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // 0x00..=0x1f, unpadded
    const KEY_URL: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8";

    #[test]
    fn builds_token_restricted_template() {
        let r = build_restriction(KEY_URL, "urn:player", "https://issuer.example").unwrap();
        assert_eq!(r.name(), RESTRICTION_NAME);
        assert_eq!(r.kind(), RestrictionKind::TokenRestricted);
        let xml = r.requirements();
        assert!(xml.contains("<Audience>urn:player</Audience>"));
        assert!(xml.contains("<Issuer>https://issuer.example</Issuer>"));
        assert!(xml.contains("<TokenType>JWT</TokenType>"));
        assert!(xml.contains(
            "<KeyValue>AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=</KeyValue>"
        ));
    }

    #[test]
    fn accepts_url_safe_alphabet() {
        // 0xfb 0xff -> "-_8" in base64url, "+/8" in standard base64
        let url = build_restriction("-_8", "a", "i").unwrap();
        let std = build_restriction("+/8=", "a", "i").unwrap();
        assert_eq!(url, std);
    }

    #[test]
    fn escapes_audience_and_issuer() {
        let r = build_restriction(KEY_URL, "a&b", "<issuer>").unwrap();
        assert!(r.requirements().contains("<Audience>a&amp;b</Audience>"));
        assert!(r.requirements().contains("<Issuer>&lt;issuer&gt;</Issuer>"));
    }

    #[test]
    fn rejects_empty_key() {
        let err = build_restriction("", "a", "i").unwrap_err();
        assert!(matches!(err, PolicyError::InvalidKeyMaterial(_)));
        let err = build_restriction("  ==", "a", "i").unwrap_err();
        assert!(matches!(err, PolicyError::InvalidKeyMaterial(_)));
    }

    #[test]
    fn rejects_undecodable_key() {
        let err = build_restriction("not*base64", "a", "i").unwrap_err();
        assert!(matches!(err, PolicyError::InvalidKeyMaterial(_)));
    }

    #[test]
    fn same_inputs_build_identical_restrictions() {
        let a = build_restriction(KEY_URL, "aud", "iss").unwrap();
        let b = build_restriction(KEY_URL, "aud", "iss").unwrap();
        assert_eq!(a, b);
    }
}
