use data_encoding::{BASE64, HEXUPPER};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PolicyResult;
use crate::keys::{CONTENT_KEY_LENGTH, random_bytes};
use crate::types::KeyId;

/**
    Content-encryption IV for CBCS, regenerated on every reconciliation.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentEncryptionIv([u8; CONTENT_KEY_LENGTH]);

impl ContentEncryptionIv {
    pub fn generate() -> Self {
        let mut iv = [0u8; CONTENT_KEY_LENGTH];
        iv.copy_from_slice(&random_bytes(CONTENT_KEY_LENGTH));
        Self(iv)
    }

    pub const fn from_bytes(bytes: [u8; CONTENT_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /**
        Uppercase hex, the form both the option and delivery policy use.
    */
    pub fn to_hex(&self) -> String {
        HEXUPPER.encode(&self.0)
    }
}

/**
    FairPlay key delivery descriptor stored as a policy option's
    configuration.

    References the application secret key and certificate password key
    by id, so it has to be written before any superseded version of
    those keys is removed.
*/
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairPlayDescriptor {
    #[serde(rename = "ASkId")]
    pub ask_id: Uuid,
    #[serde(rename = "FairPlayPfxPasswordId")]
    pub pfx_password_id: Uuid,
    #[serde(rename = "FairPlayPfx")]
    pub pfx: String,
    #[serde(rename = "ContentEncryptionIV")]
    pub content_encryption_iv: String,
}

impl FairPlayDescriptor {
    pub fn new(
        certificate: &[u8],
        password_key: &KeyId,
        ask_key: &KeyId,
        iv: &ContentEncryptionIv,
    ) -> Self {
        Self {
            ask_id: ask_key.uuid(),
            pfx_password_id: password_key.uuid(),
            pfx: BASE64.encode(certificate),
            content_encryption_iv: iv.to_hex(),
        }
    }

    pub fn to_json(&self) -> PolicyResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> PolicyResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn iv_renders_as_uppercase_hex() {
        let iv = ContentEncryptionIv::from_bytes(hex!("00112233445566778899aabbccddeeff"));
        assert_eq!(iv.to_hex(), "00112233445566778899AABBCCDDEEFF");
    }

    #[test]
    fn generated_ivs_differ() {
        assert_ne!(ContentEncryptionIv::generate(), ContentEncryptionIv::generate());
    }

    #[test]
    fn descriptor_uses_service_field_names() {
        let ask = KeyId::new_random();
        let password = KeyId::new_random();
        let iv = ContentEncryptionIv::from_bytes([0xab; 16]);

        let json = FairPlayDescriptor::new(b"pfx", &password, &ask, &iv)
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["ASkId"], ask.uuid().to_string());
        assert_eq!(value["FairPlayPfxPasswordId"], password.uuid().to_string());
        assert_eq!(value["FairPlayPfx"], "cGZ4");
        assert_eq!(value["ContentEncryptionIV"], "AB".repeat(16));
    }

    #[test]
    fn descriptor_parses_back() {
        let descriptor = FairPlayDescriptor::new(
            b"certificate",
            &KeyId::new_random(),
            &KeyId::new_random(),
            &ContentEncryptionIv::generate(),
        );
        let parsed = FairPlayDescriptor::from_json(&descriptor.to_json().unwrap()).unwrap();
        assert_eq!(parsed, descriptor);
    }
}
