use log::{debug, info};
use rand::RngCore;

use crate::error::{PolicyError, PolicyResult};
use crate::service::MediaKeyService;
use crate::types::{ContentKey, ContentKeyType, KeyId};

/**
    Length of generated content keys and IVs, in bytes.
*/
pub const CONTENT_KEY_LENGTH: usize = 16;

/**
    Fill a buffer of `length` bytes from the thread-local CSPRNG.
*/
pub fn random_bytes(length: usize) -> Vec<u8> {
    let mut buf = vec![0u8; length];
    rand::rng().fill_bytes(&mut buf);
    buf
}

/**
    Result of [`KeyRotationManager::ensure_persistent`].

    `superseded` lists every other key sharing the name: the one just
    replaced by a rotation, plus any left behind by an earlier run that
    failed before cleanup. The caller owns their deletion and must only
    issue it after every configuration that references `key` has been
    written.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentKey {
    pub key: ContentKey,
    pub superseded: Vec<ContentKey>,
    pub created: bool,
}

impl PersistentKey {
    /**
        True when keys other than `key` still carry the name, so
        configuration has to be repointed before they can go.
    */
    pub fn has_superseded(&self) -> bool {
        !self.superseded.is_empty()
    }
}

/**
    Creates, verifies and rotates content keys on a media key service.
*/
pub struct KeyRotationManager<'a, S: ?Sized> {
    service: &'a S,
}

impl<'a, S: MediaKeyService + ?Sized> KeyRotationManager<'a, S> {
    pub fn new(service: &'a S) -> Self {
        Self { service }
    }

    /**
        Create a throwaway key of `key_type` under its well-known name.

        The key is not deleted here; the caller deletes it once it has
        derived what it needs from it.
    */
    pub async fn mint_ephemeral(
        &self,
        key_type: ContentKeyType,
        length: usize,
    ) -> PolicyResult<ContentKey> {
        let name = key_type.ephemeral_name().ok_or_else(|| {
            PolicyError::InvalidKeyMaterial(format!("{key_type} is not an ephemeral key type"))
        })?;
        if length == 0 {
            return Err(PolicyError::InvalidKeyMaterial(
                "ephemeral key length must be non-zero".into(),
            ));
        }

        let value = random_bytes(length);
        let key = self
            .service
            .create_content_key(KeyId::new_random(), &value, name, key_type)
            .await?;
        debug!("Minted ephemeral {} key {}", key.key_type, key.id);
        Ok(key)
    }

    /**
        Make sure a key named `name` holds `desired` with type `key_type`.

        Only the newest key with that name is compared. Missing keys are
        created. If the newest key's value or type differs, a brand-new
        key is created under the same name and every existing one is
        returned in [`PersistentKey::superseded`], left in place. If the
        newest key matches, older keys of the same name are returned as
        superseded. If the stored value cannot be read, nothing is
        rotated and [`PolicyError::KeyReadFailure`] is returned.
    */
    pub async fn ensure_persistent(
        &self,
        name: &str,
        desired: &[u8],
        key_type: ContentKeyType,
    ) -> PolicyResult<PersistentKey> {
        if desired.is_empty() {
            return Err(PolicyError::InvalidKeyMaterial(format!(
                "desired value for key '{name}' is empty"
            )));
        }

        let mut existing = self.service.find_content_keys_by_name(name).await?;
        let Some(newest) = existing.pop() else {
            let key = self.create(name, desired, key_type).await?;
            info!("Created {} key '{}' ({})", key_type, name, key.id);
            return Ok(PersistentKey {
                key,
                superseded: Vec::new(),
                created: true,
            });
        };

        let stored = self
            .service
            .get_clear_value(&newest)
            .await
            .map_err(|source| PolicyError::KeyReadFailure {
                name: name.to_owned(),
                source,
            })?;

        if stored == desired && newest.key_type == key_type {
            debug!("Key '{}' ({}) is up to date", name, newest.id);
            for stale in &existing {
                info!(
                    "Key '{}' ({}) is left over from an earlier rotation",
                    name, stale.id
                );
            }
            return Ok(PersistentKey {
                key: newest,
                superseded: existing,
                created: false,
            });
        }

        let key = self.create(name, desired, key_type).await?;
        info!(
            "Rotated {} key '{}': {} supersedes {}",
            key_type, name, key.id, newest.id
        );
        existing.push(newest);
        Ok(PersistentKey {
            key,
            superseded: existing,
            created: true,
        })
    }

    async fn create(
        &self,
        name: &str,
        value: &[u8],
        key_type: ContentKeyType,
    ) -> PolicyResult<ContentKey> {
        Ok(self
            .service
            .create_content_key(KeyId::new_random(), value, name, key_type)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;
    use crate::error::Operation;
    use crate::memory::{MemoryService, ServiceCall};

    const ASK: [u8; 16] = hex!("000102030405060708090a0b0c0d0e0f");

    #[test]
    fn random_bytes_have_requested_length_and_vary() {
        let a = random_bytes(CONTENT_KEY_LENGTH);
        let b = random_bytes(CONTENT_KEY_LENGTH);
        assert_eq!(a.len(), CONTENT_KEY_LENGTH);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn mint_ephemeral_uses_well_known_name() {
        let service = MemoryService::new();
        let keys = KeyRotationManager::new(&service);

        let key = keys
            .mint_ephemeral(ContentKeyType::CommonEncryptionCbcs, CONTENT_KEY_LENGTH)
            .await
            .unwrap();

        assert_eq!(key.name, "common_encryption_cbcs_content_key");
        assert_eq!(key.key_type, ContentKeyType::CommonEncryptionCbcs);
        assert_eq!(service.clear_value(&key.id).unwrap().len(), CONTENT_KEY_LENGTH);
    }

    #[tokio::test]
    async fn mint_ephemeral_rejects_persistent_types() {
        let service = MemoryService::new();
        let keys = KeyRotationManager::new(&service);

        let err = keys
            .mint_ephemeral(ContentKeyType::FairPlayApplicationSecret, CONTENT_KEY_LENGTH)
            .await
            .unwrap_err();

        assert!(matches!(err, PolicyError::InvalidKeyMaterial(_)));
        assert!(service.calls().is_empty());
    }

    #[tokio::test]
    async fn ensure_persistent_creates_missing_key() {
        let service = MemoryService::new();
        let keys = KeyRotationManager::new(&service);

        let result = keys
            .ensure_persistent("ask", &ASK, ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap();

        assert!(result.created);
        assert!(!result.has_superseded());
        assert_eq!(service.clear_value(&result.key.id).unwrap(), ASK);
    }

    #[tokio::test]
    async fn ensure_persistent_is_idempotent() {
        let service = MemoryService::new();
        let keys = KeyRotationManager::new(&service);
        let first = keys
            .ensure_persistent("ask", &ASK, ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap();

        let second = keys
            .ensure_persistent("ask", &ASK, ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap();

        assert!(!second.created);
        assert_eq!(second.key, first.key);
        assert!(second.superseded.is_empty());
        assert_eq!(service.content_key_count(), 1);
    }

    #[tokio::test]
    async fn ensure_persistent_rotates_on_value_change_without_deleting() {
        let service = MemoryService::new();
        let keys = KeyRotationManager::new(&service);
        let old = keys
            .ensure_persistent("ask", &ASK, ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap()
            .key;

        let rotated = keys
            .ensure_persistent("ask", &[0xff; 16], ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap();

        assert_eq!(rotated.superseded, vec![old.clone()]);
        assert_ne!(rotated.key.id, old.id);
        assert_eq!(rotated.key.name, "ask");
        // Old key still exists until the caller repoints and deletes it.
        assert!(service.clear_value(&old.id).is_some());
        assert!(
            !service
                .calls()
                .iter()
                .any(|c| matches!(c, ServiceCall::DeleteContentKey(_)))
        );
    }

    #[tokio::test]
    async fn ensure_persistent_rotates_on_type_change() {
        let service = MemoryService::new();
        let keys = KeyRotationManager::new(&service);
        keys.ensure_persistent("pfx", b"secret", ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap();

        let rotated = keys
            .ensure_persistent("pfx", b"secret", ContentKeyType::FairPlayCertificatePassword)
            .await
            .unwrap();

        assert!(rotated.has_superseded());
        assert_eq!(
            rotated.key.key_type,
            ContentKeyType::FairPlayCertificatePassword
        );
    }

    #[tokio::test]
    async fn ensure_persistent_returns_leftover_keys_when_newest_matches() {
        let service = MemoryService::new();
        let keys = KeyRotationManager::new(&service);
        let old = keys
            .ensure_persistent("ask", &ASK, ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap()
            .key;
        // Rotation whose cleanup never happened.
        let new = keys
            .ensure_persistent("ask", &[0xff; 16], ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap()
            .key;

        let again = keys
            .ensure_persistent("ask", &[0xff; 16], ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap();

        assert!(!again.created);
        assert_eq!(again.key, new);
        assert_eq!(again.superseded, vec![old]);
        assert_eq!(service.content_key_count(), 2);
    }

    #[tokio::test]
    async fn rotation_supersedes_every_key_with_the_name() {
        let service = MemoryService::new();
        let keys = KeyRotationManager::new(&service);
        let first = keys
            .ensure_persistent("ask", &ASK, ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap()
            .key;
        let second = keys
            .ensure_persistent("ask", &[0xff; 16], ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap()
            .key;

        let third = keys
            .ensure_persistent("ask", &[0xaa; 16], ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap();

        assert!(third.created);
        assert_eq!(third.superseded, vec![first, second]);
    }

    #[tokio::test]
    async fn ensure_persistent_fails_safe_when_value_unreadable() {
        let service = MemoryService::new();
        let keys = KeyRotationManager::new(&service);
        keys.ensure_persistent("ask", &ASK, ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap();
        service.fail_next(Operation::GetClearValue);

        let err = keys
            .ensure_persistent("ask", &[0xff; 16], ContentKeyType::FairPlayApplicationSecret)
            .await
            .unwrap_err();

        assert!(matches!(err, PolicyError::KeyReadFailure { ref name, .. } if name == "ask"));
        assert_eq!(service.content_key_count(), 1);
    }
}
