use crate::address::{normalize, EmailAddress};
use crate::crypto::{self, ContentKey, CryptoError};
use crate::error::{MailError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use k256::SecretKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

const ARCHIVE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(pub String);

impl KeyId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Public key plus its identifier. Owned by the directory; the core only
/// reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRef {
    pub key_id: KeyId,
    pub public_key: Vec<u8>,
}

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// `Ok(None)` means the address has no account/key.
    async fn lookup(&self, address: &EmailAddress) -> Result<Option<KeyRef>>;
}

/// Directory backed by a map keyed on normalized address.
#[derive(Default)]
pub struct InMemoryKeyDirectory {
    entries: RwLock<HashMap<String, KeyRef>>,
}

impl InMemoryKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, address: &EmailAddress, key: KeyRef) {
        self.entries.write().insert(address.normalized(), key);
    }

    pub fn remove(&self, address: &EmailAddress) -> Option<KeyRef> {
        self.entries.write().remove(&address.normalized())
    }
}

#[async_trait]
impl KeyDirectory for InMemoryKeyDirectory {
    async fn lookup(&self, address: &EmailAddress) -> Result<Option<KeyRef>> {
        Ok(self.entries.read().get(&normalize(address.address())).cloned())
    }
}

/// Local private key material.
pub trait PrivateKeyStore: Send + Sync {
    /// Create and keep a new key pair under `key_id`.
    fn generate_key_pair(&self, key_id: &KeyId) -> Result<KeyRef>;

    /// Public half of a held key.
    fn public_key_ref(&self, key_id: &KeyId) -> Result<KeyRef>;

    fn delete_key(&self, key_id: &KeyId) -> Result<()>;

    /// Recover a content key. `KeyNotFound` when `key_id` is not held,
    /// `Decryption` when the wrap does not open.
    fn unwrap_key(&self, key_id: &KeyId, wrapped_key: &[u8]) -> Result<ContentKey>;

    /// Serialize all key material as an opaque archive.
    fn export_archive(&self) -> Result<Vec<u8>>;

    /// Replace all key material with the archive contents, or change nothing.
    fn import_archive(&self, archive: &[u8]) -> Result<()>;

    /// Drop all key material.
    fn reset(&self) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct KeyArchive {
    version: u32,
    keys: BTreeMap<String, String>,
}

/// In-process key store; secrets live in memory only.
#[derive(Default)]
pub struct LocalKeyStore {
    keys: RwLock<HashMap<KeyId, SecretKey>>,
}

impl LocalKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key_id: &KeyId) -> bool {
        self.keys.read().contains_key(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    fn key_ref(key_id: &KeyId, secret: &SecretKey) -> KeyRef {
        use k256::elliptic_curve::sec1::ToEncodedPoint;
        KeyRef {
            key_id: key_id.clone(),
            public_key: secret
                .public_key()
                .to_encoded_point(true)
                .as_bytes()
                .to_vec(),
        }
    }

    fn decode_archive(archive: &[u8]) -> Result<HashMap<KeyId, SecretKey>> {
        let parsed: KeyArchive = serde_json::from_slice(archive)
            .map_err(|e| MailError::SecureKeyArchive(format!("unreadable archive: {e}")))?;
        if parsed.version != ARCHIVE_VERSION {
            return Err(MailError::SecureKeyArchive(format!(
                "unsupported archive version {}",
                parsed.version
            )));
        }
        parsed
            .keys
            .into_iter()
            .map(|(id, encoded)| {
                let bytes = general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|_| MailError::SecureKeyArchive(format!("key {id} is not base64")))?;
                let secret = SecretKey::from_slice(&bytes)
                    .map_err(|_| MailError::SecureKeyArchive(format!("key {id} is invalid")))?;
                Ok((KeyId(id), secret))
            })
            .collect()
    }
}

impl PrivateKeyStore for LocalKeyStore {
    fn generate_key_pair(&self, key_id: &KeyId) -> Result<KeyRef> {
        let mut keys = self.keys.write();
        if keys.contains_key(key_id) {
            return Err(MailError::AlreadyExists(format!("key {key_id}")));
        }
        let (secret, _) = crypto::generate_key_pair();
        let key_ref = Self::key_ref(key_id, &secret);
        keys.insert(key_id.clone(), secret);
        debug!(key_id = %key_id, "Generated key pair");
        Ok(key_ref)
    }

    fn public_key_ref(&self, key_id: &KeyId) -> Result<KeyRef> {
        self.keys
            .read()
            .get(key_id)
            .map(|secret| Self::key_ref(key_id, secret))
            .ok_or_else(|| MailError::KeyNotFound(key_id.to_string()))
    }

    fn delete_key(&self, key_id: &KeyId) -> Result<()> {
        self.keys
            .write()
            .remove(key_id)
            .map(|_| ())
            .ok_or_else(|| MailError::KeyNotFound(key_id.to_string()))
    }

    fn unwrap_key(&self, key_id: &KeyId, wrapped_key: &[u8]) -> Result<ContentKey> {
        let keys = self.keys.read();
        let secret = keys
            .get(key_id)
            .ok_or_else(|| MailError::KeyNotFound(key_id.to_string()))?;
        crypto::unwrap_content_key(secret, wrapped_key).map_err(|e| match e {
            CryptoError::MalformedCiphertext => {
                MailError::Decryption(format!("malformed key wrap for {key_id}"))
            }
            _ => MailError::Decryption(format!("cannot unwrap content key with {key_id}")),
        })
    }

    fn export_archive(&self) -> Result<Vec<u8>> {
        let keys = self.keys.read();
        let archive = KeyArchive {
            version: ARCHIVE_VERSION,
            keys: keys
                .iter()
                .map(|(id, secret)| {
                    (
                        id.0.clone(),
                        general_purpose::STANDARD.encode(secret.to_bytes()),
                    )
                })
                .collect(),
        };
        info!(keys = keys.len(), "Exported key archive");
        serde_json::to_vec(&archive)
            .map_err(|e| MailError::SecureKeyArchive(format!("cannot encode archive: {e}")))
    }

    fn import_archive(&self, archive: &[u8]) -> Result<()> {
        let decoded = match Self::decode_archive(archive) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "Rejected key archive");
                return Err(err);
            }
        };
        let count = decoded.len();
        *self.keys.write() = decoded;
        info!(keys = count, "Imported key archive");
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.keys.write().clear();
        info!("Reset local key material");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_generate_and_unwrap() {
        let store = LocalKeyStore::new();
        let key_id = KeyId::from("k1");
        let key_ref = store.generate_key_pair(&key_id).unwrap();
        assert_eq!(store.public_key_ref(&key_id).unwrap(), key_ref);

        let content_key = ContentKey::generate();
        let wrapped = crypto::wrap_content_key(&key_ref.public_key, &content_key).unwrap();
        let unwrapped = store.unwrap_key(&key_id, &wrapped).unwrap();
        assert_eq!(unwrapped.as_bytes(), content_key.as_bytes());
    }

    #[test]
    fn test_duplicate_key_id_rejected() {
        let store = LocalKeyStore::new();
        store.generate_key_pair(&KeyId::from("k1")).unwrap();
        let err = store.generate_key_pair(&KeyId::from("k1")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_unwrap_unknown_key_is_key_not_found() {
        let store = LocalKeyStore::new();
        let err = store.unwrap_key(&KeyId::from("missing"), &[0u8; 93]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    }

    #[test]
    fn test_archive_roundtrip_restores_keys() {
        let store = LocalKeyStore::new();
        let key_ref = store.generate_key_pair(&KeyId::from("k1")).unwrap();
        let archive = store.export_archive().unwrap();

        store.reset().unwrap();
        assert!(store.is_empty());

        store.import_archive(&archive).unwrap();
        assert_eq!(store.public_key_ref(&KeyId::from("k1")).unwrap(), key_ref);
    }

    #[test]
    fn test_bad_archive_leaves_store_untouched() {
        let store = LocalKeyStore::new();
        store.generate_key_pair(&KeyId::from("k1")).unwrap();

        let err = store.import_archive(b"not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecureKeyArchive);

        let bad_key = br#"{"version":1,"keys":{"k2":"AAAA"}}"#;
        assert_eq!(
            store.import_archive(bad_key).unwrap_err().kind(),
            ErrorKind::SecureKeyArchive
        );
        let wrong_version = br#"{"version":9,"keys":{}}"#;
        assert!(store.import_archive(wrong_version).is_err());

        assert!(store.contains(&KeyId::from("k1")));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_directory_lookup_is_case_insensitive() {
        let directory = InMemoryKeyDirectory::new();
        let address = EmailAddress::parse("Bob@Sealed.Test").unwrap();
        let key = KeyRef {
            key_id: KeyId::from("bob-key"),
            public_key: vec![2; 33],
        };
        directory.publish(&address, key.clone());

        let lookup = EmailAddress::parse("bob@sealed.test").unwrap();
        assert_eq!(directory.lookup(&lookup).await.unwrap(), Some(key));
        directory.remove(&lookup);
        assert_eq!(directory.lookup(&lookup).await.unwrap(), None);
    }
}
