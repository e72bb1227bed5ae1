use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use k256::{ecdh::EphemeralSecret, elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const CONTENT_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Bytes added to every AEAD-sealed blob (nonce prefix + tag).
pub const AEAD_OVERHEAD: usize = NONCE_LEN + TAG_LEN;
const EPHEMERAL_PUB_LEN: usize = 33;
/// Size of one content key wrapped for one recipient.
pub const WRAPPED_KEY_LEN: usize = EPHEMERAL_PUB_LEN + NONCE_LEN + CONTENT_KEY_LEN + TAG_LEN;

const WRAP_INFO: &[u8] = b"mailseal:content-key-wrap:v1";
const BLOCKLIST_DOMAIN: &[u8] = b"mailseal:blocklist:v1:";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption error")]
    EncryptionError,
    #[error("Decryption error")]
    DecryptionError,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Malformed ciphertext")]
    MalformedCiphertext,
}

/// Per-message symmetric key. Never reused across messages.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ContentKey([u8; CONTENT_KEY_LEN]);

impl ContentKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; CONTENT_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; CONTENT_KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContentKey(..)")
    }
}

/// AES-256-GCM seal. Output is `nonce || ciphertext || tag`.
pub fn seal(key: &ContentKey, data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let encrypted = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: data, aad })
        .map_err(|_| CryptoError::EncryptionError)?;

    let mut result = Vec::with_capacity(NONCE_LEN + encrypted.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&encrypted);
    Ok(result)
}

/// Inverse of [`seal`]. Fails on any tampering with the blob or the AAD.
pub fn open(key: &ContentKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < AEAD_OVERHEAD {
        return Err(CryptoError::MalformedCiphertext);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionError)
}

fn derive_wrap_key(shared_secret: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(WRAP_INFO, &mut key)
        .map_err(|_| CryptoError::EncryptionError)?;
    Ok(key)
}

/// ECIES-wrap a content key for one recipient's SEC1 public key.
///
/// Layout: `ephemeral_pub (33) || nonce (12) || encrypted key + tag (48)`.
pub fn wrap_content_key(
    recipient_pub_bytes: &[u8],
    content_key: &ContentKey,
) -> Result<Vec<u8>, CryptoError> {
    let recipient_pub =
        PublicKey::from_sec1_bytes(recipient_pub_bytes).map_err(|_| CryptoError::InvalidKey)?;

    let ephemeral_secret = EphemeralSecret::random(&mut OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral_secret).to_encoded_point(true);
    let shared_secret = ephemeral_secret.diffie_hellman(&recipient_pub);
    let mut wrap_key = derive_wrap_key(shared_secret.raw_secret_bytes())?;

    let cipher = Aes256Gcm::new(&wrap_key.into());
    wrap_key.zeroize();
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let encrypted = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: content_key.as_bytes(),
                aad: ephemeral_pub.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::EncryptionError)?;

    let mut result = Vec::with_capacity(WRAPPED_KEY_LEN);
    result.extend_from_slice(ephemeral_pub.as_bytes());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&encrypted);
    Ok(result)
}

/// Recover a content key wrapped by [`wrap_content_key`].
pub fn unwrap_content_key(secret: &SecretKey, wrapped: &[u8]) -> Result<ContentKey, CryptoError> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(CryptoError::MalformedCiphertext);
    }
    let (ephemeral_pub_bytes, rest) = wrapped.split_at(EPHEMERAL_PUB_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let ephemeral_pub =
        PublicKey::from_sec1_bytes(ephemeral_pub_bytes).map_err(|_| CryptoError::InvalidKey)?;
    let shared_secret =
        k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral_pub.as_affine());
    let mut wrap_key = derive_wrap_key(shared_secret.raw_secret_bytes())
        .map_err(|_| CryptoError::DecryptionError)?;

    let cipher = Aes256Gcm::new(&wrap_key.into());
    wrap_key.zeroize();
    let mut key_bytes = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: ephemeral_pub_bytes,
            },
        )
        .map_err(|_| CryptoError::DecryptionError)?;
    let key = ContentKey::from_slice(&key_bytes);
    key_bytes.zeroize();
    key
}

/// Fresh secp256k1 key pair: `(secret, compressed SEC1 public key)`.
pub fn generate_key_pair() -> (SecretKey, Vec<u8>) {
    let secret = SecretKey::random(&mut OsRng);
    let public = secret.public_key().to_encoded_point(true).as_bytes().to_vec();
    (secret, public)
}

/// Stable, one-way digest used to store blocked values without keeping
/// the raw address server-side. Input must already be normalized.
pub fn hash_blocked_value(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(BLOCKLIST_DOMAIN);
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}
