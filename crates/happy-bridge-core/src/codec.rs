//! Envelope codec: per-session authenticated encryption of wire records.
//!
//! Two layouts are understood:
//! - `dataKey`: `[0x00][12-byte nonce][AES-256-GCM ciphertext + tag]`
//! - `legacy`: `[24-byte nonce][XSalsa20-Poly1305 secretbox]`
//!
//! Decryption never fails loudly. Anything unreadable comes back as `None` so
//! callers can keep the slot (and the ordering) with empty content.

use std::fmt;

use aes_gcm::{
    Aes256Gcm,
    aead::{Aead, KeyInit, generic_array::GenericArray},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use crypto_secretbox::XSalsa20Poly1305;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key size for both variants.
pub const KEY_SIZE: usize = 32;

/// Version byte prefixed to `dataKey` ciphertexts.
const DATA_KEY_VERSION: u8 = 0;

const GCM_NONCE_SIZE: usize = 12;
const SECRETBOX_NONCE_SIZE: usize = 24;

/// Label for the vendor-token key derived from the machine root key.
pub const VENDOR_TOKEN_LABEL: &[u8] = b"happy-bridge/vendor-token/v1";

/// Codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Encryption key must be {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("Encryption key is not valid base64: {0}")]
    InvalidKeyEncoding(#[from] base64::DecodeError),
    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Encryption failed")]
    Encryption,
    #[error("Key derivation failed")]
    KeyDerivation,
}

/// Encryption scheme of a session. Fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EncryptionVariant {
    /// XSalsa20-Poly1305 secretbox, used by older sessions.
    Legacy,
    /// AES-256-GCM with a version byte.
    #[default]
    DataKey,
}

/// A 32-byte symmetric key, zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Build a key from raw bytes.
    ///
    /// # Errors
    /// Returns error unless `bytes` is exactly [`KEY_SIZE`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CodecError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    /// Build a key from its base64 encoding.
    ///
    /// # Errors
    /// Returns error if the encoding is invalid or the key has the wrong length.
    pub fn from_base64(encoded: &str) -> Result<Self, CodecError> {
        let mut raw = BASE64.decode(encoded.trim())?;
        let key = Self::from_slice(&raw);
        raw.zeroize();
        key
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Base64 encoding of the key.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Encrypts and decrypts records for one session.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    key: SessionKey,
    variant: EncryptionVariant,
}

impl EnvelopeCodec {
    /// Create a codec for a session key and variant.
    #[must_use]
    pub const fn new(key: SessionKey, variant: EncryptionVariant) -> Self {
        Self { key, variant }
    }

    /// The variant this codec writes and reads.
    #[must_use]
    pub const fn variant(&self) -> EncryptionVariant {
        self.variant
    }

    /// Serialize `record` as JSON and encrypt it into a base64 blob.
    ///
    /// # Errors
    /// Returns error if serialization or encryption fails.
    pub fn encrypt<T: Serialize + ?Sized>(&self, record: &T) -> Result<String, CodecError> {
        let plaintext = serde_json::to_vec(record)?;
        let sealed = self.encrypt_bytes(&plaintext)?;
        Ok(BASE64.encode(sealed))
    }

    /// Decrypt a base64 blob back into a record.
    ///
    /// Returns `None` for malformed input, authentication failure, or JSON
    /// that does not fit `T`.
    #[must_use]
    pub fn decrypt<T: DeserializeOwned>(&self, ciphertext: &str) -> Option<T> {
        let sealed = BASE64.decode(ciphertext).ok()?;
        let plaintext = self.decrypt_bytes(&sealed)?;
        serde_json::from_slice(&plaintext).ok()
    }

    /// Encrypt raw bytes under the session variant.
    ///
    /// # Errors
    /// Returns error if the cipher rejects the input.
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self.variant {
            EncryptionVariant::DataKey => seal_data_key(&self.key, plaintext),
            EncryptionVariant::Legacy => seal_legacy(&self.key, plaintext),
        }
    }

    /// Decrypt raw bytes under the session variant.
    #[must_use]
    pub fn decrypt_bytes(&self, sealed: &[u8]) -> Option<Vec<u8>> {
        match self.variant {
            EncryptionVariant::DataKey => open_data_key(&self.key, sealed),
            EncryptionVariant::Legacy => open_legacy(&self.key, sealed),
        }
    }
}

fn seal_data_key(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CodecError::Encryption)?;

    let mut nonce = [0u8; GCM_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| CodecError::Encryption)?;

    let mut out = Vec::with_capacity(1 + GCM_NONCE_SIZE + ciphertext.len());
    out.push(DATA_KEY_VERSION);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_data_key(key: &SessionKey, sealed: &[u8]) -> Option<Vec<u8>> {
    let (&version, rest) = sealed.split_first()?;
    if version != DATA_KEY_VERSION || rest.len() < GCM_NONCE_SIZE {
        return None;
    }
    let (nonce, ciphertext) = rest.split_at(GCM_NONCE_SIZE);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).ok()?;
    cipher.decrypt(GenericArray::from_slice(nonce), ciphertext).ok()
}

fn seal_legacy(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
    let cipher =
        XSalsa20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| CodecError::Encryption)?;

    let mut nonce = [0u8; SECRETBOX_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let boxed = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| CodecError::Encryption)?;

    let mut out = Vec::with_capacity(SECRETBOX_NONCE_SIZE + boxed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&boxed);
    Ok(out)
}

fn open_legacy(key: &SessionKey, sealed: &[u8]) -> Option<Vec<u8>> {
    if sealed.len() < SECRETBOX_NONCE_SIZE {
        return None;
    }
    let (nonce, boxed) = sealed.split_at(SECRETBOX_NONCE_SIZE);
    let cipher = XSalsa20Poly1305::new_from_slice(key.as_bytes()).ok()?;
    cipher.decrypt(GenericArray::from_slice(nonce), boxed).ok()
}

/// Derive the vendor-token key from the machine root key.
///
/// # Errors
/// Returns error if HKDF expansion fails.
pub fn derive_vendor_key(root: &SessionKey) -> Result<SessionKey, CodecError> {
    let hk = Hkdf::<Sha256>::new(None, root.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(VENDOR_TOKEN_LABEL, &mut okm)
        .map_err(|_| CodecError::KeyDerivation)?;
    let key = SessionKey(okm);
    okm.zeroize();
    Ok(key)
}

/// Encrypts third-party vendor tokens at rest under a key derived from the
/// machine root key.
#[derive(Debug, Clone)]
pub struct VendorTokenCodec {
    inner: EnvelopeCodec,
}

impl VendorTokenCodec {
    /// Create the sub-codec from the machine root key.
    ///
    /// # Errors
    /// Returns error if key derivation fails.
    pub fn from_root_key(root: &SessionKey) -> Result<Self, CodecError> {
        Ok(Self {
            inner: EnvelopeCodec::new(derive_vendor_key(root)?, EncryptionVariant::DataKey),
        })
    }

    /// Encrypt a vendor token.
    ///
    /// # Errors
    /// Returns error if encryption fails.
    pub fn encrypt_token(&self, token: &str) -> Result<String, CodecError> {
        self.inner.encrypt(token)
    }

    /// Decrypt a vendor token, `None` if unreadable.
    #[must_use]
    pub fn decrypt_token(&self, ciphertext: &str) -> Option<String> {
        self.inner.decrypt(ciphertext)
    }
}
