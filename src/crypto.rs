use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD};

use sha2::{Digest, Sha256};

const ENVELOPE_TAG: &str = "gcm256";
const NONCE_LEN: usize = 12;

/// Hex-encoded SHA-256 digest, used for the delivered-payload hash kept on
/// dedup records.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        use std::fmt::Write as _;
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("POLLER_ENCRYPTION_KEY is not set")]
    MissingKey,

    #[error("encryption key must be exactly 32 bytes")]
    InvalidKey,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("malformed ciphertext envelope")]
    Malformed,

    #[error("unsupported cipher tag: {0}")]
    UnsupportedTag(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("decrypted value is not valid UTF-8")]
    InvalidUtf8,
}

/// Symmetric cipher for credential fields stored at rest.
///
/// Ciphertext is self-describing: `gcm256:<base64 nonce>:<base64 ciphertext>`.
/// The leading tag names the algorithm so keys can be rotated to a new cipher
/// without a schema change.
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    pub fn from_key(key: &str) -> Result<Self, CryptoError> {
        let bytes = key.as_bytes();
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey);
        }
        Ok(Self {
            cipher: Aes256Gcm::new_from_slice(bytes).map_err(|_| CryptoError::InvalidKey)?,
        })
    }

    pub fn from_env() -> Result<Self, CryptoError> {
        let key = std::env::var("POLLER_ENCRYPTION_KEY").map_err(|_| CryptoError::MissingKey)?;
        Self::from_key(&key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(format!(
            "{ENVELOPE_TAG}:{}:{}",
            STANDARD.encode(nonce_bytes),
            STANDARD.encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, envelope: &str) -> Result<String, CryptoError> {
        let mut parts = envelope.splitn(3, ':');
        let tag = parts.next().ok_or(CryptoError::Malformed)?;
        let nonce_b64 = parts.next().ok_or(CryptoError::Malformed)?;
        let ciphertext_b64 = parts.next().ok_or(CryptoError::Malformed)?;

        if tag != ENVELOPE_TAG {
            return Err(CryptoError::UnsupportedTag(tag.to_string()));
        }

        let nonce_bytes = STANDARD
            .decode(nonce_b64)
            .map_err(|_| CryptoError::Malformed)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CryptoError::Malformed);
        }
        let ciphertext = STANDARD
            .decode(ciphertext_b64)
            .map_err(|_| CryptoError::Malformed)?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }
}
