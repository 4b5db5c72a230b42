//! Credential encryption at rest
//!
//! AES-256-GCM with associated data binding each envelope to the
//! credential it belongs to. Supports key rotation via key IDs: new
//! envelopes use the active key, older envelopes decrypt with any
//! registered key. The key set is fixed once the cipher is built.

use crate::error::{InboxError, Result};
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Encrypted envelope persisted in place of the plaintext secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedPayload {
    /// Identifies which key was used for encryption
    pub key_id: String,

    /// Base64-encoded nonce (96-bit for AES-256-GCM)
    pub nonce: String,

    /// Base64-encoded ciphertext (includes the GCM tag)
    pub ciphertext: String,
}

/// Trait for sealing and opening credential payloads
pub trait CredentialCipher: Send + Sync {
    /// Encrypt a JSON payload; `aad` is authenticated but not encrypted
    fn seal(&self, payload: &serde_json::Value, aad: &[u8]) -> Result<SealedPayload>;

    /// Decrypt an envelope produced by `seal` with the same `aad`
    fn open(&self, sealed: &SealedPayload, aad: &[u8]) -> Result<serde_json::Value>;

    /// The key ID new envelopes are sealed with
    fn active_key_id(&self) -> &str;
}

/// AES-256-GCM cipher with key rotation support
pub struct Aes256GcmCipher {
    active_key_id: String,

    /// All registered keys (key_id → cipher)
    keys: HashMap<String, Aes256Gcm>,
}

impl Aes256GcmCipher {
    /// Create a cipher with a single active key
    pub fn new(key_id: impl Into<String>, key: &[u8; 32]) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), Aes256Gcm::new(&(*key).into()));
        Self {
            active_key_id: key_id,
            keys,
        }
    }

    /// Register an older key that may still be needed for decryption
    pub fn with_previous_key(mut self, key_id: impl Into<String>, key: &[u8; 32]) -> Self {
        self.keys
            .entry(key_id.into())
            .or_insert_with(|| Aes256Gcm::new(&(*key).into()));
        self
    }

    /// Build from a base64-encoded 32-byte key
    pub fn from_base64(key_id: impl Into<String>, encoded: &str) -> Result<Self> {
        Ok(Self::new(key_id, &decode_key(encoded)?))
    }

    /// Build from a base64 key held in an environment variable
    pub fn from_env(key_id: impl Into<String>, env_var: &str) -> Result<Self> {
        let encoded = std::env::var(env_var).map_err(|_| {
            InboxError::Config(format!("Encryption key variable '{}' is not set", env_var))
        })?;
        Self::from_base64(key_id, &encoded)
    }

    /// List all registered key IDs
    pub fn key_ids(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }
}

/// Fresh random key, base64 encoded
pub fn generate_key() -> String {
    BASE64.encode(Aes256Gcm::generate_key(OsRng))
}

/// Decode a base64 key and check its length
pub fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| InboxError::Config(format!("Invalid encryption key encoding: {}", e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        InboxError::Config(format!(
            "Encryption key must be 32 bytes, got {}",
            b.len()
        ))
    })
}

impl CredentialCipher for Aes256GcmCipher {
    fn seal(&self, payload: &serde_json::Value, aad: &[u8]) -> Result<SealedPayload> {
        let plaintext = serde_json::to_vec(payload)?;

        let cipher = self.keys.get(&self.active_key_id).ok_or_else(|| {
            InboxError::Config(format!("Active key '{}' not found", self.active_key_id))
        })?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad,
                },
            )
            .map_err(|e| InboxError::Crypto(format!("Encryption failed: {}", e)))?;

        Ok(SealedPayload {
            key_id: self.active_key_id.clone(),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    fn open(&self, sealed: &SealedPayload, aad: &[u8]) -> Result<serde_json::Value> {
        let cipher = self.keys.get(&sealed.key_id).ok_or_else(|| {
            InboxError::Crypto(format!("Decryption key '{}' not registered", sealed.key_id))
        })?;

        let nonce_bytes = BASE64
            .decode(&sealed.nonce)
            .map_err(|e| InboxError::Crypto(format!("Invalid nonce encoding: {}", e)))?;
        if nonce_bytes.len() != 12 {
            return Err(InboxError::Crypto(format!(
                "Invalid nonce length {}",
                nonce_bytes.len()
            )));
        }
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .map_err(|e| InboxError::Crypto(format!("Invalid ciphertext encoding: {}", e)))?;

        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &ciphertext,
                    aad,
                },
            )
            .map_err(|e| InboxError::Crypto(format!("Decryption failed: {}", e)))?;

        serde_json::from_slice(&plaintext).map_err(Into::into)
    }

    fn active_key_id(&self) -> &str {
        &self.active_key_id
    }
}
