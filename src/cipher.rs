//! Envelope encryption for environment files.
//!
//! A fresh data key is generated by the key-management backend for every
//! [`EnvelopeCipher::encrypt`] call. The data key seals the plaintext with
//! ChaCha20-Poly1305 and only its wrapped form is kept, next to the nonce and
//! ciphertext, in a JSON [`Envelope`]:
//!
//! ```text
//! {Enc(KMS, DEK), Enc(DEK, plaintext), nonce, header}
//! ```
//!
//! The header fields (`version`, `algorithm`, `key_id`) are authenticated as
//! associated data. Decryption fails closed: any structural problem, backend
//! refusal or tag mismatch is a [`Error::DecryptionFailed`].

use crate::error::{Error, Result};
use crate::kms::{KeyManagement, DATA_KEY_SIZE};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Media type used when storing envelopes.
pub const ENVELOPE_CONTENT_TYPE: &str = "application/json";

/// Size of the nonce in bytes (96 bits for ChaCha20-Poly1305)
const NONCE_SIZE: usize = 12;

/// Symmetric algorithms an envelope may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl Algorithm {
    fn as_str(&self) -> &'static str {
        match self {
            Algorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

/// Serialized bundle of wrapped data key, nonce and ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub version: u32,
    pub algorithm: Algorithm,
    /// Master key the data key was wrapped under, as reported by the backend
    pub key_id: String,
    /// Base64 wrapped data key
    pub encrypted_key: String,
    /// Base64 nonce
    pub nonce: String,
    /// Base64 ciphertext including the authentication tag
    pub ciphertext: String,
}

impl Envelope {
    /// Serialize to the on-storage byte form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::encryption(format!("failed to serialize envelope: {}", e)))
    }

    /// Parse the on-storage byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::decryption_failed(format!("malformed envelope: {}", e)))
    }

    fn associated_data(&self) -> Vec<u8> {
        associated_data(self.version, self.algorithm, &self.key_id)
    }
}

fn associated_data(version: u32, algorithm: Algorithm, key_id: &str) -> Vec<u8> {
    format!("{}\n{}\n{}", version, algorithm.as_str(), key_id).into_bytes()
}

/// Encrypts and decrypts envelopes through a key-management backend.
#[derive(Clone)]
pub struct EnvelopeCipher {
    kms: Arc<dyn KeyManagement>,
}

impl EnvelopeCipher {
    /// Create a cipher bound to one backend instance (and its credentials).
    pub fn new(kms: Arc<dyn KeyManagement>) -> Self {
        Self { kms }
    }

    /// Seal `plaintext` under a fresh data key generated for `key_id`.
    ///
    /// # Example
    ///
    /// ```
    /// use secure_environment::cipher::EnvelopeCipher;
    /// use secure_environment::kms::LocalKms;
    /// use std::sync::Arc;
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let cipher = EnvelopeCipher::new(Arc::new(LocalKms::new().with_key("alias/app")));
    /// let envelope = cipher.encrypt("alias/app", b"API_KEY=abc").await.unwrap();
    /// let plaintext = cipher.decrypt("alias/app", &envelope).await.unwrap();
    /// assert_eq!(plaintext, b"API_KEY=abc");
    /// # }
    /// ```
    pub async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let data_key = self.kms.generate_data_key(key_id).await?;
        if data_key.plaintext.len() != DATA_KEY_SIZE {
            return Err(Error::encryption(format!(
                "data key has wrong size: expected {}, got {}",
                DATA_KEY_SIZE,
                data_key.plaintext.len()
            )));
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&data_key.plaintext));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = associated_data(ENVELOPE_VERSION, Algorithm::ChaCha20Poly1305, &data_key.key_id);

        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| Error::encryption(e.to_string()))?;

        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            algorithm: Algorithm::ChaCha20Poly1305,
            key_id: data_key.key_id.clone(),
            encrypted_key: BASE64.encode(&data_key.wrapped),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(&ciphertext),
        };

        debug!(
            "Sealed {} bytes under {} ({} byte envelope payload)",
            plaintext.len(),
            envelope.key_id,
            ciphertext.len()
        );

        envelope.to_bytes()
    }

    /// Open an envelope produced by [`EnvelopeCipher::encrypt`].
    ///
    /// The wrapped data key is unwrapped under `key_id`, the key the caller expects,
    /// not under the identifier recorded in the envelope.
    pub async fn decrypt(&self, key_id: &str, envelope: &[u8]) -> Result<Vec<u8>> {
        let envelope = Envelope::from_bytes(envelope)?;

        if envelope.version != ENVELOPE_VERSION {
            return Err(Error::decryption_failed(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }

        let wrapped = decode_field("encrypted_key", &envelope.encrypted_key)?;
        let nonce = decode_field("nonce", &envelope.nonce)?;
        let ciphertext = decode_field("ciphertext", &envelope.ciphertext)?;

        if nonce.len() != NONCE_SIZE {
            return Err(Error::decryption_failed(format!(
                "invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }

        debug!("Unwrapping data key for envelope sealed under {}", envelope.key_id);
        let data_key = self
            .kms
            .unwrap(key_id, &wrapped)
            .await
            .map_err(|e| Error::decryption_failed(e.to_string()))?;

        if data_key.len() != DATA_KEY_SIZE {
            return Err(Error::decryption_failed(format!(
                "data key has wrong size: expected {}, got {}",
                DATA_KEY_SIZE,
                data_key.len()
            )));
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&data_key));
        let aad = envelope.associated_data();

        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::decryption_failed("authentication tag mismatch"))
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| Error::decryption_failed(format!("invalid base64 in {}: {}", name, e)))
}
