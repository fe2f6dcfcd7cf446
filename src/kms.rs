//! Key-management backends that wrap and unwrap data keys.
//!
//! # Security
//!
//! - Plaintext data keys are held in [`Zeroizing`] buffers and wiped on drop
//! - Key material is never logged; only key identifiers are
//! - Backend failures are returned as-is, never retried here

use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_kms::error::DisplayErrorContext;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::DataKeySpec;
use aws_sdk_kms::Client;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::collections::HashMap;
use tracing::debug;
use zeroize::Zeroizing;

/// Size of a data key in bytes (256 bits).
pub const DATA_KEY_SIZE: usize = 32;

const LOCAL_NONCE_SIZE: usize = 12;

/// A freshly generated data key.
pub struct DataKey {
    /// Plaintext key; use it once and let it drop.
    pub plaintext: Zeroizing<Vec<u8>>,
    /// The same key wrapped under the master key.
    pub wrapped: Vec<u8>,
    /// Identifier of the master key as reported by the backend.
    pub key_id: String,
}

/// Client contract with a key-management service.
#[async_trait]
pub trait KeyManagement: Send + Sync {
    /// Generate a 256-bit data key under `key_id`.
    async fn generate_data_key(&self, key_id: &str) -> Result<DataKey>;

    /// Unwrap `wrapped` with the master key `key_id`.
    ///
    /// Must fail if `wrapped` was not produced under `key_id`.
    async fn unwrap(&self, key_id: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

/// AWS KMS backend.
pub struct AwsKms {
    client: Client,
}

impl AwsKms {
    /// Build a client from an SDK configuration whose credentials were resolved once.
    pub fn new(sdk_config: &SdkConfig, endpoint: Option<&str>) -> Self {
        let mut builder = aws_sdk_kms::config::Builder::from(sdk_config);
        if let Some(endpoint_url) = endpoint {
            debug!("Using custom KMS endpoint: {}", endpoint_url);
            builder = builder.endpoint_url(endpoint_url);
        }

        Self {
            client: Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl KeyManagement for AwsKms {
    async fn generate_data_key(&self, key_id: &str) -> Result<DataKey> {
        debug!("Generating data key under {}", key_id);

        let output = self
            .client
            .generate_data_key()
            .key_id(key_id)
            .key_spec(DataKeySpec::Aes256)
            .send()
            .await
            .map_err(|e| Error::key_management(key_id, DisplayErrorContext(&e).to_string()))?;

        let plaintext = output
            .plaintext()
            .map(|blob| Zeroizing::new(blob.as_ref().to_vec()))
            .ok_or_else(|| Error::key_management(key_id, "response carried no plaintext key"))?;
        let wrapped = output
            .ciphertext_blob()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| Error::key_management(key_id, "response carried no wrapped key"))?;

        Ok(DataKey {
            plaintext,
            wrapped,
            key_id: output.key_id().unwrap_or(key_id).to_string(),
        })
    }

    async fn unwrap(&self, key_id: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        debug!("Unwrapping data key with {}", key_id);

        // Passing KeyId makes KMS reject blobs wrapped under any other key
        let output = self
            .client
            .decrypt()
            .key_id(key_id)
            .ciphertext_blob(Blob::new(wrapped.to_vec()))
            .send()
            .await
            .map_err(|e| Error::key_management(key_id, DisplayErrorContext(&e).to_string()))?;

        output
            .plaintext()
            .map(|blob| Zeroizing::new(blob.as_ref().to_vec()))
            .ok_or_else(|| Error::key_management(key_id, "response carried no plaintext key"))
    }
}

/// In-process backend holding master keys in memory.
///
/// Wrapped keys are `nonce || ChaCha20-Poly1305(master, data key)` with the key
/// identifier as associated data, so a blob only unwraps under the key that made it.
#[derive(Default)]
pub struct LocalKms {
    master_keys: HashMap<String, Zeroizing<Vec<u8>>>,
}

impl LocalKms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new random master key under `key_id`.
    pub fn with_key(mut self, key_id: &str) -> Self {
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        self.master_keys
            .insert(key_id.to_string(), Zeroizing::new(key.to_vec()));
        self
    }

    fn master_cipher(&self, key_id: &str) -> Result<ChaCha20Poly1305> {
        let master = self
            .master_keys
            .get(key_id)
            .ok_or_else(|| Error::key_management(key_id, "NotFoundException: key does not exist"))?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(master)))
    }
}

#[async_trait]
impl KeyManagement for LocalKms {
    async fn generate_data_key(&self, key_id: &str) -> Result<DataKey> {
        let cipher = self.master_cipher(key_id)?;

        let data_key = ChaCha20Poly1305::generate_key(&mut OsRng);
        let plaintext = Zeroizing::new(data_key.to_vec());

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|e| Error::key_management(key_id, format!("wrap failed: {}", e)))?;

        let mut wrapped = nonce.to_vec();
        wrapped.extend_from_slice(&sealed);

        Ok(DataKey {
            plaintext,
            wrapped,
            key_id: key_id.to_string(),
        })
    }

    async fn unwrap(&self, key_id: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let cipher = self.master_cipher(key_id)?;

        if wrapped.len() <= LOCAL_NONCE_SIZE {
            return Err(Error::key_management(
                key_id,
                "InvalidCiphertextException: wrapped key is truncated",
            ));
        }
        let (nonce, sealed) = wrapped.split_at(LOCAL_NONCE_SIZE);

        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: key_id.as_bytes(),
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| {
                Error::key_management(
                    key_id,
                    "InvalidCiphertextException: wrapped key does not belong to this key",
                )
            })
    }
}
