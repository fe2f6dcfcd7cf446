//! Fetch, decrypt and parse an environment file in one step.
//!
//! # Security Guarantees
//!
//! - **Memory only**: decrypted content never touches the filesystem
//! - **All or nothing**: a fetch or decrypt failure yields no entries at all
//! - **No value logging**: only locations, key identifiers and counts are logged

use crate::cipher::{EnvelopeCipher, ENVELOPE_CONTENT_TYPE};
use crate::envfile::{self, ContentType, EnvEntry};
use crate::error::{Error, Result};
use crate::locator::Locator;
use crate::store::ObjectStore;
use std::sync::Arc;
use tracing::debug;

/// Composes an [`ObjectStore`], an [`EnvelopeCipher`] and the envfile parser.
#[derive(Clone)]
pub struct SecretLoader {
    store: Arc<dyn ObjectStore>,
    cipher: EnvelopeCipher,
    content_type: ContentType,
}

impl SecretLoader {
    pub fn new(store: Arc<dyn ObjectStore>, cipher: EnvelopeCipher) -> Self {
        Self {
            store,
            cipher,
            content_type: ContentType::default(),
        }
    }

    /// Set the content type used to parse decrypted files.
    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    /// Load the environment stored at `url`, sealed under `key_id`.
    ///
    /// An empty `url` or `key_id` means secrets are not configured: the result is
    /// empty and no backend is contacted.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `url` is not a recognised storage address
    /// - The object cannot be fetched
    /// - The envelope cannot be decrypted under `key_id`
    /// - The plaintext is not valid UTF-8, or not a valid JSON/YAML map
    pub async fn load(&self, url: &str, key_id: &str, escape: bool) -> Result<Vec<EnvEntry>> {
        if url.is_empty() || key_id.is_empty() {
            debug!("Not configured to load secrets");
            return Ok(Vec::new());
        }

        debug!(secure_environment_url = url, "Attempting to load secure environment");

        let locator = Locator::parse(url)?;
        let envelope = self.store.get(&locator).await?;

        debug!("Decrypting with {}", key_id);
        let plaintext = self.cipher.decrypt(key_id, &envelope).await?;

        let text = String::from_utf8(plaintext).map_err(|_| self.not_utf8())?;

        let entries = envfile::parse(self.content_type, &text, escape)?;
        debug!("Loaded {} environment entries", entries.len());

        Ok(entries)
    }

    /// Encrypt `plaintext` under `key_id` and store the envelope at `url`.
    ///
    /// Returns the stored envelope bytes.
    pub async fn import(&self, url: &str, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        if url.is_empty() || key_id.is_empty() {
            return Err(Error::config("Missing required environment variables"));
        }

        let locator = Locator::parse(url)?;

        // Content problems are reported at import time rather than on first load
        let text = std::str::from_utf8(plaintext).map_err(|_| self.not_utf8())?;
        let count = envfile::parse(self.content_type, text, false)?.len();
        debug!("Importing {} environment entries", count);

        let envelope = self.cipher.encrypt(key_id, plaintext).await?;
        self.store
            .put(&locator, envelope.clone(), ENVELOPE_CONTENT_TYPE)
            .await?;

        debug!("Stored encrypted environment at {}", locator);
        Ok(envelope)
    }

    fn not_utf8(&self) -> Error {
        Error::InvalidContent {
            format: self.content_type.to_string(),
            message: "content is not valid UTF-8".to_string(),
        }
    }
}

/// Render entries as `export NAME=VALUE` lines, one per entry.
pub fn format_exports(entries: &[EnvEntry]) -> String {
    entries
        .iter()
        .map(|entry| format!("export {}\n", entry))
        .collect()
}
