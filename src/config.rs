// Secure Environment Configuration Module
//
// This module handles the settings shared by every subcommand. Values come from an
// optional YAML file, then command-line flags and SECURE_ENVIRONMENT_* variables.

use crate::envfile::ContentType;
use crate::error::{Error, Result};
use crate::locator::Locator;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings for loading and storing the encrypted environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// URL of the encrypted environment file
    #[serde(default)]
    pub url: Option<String>,

    /// Key identifier (ARN, alias or key id) of the master key
    #[serde(default)]
    pub key: Option<String>,

    /// Content type of the decrypted file
    #[serde(default)]
    pub env_type: ContentType,

    /// Region for the AWS clients when the URL names none
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible storage and KMS
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Values given on the command line or through the environment.
///
/// `None` leaves the file value in place.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub url: Option<String>,
    pub key: Option<String>,
    pub env_type: Option<ContentType>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = expand_home(path.as_ref())?;
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Build the effective configuration from an optional file and overrides.
    pub fn resolve(file: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let base = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(base.merge(overrides))
    }

    /// Apply overrides on top of this configuration.
    pub fn merge(mut self, overrides: Overrides) -> Self {
        if overrides.url.is_some() {
            self.url = overrides.url;
        }
        if overrides.key.is_some() {
            self.key = overrides.key;
        }
        if let Some(env_type) = overrides.env_type {
            self.env_type = env_type;
        }
        if overrides.region.is_some() {
            self.region = overrides.region;
        }
        if overrides.endpoint.is_some() {
            self.endpoint = overrides.endpoint;
        }
        self
    }

    /// URL, or empty when unset.
    pub fn url(&self) -> &str {
        self.url.as_deref().unwrap_or_default()
    }

    /// Key identifier, or empty when unset.
    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or_default()
    }

    /// Whether both a URL and a key identifier are set.
    ///
    /// Without them `export` and `exec` run without secrets.
    pub fn secrets_configured(&self) -> bool {
        !self.url().is_empty() && !self.key().is_empty()
    }

    /// Parse the configured URL.
    pub fn locator(&self) -> Result<Locator> {
        Locator::parse(self.url())
    }

    /// Validate the configuration for `import`, which needs a destination and a key
    pub fn validate_for_import(&self) -> Result<()> {
        if self.url().is_empty() || self.key().is_empty() {
            return Err(Error::config("Missing required environment variables"));
        }
        Ok(())
    }
}

/// Expand a leading `~` to the home directory.
fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home =
                dirs::home_dir().ok_or_else(|| Error::config("Failed to determine home directory"))?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}
