//! Error types for secure-environment.

use thiserror::Error;

/// Result type alias using the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading, encrypting or running with secrets.
#[derive(Error, Debug)]
pub enum Error {
    /// The URL matches none of the known storage-address dialects
    #[error("not an s3 url: {url}")]
    NotAStorageUrl { url: String },

    /// Reading an object from storage failed
    #[error("failed to fetch s3://{bucket}/{key}: {message}")]
    Fetch {
        bucket: String,
        key: String,
        message: String,
    },

    /// Writing an object to storage failed
    #[error("failed to store s3://{bucket}/{key}: {message}")]
    Store {
        bucket: String,
        key: String,
        message: String,
    },

    /// The key-management backend refused or failed a request
    #[error("key management error for {key_id}: {message}")]
    KeyManagement { key_id: String, message: String },

    /// The envelope could not be opened
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    /// The plaintext could not be sealed
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// Decrypted content is not in the expected format
    #[error("invalid {format} content: {message}")]
    InvalidContent { format: String, message: String },

    /// The command to execute could not be resolved
    #[error("command not found: {command}")]
    CommandNotFound { command: String },

    /// Spawning the child process failed
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Forwarding a signal to the child failed
    #[error("failed to forward signal {signal} to pid {pid}: {source}")]
    Signal {
        signal: i32,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// Invalid or incomplete configuration
    #[error("configuration error: {message}")]
    Config { message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a decryption failure
    pub fn decryption_failed(reason: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            reason: reason.into(),
        }
    }

    /// Create an encryption failure
    pub fn encryption(reason: impl Into<String>) -> Self {
        Self::Encryption {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a key-management error
    pub fn key_management(key_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::KeyManagement {
            key_id: key_id.into(),
            message: message.into(),
        }
    }
}
