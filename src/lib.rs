//! Secure Environment - load envelope-encrypted environment files.
//!
//! This library fetches a KMS envelope-encrypted file from S3, decrypts it in
//! memory and turns it into `NAME=VALUE` entries for a shell or a child process.

pub mod cipher;
pub mod config;
pub mod envfile;
pub mod error;
pub mod kms;
pub mod loader;
pub mod locator;
pub mod store;
pub mod supervisor;

pub use error::{Error, Result};
