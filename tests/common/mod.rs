//! Common testing utilities for Secure Environment integration tests.

use secure_environment::cipher::EnvelopeCipher;
use secure_environment::kms::LocalKms;
use secure_environment::loader::SecretLoader;
use secure_environment::store::MemoryStore;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Key identifier registered with the test key backend.
#[allow(dead_code)]
pub const TEST_KEY: &str = "arn:aws:kms:us-east-1:111122223333:key/test";

/// Test context that manages temporary files and directories.
pub struct TestContext {
    /// Path to temporary directory
    pub temp_path: PathBuf,
    /// The temporary directory (kept to prevent early deletion)
    _temp_dir: TempDir,
}

impl TestContext {
    /// Create a new test context with a temporary directory.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = TempDir::new()?;
        let temp_path = temp_dir.path().to_path_buf();

        Ok(Self {
            temp_path,
            _temp_dir: temp_dir,
        })
    }

    /// Create a test file with content.
    pub fn create_file(&self, name: &str, content: &str) -> anyhow::Result<PathBuf> {
        let file_path = self.temp_path.join(name);
        let mut file = fs::File::create(&file_path)?;
        file.write_all(content.as_bytes())?;
        Ok(file_path)
    }

    /// Get the path to a file in the temp directory.
    #[allow(dead_code)]
    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_path.join(name)
    }
}

/// A loader wired to in-memory storage and key management.
#[allow(dead_code)]
pub fn memory_loader() -> (SecretLoader, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let kms = Arc::new(LocalKms::new().with_key(TEST_KEY));
    let loader = SecretLoader::new(store.clone(), EnvelopeCipher::new(kms));
    (loader, store)
}

/// A `secure-environment` command with no ambient configuration leaking in.
#[allow(dead_code)]
pub fn cli() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo_bin_cmd!("secure-environment");
    for var in [
        "SECURE_ENVIRONMENT_URL",
        "SECURE_ENVIRONMENT_KEY",
        "SECURE_ENVIRONMENT_TYPE",
        "SECURE_ENVIRONMENT_DEBUG",
        "SECURE_ENVIRONMENT_CONFIG",
        "SECURE_ENVIRONMENT_REGION",
        "SECURE_ENVIRONMENT_ENDPOINT",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd.env("AWS_EC2_METADATA_DISABLED", "true");
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_context_create_file() {
        let ctx = TestContext::new().unwrap();
        let file_path = ctx.create_file("test.txt", "Hello, World!").unwrap();

        assert!(file_path.exists());
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "Hello, World!");
    }
}
