//! Object storage for encrypted environment files.
//!
//! [`S3Store`] talks to AWS S3 (or an S3-compatible endpoint); [`MemoryStore`] keeps
//! objects in process memory and backs the tests.

use crate::error::{Error, Result};
use crate::locator::{Locator, DEFAULT_PATH_STYLE_REGION};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Read/write access to objects addressed by a [`Locator`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the full contents of an object.
    async fn get(&self, locator: &Locator) -> Result<Vec<u8>>;

    /// Create or replace an object.
    async fn put(&self, locator: &Locator, data: Vec<u8>, content_type: &str) -> Result<()>;
}

/// S3-backed object store.
pub struct S3Store {
    sdk_config: SdkConfig,
    endpoint: Option<String>,
}

impl S3Store {
    /// Create a store from an already-resolved SDK configuration.
    ///
    /// Credentials are resolved once, when `sdk_config` was loaded; each request
    /// only picks the client region.
    pub fn new(sdk_config: SdkConfig, endpoint: Option<String>) -> Self {
        Self {
            sdk_config,
            endpoint,
        }
    }

    /// Client configuration for requests addressed to `locator`.
    ///
    /// The region embedded in the URL wins over the ambient one. With neither, the
    /// global endpoint region is used.
    fn client_config(&self, locator: &Locator) -> aws_sdk_s3::Config {
        let mut builder = aws_sdk_s3::config::Builder::from(&self.sdk_config);

        if let Some(region) = locator.region() {
            builder = builder.region(Region::new(region.to_string()));
        } else if self.sdk_config.region().is_none() {
            debug!("No region for {}, using {}", locator, DEFAULT_PATH_STYLE_REGION);
            builder = builder.region(Region::from_static(DEFAULT_PATH_STYLE_REGION));
        }

        if let Some(endpoint_url) = &self.endpoint {
            debug!("Using custom S3 endpoint: {}", endpoint_url);
            builder = builder.endpoint_url(endpoint_url).force_path_style(true);
        }

        builder.build()
    }

    fn client_for(&self, locator: &Locator) -> Client {
        Client::from_conf(self.client_config(locator))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, locator: &Locator) -> Result<Vec<u8>> {
        debug!("Downloading {}", locator);

        let fetch_error = |message: String| Error::Fetch {
            bucket: locator.bucket.clone(),
            key: locator.key.clone(),
            message,
        };

        let resp = self
            .client_for(locator)
            .get_object()
            .bucket(&locator.bucket)
            .key(&locator.key)
            .send()
            .await
            .map_err(|e| fetch_error(DisplayErrorContext(&e).to_string()))?;

        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| fetch_error(format!("failed to read response body: {}", e)))?;

        let data = body.into_bytes().to_vec();
        debug!("Downloaded {} bytes from {}", data.len(), locator);

        Ok(data)
    }

    async fn put(&self, locator: &Locator, data: Vec<u8>, content_type: &str) -> Result<()> {
        debug!("Uploading {} bytes to {}", data.len(), locator);

        self.client_for(locator)
            .put_object()
            .bucket(&locator.bucket)
            .key(&locator.key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| Error::Store {
                bucket: locator.bucket.clone(),
                key: locator.key.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        debug!("Uploaded {}", locator);
        Ok(())
    }
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
}

/// An object held by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look at a stored object without going through the [`ObjectStore`] API.
    pub fn object(&self, locator: &Locator) -> Option<StoredObject> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(&object_id(locator)).cloned())
    }

    /// Replace the bytes of an existing object, keeping its content type.
    pub fn overwrite(&self, locator: &Locator, data: Vec<u8>) -> bool {
        match self.objects.lock() {
            Ok(mut objects) => match objects.get_mut(&object_id(locator)) {
                Some(object) => {
                    object.data = data;
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}

fn object_id(locator: &Locator) -> (String, String) {
    (locator.bucket.clone(), locator.key.clone())
}

fn poisoned(locator: &Locator) -> String {
    format!("object table for {} is poisoned", locator)
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, locator: &Locator) -> Result<Vec<u8>> {
        let objects = self.objects.lock().map_err(|_| Error::Fetch {
            bucket: locator.bucket.clone(),
            key: locator.key.clone(),
            message: poisoned(locator),
        })?;

        objects
            .get(&object_id(locator))
            .map(|object| object.data.clone())
            .ok_or_else(|| Error::Fetch {
                bucket: locator.bucket.clone(),
                key: locator.key.clone(),
                message: "NoSuchKey: the specified key does not exist".to_string(),
            })
    }

    async fn put(&self, locator: &Locator, data: Vec<u8>, content_type: &str) -> Result<()> {
        let mut objects = self.objects.lock().map_err(|_| Error::Store {
            bucket: locator.bucket.clone(),
            key: locator.key.clone(),
            message: poisoned(locator),
        })?;

        objects.insert(
            object_id(locator),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(key: &str) -> Locator {
        Locator::parse(&format!("s3://bucket/{}", key)).unwrap()
    }

    fn sdk_config(region: Option<&'static str>) -> SdkConfig {
        SdkConfig::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .region(region.map(Region::from_static))
            .build()
    }

    fn client_region(store: &S3Store, url: &str) -> Option<String> {
        let config = store.client_config(&Locator::parse(url).unwrap());
        config.region().map(|region| region.to_string())
    }

    #[test]
    fn test_region_falls_back_to_global_endpoint() {
        let store = S3Store::new(sdk_config(None), None);

        assert_eq!(
            client_region(&store, "https://my-bucket.s3.amazonaws.com/app.env").as_deref(),
            Some(DEFAULT_PATH_STYLE_REGION)
        );
        assert_eq!(
            client_region(&store, "s3://my-bucket/app.env").as_deref(),
            Some(DEFAULT_PATH_STYLE_REGION)
        );
    }

    #[test]
    fn test_ambient_region_is_kept_when_url_has_none() {
        let store = S3Store::new(sdk_config(Some("ap-southeast-2")), None);

        assert_eq!(
            client_region(&store, "s3://my-bucket/app.env").as_deref(),
            Some("ap-southeast-2")
        );
    }

    #[test]
    fn test_url_region_wins() {
        let store = S3Store::new(sdk_config(Some("ap-southeast-2")), None);

        assert_eq!(
            client_region(&store, "https://my-bucket.s3-eu-west-1.amazonaws.com/app.env")
                .as_deref(),
            Some("eu-west-1")
        );
    }

    #[tokio::test]
    async fn test_memory_store_put_then_get() {
        let store = MemoryStore::new();
        let loc = locator("app.env");

        store
            .put(&loc, b"payload".to_vec(), "application/json")
            .await
            .unwrap();

        assert_eq!(store.get(&loc).await.unwrap(), b"payload");
        assert_eq!(store.object(&loc).unwrap().content_type, "application/json");
    }

    #[tokio::test]
    async fn test_memory_store_missing_object() {
        let store = MemoryStore::new();
        let err = store.get(&locator("missing.env")).await.unwrap_err();

        assert!(matches!(err, Error::Fetch { .. }));
        assert!(err.to_string().contains("s3://bucket/missing.env"));
    }

    #[tokio::test]
    async fn test_memory_store_overwrite() {
        let store = MemoryStore::new();
        let loc = locator("app.env");

        assert!(!store.overwrite(&loc, b"x".to_vec()));

        store.put(&loc, b"old".to_vec(), "text/plain").await.unwrap();
        assert!(store.overwrite(&loc, b"new".to_vec()));
        assert_eq!(store.get(&loc).await.unwrap(), b"new");
    }
}
