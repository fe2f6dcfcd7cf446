//! Storage address parsing.
//!
//! Turns the S3 URL styles documented at
//! <https://docs.aws.amazon.com/AmazonS3/latest/userguide/access-bucket-intro.html>
//! into a bucket / key / region triple. Dialects are tried in a fixed order and the
//! first match wins.

use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Region implied by the global path-style endpoint.
pub const DEFAULT_PATH_STYLE_REGION: &str = "us-east-1";

// bucket, key, no region
static VIRTUAL_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://([^./]+)\.s3\.amazonaws\.com(?:/?$|/(.*))").expect("valid regex")
});

// bucket, region, key
static VIRTUAL_HOST_REGIONAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://([^./]+)\.s3-([^./]+)\.amazonaws\.com(?:/?$|/(.*))")
        .expect("valid regex")
});

// bucket, key, us-east-1
static PATH_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://s3\.amazonaws\.com/([^/]+)(?:/?$|/(.*))").expect("valid regex")
});

// region, bucket, key
static PATH_STYLE_REGIONAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://s3-([^./]+)\.amazonaws\.com/([^/]+)(?:/?$|/(.*))")
        .expect("valid regex")
});

// bucket, key, no region
static S3_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^s3://([^/]+)(?:/?$|/(.*))").expect("valid regex"));

/// Address of an object in S3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub bucket: String,
    pub key: String,
    /// Empty when the URL does not name a region.
    pub region: String,
}

impl Locator {
    /// Parse a storage URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAStorageUrl`] when no dialect matches or when the URL
    /// names a bucket without an object key.
    ///
    /// # Example
    ///
    /// ```
    /// use secure_environment::locator::Locator;
    ///
    /// let locator = Locator::parse("https://s3-eu-west-1.amazonaws.com/config/app.env").unwrap();
    /// assert_eq!(locator.bucket, "config");
    /// assert_eq!(locator.key, "app.env");
    /// assert_eq!(locator.region, "eu-west-1");
    /// ```
    pub fn parse(url: &str) -> Result<Self> {
        let (bucket, key, region) = if let Some(caps) = VIRTUAL_HOST.captures(url) {
            (caps.get(1), caps.get(2), String::new())
        } else if let Some(caps) = VIRTUAL_HOST_REGIONAL.captures(url) {
            let region = caps[2].to_string();
            (caps.get(1), caps.get(3), region)
        } else if let Some(caps) = PATH_STYLE.captures(url) {
            (caps.get(1), caps.get(2), DEFAULT_PATH_STYLE_REGION.to_string())
        } else if let Some(caps) = PATH_STYLE_REGIONAL.captures(url) {
            let region = caps[1].to_string();
            (caps.get(2), caps.get(3), region)
        } else if let Some(caps) = S3_SCHEME.captures(url) {
            (caps.get(1), caps.get(2), String::new())
        } else {
            return Err(not_a_storage_url(url));
        };

        let bucket = bucket.map(|m| m.as_str()).unwrap_or_default();
        let key = key.map(|m| m.as_str()).unwrap_or_default();
        if bucket.is_empty() || key.is_empty() {
            return Err(not_a_storage_url(url));
        }

        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            region,
        })
    }

    /// Region named by the URL, if any.
    pub fn region(&self) -> Option<&str> {
        if self.region.is_empty() {
            None
        } else {
            Some(&self.region)
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

fn not_a_storage_url(url: &str) -> Error {
    Error::NotAStorageUrl {
        url: url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(url: &str) -> (String, String, String) {
        let locator = Locator::parse(url).unwrap();
        (locator.bucket, locator.key, locator.region)
    }

    #[test]
    fn test_virtual_host_style() {
        assert_eq!(
            triple("https://my-bucket.s3.amazonaws.com/env/production.env"),
            ("my-bucket".into(), "env/production.env".into(), "".into())
        );
    }

    #[test]
    fn test_virtual_host_regional_style() {
        assert_eq!(
            triple("https://my-bucket.s3-us-west-2.amazonaws.com/app.env"),
            ("my-bucket".into(), "app.env".into(), "us-west-2".into())
        );
    }

    #[test]
    fn test_path_style_defaults_region() {
        assert_eq!(
            triple("http://s3.amazonaws.com/my-bucket/nested/path/app.env"),
            (
                "my-bucket".into(),
                "nested/path/app.env".into(),
                "us-east-1".into()
            )
        );
    }

    #[test]
    fn test_path_style_regional() {
        assert_eq!(
            triple("https://s3-ap-southeast-2.amazonaws.com/my-bucket/app.env"),
            ("my-bucket".into(), "app.env".into(), "ap-southeast-2".into())
        );
    }

    #[test]
    fn test_s3_scheme() {
        assert_eq!(
            triple("s3://my-bucket/secrets/app.env"),
            ("my-bucket".into(), "secrets/app.env".into(), "".into())
        );
    }

    #[test]
    fn test_key_keeps_query_like_characters() {
        let locator = Locator::parse("https://b.s3.amazonaws.com/a=b/c.env").unwrap();
        assert_eq!(locator.key, "a=b/c.env");
    }

    #[test]
    fn test_bucket_without_key_is_rejected() {
        for url in [
            "https://my-bucket.s3.amazonaws.com",
            "https://my-bucket.s3.amazonaws.com/",
            "https://s3.amazonaws.com/my-bucket/",
            "s3://my-bucket",
        ] {
            assert!(
                matches!(Locator::parse(url), Err(Error::NotAStorageUrl { .. })),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn test_unknown_dialects_are_rejected() {
        for url in [
            "",
            "not a url",
            "https://example.com/bucket/key",
            "ftp://my-bucket.s3.amazonaws.com/key",
            "https://storage.googleapis.com/bucket/key",
        ] {
            let err = Locator::parse(url).unwrap_err();
            assert!(err.to_string().contains("not an s3 url"));
        }
    }

    #[test]
    fn test_display_and_region_accessor() {
        let locator = Locator::parse("https://b.s3.amazonaws.com/k.env").unwrap();
        assert_eq!(locator.to_string(), "s3://b/k.env");
        assert_eq!(locator.region(), None);

        let locator = Locator::parse("https://s3-eu-west-1.amazonaws.com/b/k.env").unwrap();
        assert_eq!(locator.region(), Some("eu-west-1"));
    }
}
