/*!
Remote seed databases.

When no usable snapshot exists, startup may download a prebuilt database image
instead of building from the bundled schema. Static hosts happily answer a
missing file with an HTML page and a 200 status, so a response is only
accepted when it is not HTML and starts with the SQLite file header.
*/

use crate::engine::has_sqlite_header;
use crate::{KeepError, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// Raw response from a seed source
#[derive(Debug, Clone)]
pub struct SeedResponse {
    /// Value of the `Content-Type` header, if any
    pub content_type: Option<String>,
    /// Response body
    pub body: Bytes,
}

/// Source of a prebuilt database image
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SeedFetcher: Send + Sync {
    /// Download the seed image
    async fn fetch(&self) -> Result<SeedResponse>;

    /// Where the seed comes from, for logs
    fn describe(&self) -> String;
}

/// Accept a seed response only if it really is a database image
pub fn validate_seed(response: SeedResponse) -> Result<Bytes> {
    if let Some(content_type) = &response.content_type {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime == "text/html" || mime == "application/xhtml+xml" {
            return Err(KeepError::RemoteSeedInvalid(format!(
                "server answered with {mime}"
            )));
        }
    }
    if !has_sqlite_header(&response.body) {
        return Err(KeepError::RemoteSeedInvalid(format!(
            "{} byte body lacks the SQLite header",
            response.body.len()
        )));
    }
    Ok(response.body)
}

#[cfg(feature = "http-seed")]
pub use http::HttpSeedFetcher;

#[cfg(feature = "http-seed")]
mod http {
    use super::{SeedFetcher, SeedResponse};
    use crate::{KeepError, Result};
    use async_trait::async_trait;
    use reqwest::header::CONTENT_TYPE;
    use std::time::Duration;
    use tracing::debug;

    /// Fetch a seed image over HTTP(S)
    #[derive(Debug, Clone)]
    pub struct HttpSeedFetcher {
        client: reqwest::Client,
        url: String,
    }

    impl HttpSeedFetcher {
        /// Create a fetcher for `url` with a request timeout
        pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| KeepError::SeedFetch(format!("failed to build HTTP client: {e}")))?;
            Ok(Self {
                client,
                url: url.into(),
            })
        }
    }

    #[async_trait]
    impl SeedFetcher for HttpSeedFetcher {
        async fn fetch(&self) -> Result<SeedResponse> {
            debug!("Fetching seed database from {}", self.url);
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| KeepError::SeedFetch(e.to_string()))?;

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let body = response
                .bytes()
                .await
                .map_err(|e| KeepError::SeedFetch(e.to_string()))?;

            Ok(SeedResponse { content_type, body })
        }

        fn describe(&self) -> String {
            self.url.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SQLITE_MAGIC;

    fn image_bytes() -> Bytes {
        let mut body = SQLITE_MAGIC.to_vec();
        body.extend_from_slice(&[0u8; 84]);
        Bytes::from(body)
    }

    #[test]
    fn test_valid_seed_accepted() {
        let body = validate_seed(SeedResponse {
            content_type: Some("application/octet-stream".to_string()),
            body: image_bytes(),
        })
        .unwrap();
        assert!(body.starts_with(SQLITE_MAGIC));
    }

    #[test]
    fn test_missing_content_type_still_checks_header() {
        assert!(validate_seed(SeedResponse {
            content_type: None,
            body: image_bytes(),
        })
        .is_ok());
        assert!(validate_seed(SeedResponse {
            content_type: None,
            body: Bytes::from_static(b"PK\x03\x04 zip archive"),
        })
        .is_err());
    }

    #[test]
    fn test_html_rejected_even_with_header() {
        let result = validate_seed(SeedResponse {
            content_type: Some("text/html; charset=utf-8".to_string()),
            body: image_bytes(),
        });
        assert!(matches!(result, Err(KeepError::RemoteSeedInvalid(_))));
    }

    #[test]
    fn test_html_error_page_rejected() {
        let result = validate_seed(SeedResponse {
            content_type: Some("application/octet-stream".to_string()),
            body: Bytes::from_static(b"<!DOCTYPE html><title>Not Found</title>"),
        });
        assert!(matches!(result, Err(KeepError::RemoteSeedInvalid(_))));
    }
}
