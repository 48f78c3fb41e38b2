use crate::constants::{CLUSTER_LOCAL_SUFFIX, JWKS_ENDPOINT_PATH};
use crate::verification::VerificationError;
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use std::time::Duration;

/// In-cluster URL of the key set served behind endpoint `service`.
pub fn jwks_url(service: &str, namespace: &str) -> String {
    format!("http://{service}.{namespace}.{CLUSTER_LOCAL_SUFFIX}{JWKS_ENDPOINT_PATH}")
}

/// Fetches the key-set document served at a URL.
#[async_trait]
pub trait JwksFetcher: Send + Sync {
    /// Returns the body of a successful response.
    ///
    /// # Errors
    /// [`VerificationError::Fetch`] on transport failure and
    /// [`VerificationError::HttpStatus`] on any status other than 200.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, VerificationError>;
}

/// [`JwksFetcher`] over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpJwksFetcher {
    client: reqwest::Client,
}

impl HttpJwksFetcher {
    /// Creates a fetcher whose every request is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, VerificationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VerificationError::Fetch(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, VerificationError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| VerificationError::Fetch(format!("failed to fetch JWKS from '{url}': {e}")))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| VerificationError::Fetch(format!("failed to read response body: {e}")))?;

        if status != StatusCode::OK {
            return Err(VerificationError::HttpStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }
}
