//! Verification that the key set actually being served matches the source
//! private key.
//!
//! A run waits for the serving endpoint to have a ready instance, fetches the
//! served key set, reconstructs the public key of its first entry, mints a
//! short-lived token with the source private key and verifies that token
//! against the reconstructed key. Fetch and round trip run under a bounded
//! retry whose whole budget is capped by an overall timeout.

use crate::cert::error::KeyMaterialError;
use crate::cert::{private_key_from_secret, PrivateKey};
use crate::config::VerificationConfig;
use crate::error::ErrorKind;
use crate::jwks::JwksError;
use crate::prelude::*;
use crate::store::resources::Secret;
use crate::store::ResourceStore;
use crate::target::JwksTarget;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

mod fetch;
mod readiness;
pub mod token;

pub use fetch::{jwks_url, HttpJwksFetcher, JwksFetcher};
pub use readiness::ReadinessPolicy;

/// An error that can arise verifying the served key set.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerificationError {
    /// The serving endpoint has no ready instance.
    #[error("{0}")]
    NotReady(String),

    /// The key set could not be fetched.
    #[error("{0}")]
    Fetch(String),

    /// The endpoint answered with a status other than 200.
    #[error("unexpected status code {status}: {body}")]
    HttpStatus {
        /// Status code of the response.
        status: u16,
        /// Body of the response.
        body: String,
    },

    /// The served document is not a usable key set.
    #[error("failed to parse JWKS: {0}")]
    Decode(#[source] JwksError),

    /// The served key set is empty.
    #[error("no keys found in JWKS")]
    NoKeys,

    /// The first served key is not an RSA key.
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// The source private key could not be extracted.
    #[error("failed to extract private key: {0}")]
    KeyMaterial(#[from] KeyMaterialError),

    /// The source private key could not be re-encoded for signing.
    #[error("failed to encode private key: {0}")]
    KeyEncoding(#[source] rsa::pkcs1::Error),

    /// The token could not be signed, or did not verify.
    #[error("token verification failed: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// The attempts did not complete within the overall budget.
    #[error("verification timed out after {0:?}")]
    Timeout(Duration),

    /// Verification observed cancellation and stopped.
    #[error("verification cancelled")]
    Cancelled,
}

impl VerificationError {
    /// Returns the failure kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::VerificationFailed,
        }
    }
}

/// Result of a verification run that did not fail.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum VerificationOutcome {
    /// The served key set matches the private key.
    Verified {
        /// Attempts used, starting at 1.
        attempts: u32,
    },
    /// The serving endpoint had no ready instance; nothing was fetched.
    NotReady(String),
    /// Serving is not configured for the target.
    Disabled,
}

/// Runs verification for one target at a time.
#[derive(Clone)]
pub struct Verifier {
    store: Arc<dyn ResourceStore>,
    fetcher: Arc<dyn JwksFetcher>,
    config: VerificationConfig,
    readiness: ReadinessPolicy,
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verifier")
            .field("config", &self.config)
            .field("readiness", &self.readiness)
            .finish_non_exhaustive()
    }
}

impl Verifier {
    /// Creates a verifier with the default readiness policy.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        fetcher: Arc<dyn JwksFetcher>,
        config: VerificationConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            config,
            readiness: ReadinessPolicy::default(),
        }
    }

    /// Replaces the readiness policy.
    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Verifies the key set served for `target` against the private key in
    /// `secret`.
    ///
    /// An endpoint without a ready instance is not an error: the run is
    /// abandoned and [`VerificationOutcome::NotReady`] is returned so the
    /// caller leaves status untouched.
    ///
    /// # Errors
    /// The error of the last attempt once every attempt failed,
    /// [`VerificationError::Timeout`] if the attempts outlast the overall
    /// budget, and [`VerificationError::Cancelled`] if `cancel` fires first.
    pub async fn verify(
        &self,
        target: &JwksTarget,
        secret: &Secret,
        cancel: &CancellationToken,
    ) -> Result<VerificationOutcome, VerificationError> {
        if !target.serving_enabled() {
            return Ok(VerificationOutcome::Disabled);
        }
        let namespace = target.namespace();
        let service = target.name();

        match readiness::wait_until_ready(
            self.store.as_ref(),
            namespace,
            service,
            self.readiness,
            cancel,
        )
        .await
        {
            Ok(()) => {}
            Err(VerificationError::Cancelled) => return Err(VerificationError::Cancelled),
            Err(e) => {
                warn!("Skipping JWKS verification, nginx not ready: namespace={namespace}, name={service}, reason={e}");
                return Ok(VerificationOutcome::NotReady(e.to_string()));
            }
        }

        let private_key = private_key_from_secret(secret)?;
        let url = jwks_url(service, namespace);
        let budget = self.config.effective_context_timeout();

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(VerificationError::Cancelled),
            result = tokio::time::timeout(budget, self.retry(&url, &private_key)) => {
                let attempts = result.map_err(|_| VerificationError::Timeout(budget))??;
                debug!("JWKS verified: namespace={namespace}, name={service}, attempts={attempts}");
                Ok(VerificationOutcome::Verified { attempts })
            }
        }
    }

    async fn retry(&self, url: &str, private_key: &PrivateKey) -> Result<u32, VerificationError> {
        let attempts = self.config.effective_retry_count();
        let delay = self.config.effective_retry_delay();

        let mut attempt = 1;
        loop {
            match self.attempt(url, private_key).await {
                Ok(()) => return Ok(attempt),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!("JWKS verification attempt failed: url={url}, attempt={attempt}, error={e}");
                }
            }
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, url: &str, private_key: &PrivateKey) -> Result<(), VerificationError> {
        let body = self.fetcher.fetch(url).await?;
        let (public_key, kid) = token::first_public_key(&body)?;
        let jwt = token::mint_token(private_key, &kid, OffsetDateTime::now_utc())?;
        token::verify_token(&jwt, &public_key)
    }
}
