//! Pass-level errors and the failure taxonomy shared across the crate.

use crate::constants::SOURCE_MISSING_RECHECK;
use crate::convergence::ConvergenceError;
use crate::jwks::JwksError;
use crate::store::StoreError;
use crate::verification::VerificationError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of every failure the engine can surface.
///
/// Each kind has a stable, low-cardinality label ([`ErrorKind::as_str`]) for
/// metrics and logs, and a status-condition reason ([`ErrorKind::reason`]).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// The source secret could not be read.
    SourceNotFound,
    /// A JWKS could not be derived from the source certificate.
    GenerationFailed,
    /// The key-set object could not be converged.
    KeySetUpdateFailed,
    /// The serving-configuration object could not be converged.
    ServingConfigUpdateFailed,
    /// The serving workload could not be converged.
    ServingWorkloadFailed,
    /// The serving endpoint could not be converged.
    ServingEndpointFailed,
    /// The served key set did not prove to match the source private key.
    VerificationFailed,
    /// Settings on the target or the operator are unusable.
    InvalidConfiguration,
    /// A companion object required by a step does not exist.
    ArtifactNotFound,
    /// Input bytes could not be decoded.
    MalformedInput,
    /// The key algorithm is not RSA.
    UnsupportedKeyType,
    /// The pass was cancelled before it completed.
    Cancelled,
}

impl ErrorKind {
    /// Returns a stable string representation of the error kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SourceNotFound => "secret_not_found",
            Self::GenerationFailed => "jwks_generation_failed",
            Self::KeySetUpdateFailed => "configmap_update_failed",
            Self::ServingConfigUpdateFailed => "nginx_config_update_failed",
            Self::ServingWorkloadFailed => "nginx_deployment_failed",
            Self::ServingEndpointFailed => "nginx_service_failed",
            Self::VerificationFailed => "jwks_verification_failed",
            Self::InvalidConfiguration => "invalid_configuration",
            Self::ArtifactNotFound => "resource_not_found",
            Self::MalformedInput => "malformed_input",
            Self::UnsupportedKeyType => "unsupported_key_type",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns the reason recorded on the target's `Ready` condition.
    pub const fn reason(self) -> &'static str {
        match self {
            Self::SourceNotFound => "SecretNotFound",
            Self::GenerationFailed | Self::MalformedInput | Self::UnsupportedKeyType => {
                "JWKSGenerationFailed"
            }
            Self::KeySetUpdateFailed => "ConfigMapUpdateFailed",
            Self::ServingConfigUpdateFailed => "NginxConfigUpdateFailed",
            Self::ServingWorkloadFailed => "NginxDeploymentFailed",
            Self::ServingEndpointFailed => "NginxServiceFailed",
            Self::VerificationFailed => "JWKSVerificationFailed",
            Self::InvalidConfiguration => "InvalidConfiguration",
            Self::ArtifactNotFound => "ResourceNotFound",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Whether the condition is expected to clear on its own.
    ///
    /// Transient kinds are safe to retry on the next scheduled pass without
    /// operator intervention. Every other kind points at configuration or
    /// environment that needs correcting, although the scheduler still
    /// re-attempts on its normal cadence.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::SourceNotFound | Self::ArtifactNotFound | Self::VerificationFailed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a reconciliation pass.
///
/// Every variant aborts the remaining phases of the pass. Verification
/// failures are absorbed inside the pass and only appear here when
/// verification is driven directly.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// The source secret could not be read.
    #[error("failed to get secret {secret}: {source}")]
    SourceNotFound {
        /// Name of the source secret.
        secret: String,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// No usable JWKS could be generated from the source certificate.
    #[error("failed to generate JWKS: {0}")]
    GenerationFailed(#[source] JwksError),

    /// The key-set object could not be converged.
    #[error("failed to update key-set object {name}: {source}")]
    KeySetUpdateFailed {
        /// Name of the key-set object.
        name: String,
        /// Underlying convergence error.
        #[source]
        source: ConvergenceError,
    },

    /// The serving configuration could not be converged.
    #[error("failed to update serving configuration: {0}")]
    ServingConfigUpdateFailed(#[source] ConvergenceError),

    /// The serving workload could not be converged.
    #[error("failed to ensure serving workload: {0}")]
    ServingWorkloadFailed(#[source] ConvergenceError),

    /// The serving endpoint could not be converged.
    #[error("failed to ensure serving endpoint: {0}")]
    ServingEndpointFailed(#[source] ConvergenceError),

    /// The served key set could not be verified.
    #[error("failed to verify served JWKS: {0}")]
    VerificationFailed(#[source] VerificationError),

    /// Target or operator settings are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The target itself could not be read.
    #[error("failed to get target: {0}")]
    Target(#[source] StoreError),

    /// The pass observed cancellation and stopped.
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Returns the failure kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceNotFound { .. } => ErrorKind::SourceNotFound,
            Self::GenerationFailed(_) => ErrorKind::GenerationFailed,
            Self::KeySetUpdateFailed { .. } => ErrorKind::KeySetUpdateFailed,
            Self::ServingConfigUpdateFailed(_) => ErrorKind::ServingConfigUpdateFailed,
            Self::ServingWorkloadFailed(_) => ErrorKind::ServingWorkloadFailed,
            Self::ServingEndpointFailed(_) => ErrorKind::ServingEndpointFailed,
            Self::VerificationFailed(_) => ErrorKind::VerificationFailed,
            Self::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            Self::Target(_) => ErrorKind::ArtifactNotFound,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the failure is expected to clear on the next pass.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Fixed re-check delay for failures that bypass the normal backoff.
    ///
    /// A missing source secret is common while a target is first being
    /// provisioned, so it is re-checked after [`SOURCE_MISSING_RECHECK`].
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::SourceNotFound { source, .. } if source.is_not_found() => {
                Some(SOURCE_MISSING_RECHECK)
            }
            _ => None,
        }
    }
}
