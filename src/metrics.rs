//! Metrics sink consumed by the reconciler.
//!
//! The engine keeps no counters of its own; it reports every observable event
//! to an injected [`MetricsRecorder`].

use crate::error::ErrorKind;
use std::fmt;
use std::time::Duration;

/// Outcome label attached to most metrics.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum OperationResult {
    /// The operation completed.
    Success,
    /// The operation failed.
    Error,
}

impl OperationResult {
    /// Returns a stable string representation of the result.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub(crate) fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Self::Success
        } else {
            Self::Error
        }
    }
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which storage object an update metric refers to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConfigMapKind {
    /// The key-set object.
    Jwks,
    /// The serving-configuration object.
    ServingConfig,
}

impl ConfigMapKind {
    /// Returns a stable string representation of the object kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Jwks => "jwks",
            Self::ServingConfig => "nginx",
        }
    }
}

impl fmt::Display for ConfigMapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serving-side operation label.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ServingOperation {
    /// Serving-configuration convergence.
    Config,
    /// Workload convergence.
    Deployment,
    /// Endpoint convergence.
    Service,
}

impl ServingOperation {
    /// Returns a stable string representation of the operation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Deployment => "deployment",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for ServingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for recording reconciliation metrics.
///
/// Implement this trait to integrate with your metrics system (e.g., Prometheus, `StatsD`).
/// All labels passed in are stable and low-cardinality.
///
/// # Example
///
/// ```no_run
/// use jwks_operator::error::ErrorKind;
/// use jwks_operator::metrics::{ConfigMapKind, OperationResult, ServingOperation};
/// use jwks_operator::MetricsRecorder;
/// use std::time::Duration;
///
/// struct LogMetrics;
///
/// impl MetricsRecorder for LogMetrics {
///     fn record_reconcile(&self, result: OperationResult, duration: Duration) {
///         println!("reconcile result={result} seconds={}", duration.as_secs_f64());
///     }
///     fn record_config_map_update(&self, kind: ConfigMapKind, result: OperationResult) {}
///     fn record_jwks_generation(&self, result: OperationResult) {}
///     fn record_serving_operation(&self, op: ServingOperation, result: OperationResult) {}
///     fn record_verification(&self, result: OperationResult) {}
///     fn record_error(&self, kind: ErrorKind) {
///         println!("error kind={kind}");
///     }
/// }
/// ```
pub trait MetricsRecorder: Send + Sync {
    /// Records a completed full pass and how long it took.
    fn record_reconcile(&self, result: OperationResult, duration: Duration);

    /// Records an attempt to converge a storage object.
    fn record_config_map_update(&self, kind: ConfigMapKind, result: OperationResult);

    /// Records an attempt to generate a JWKS from the source certificate.
    fn record_jwks_generation(&self, result: OperationResult);

    /// Records an attempt to converge a serving-side artifact.
    fn record_serving_operation(&self, op: ServingOperation, result: OperationResult);

    /// Records the final outcome of a verification run.
    fn record_verification(&self, result: OperationResult);

    /// Records a pass failure by kind.
    fn record_error(&self, kind: ErrorKind);
}
