#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

//! Reconciliation engine that keeps a published JSON Web Key Set (JWKS) in
//! step with a rotating TLS certificate.
//!
//! For every target the engine derives a JWKS from the certificate stored in a
//! source secret, converges the derived artifacts (the key-set object, the
//! serving configuration, the serving workload and its network endpoint) and
//! then proves, by signing a short-lived token with the source private key and
//! verifying it against the key set actually being served, that relying
//! parties see the right public key.
//!
//! The resource store holding targets and their companion objects is consumed
//! through the [`ResourceStore`] trait; [`store::memory::InMemoryStore`] is a
//! complete in-process implementation.
//!
//! ```no_run
//! use jwks_operator::{Config, InMemoryStore, Reconciler, TargetKey};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(None, "default")?;
//! let store = Arc::new(InMemoryStore::new());
//!
//! let reconciler = Reconciler::builder(store, config).build()?;
//! let outcome = reconciler
//!     .reconcile(&TargetKey::new("default", "issuer-keys"), &CancellationToken::new())
//!     .await?;
//!
//! println!("next pass in {:?}", outcome.requeue_after);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **`logging`** (default): emit diagnostics through the `log` facade.
//! - **`tracing`**: emit diagnostics as `tracing` events instead.

pub mod cert;
pub mod config;
pub mod constants;
pub mod controller;
pub mod convergence;
pub mod error;
pub mod jwks;
pub mod metrics;
pub mod reconciler;
pub mod scheduler;
pub mod store;
pub mod target;
pub mod verification;

mod observability;
mod prelude;

// -----------------------
// Re-exports
// -----------------------

pub use crate::{
    cert::{Certificate, PrivateKey},
    config::{Config, ConfigError},
    controller::Controller,
    error::{ErrorKind, ReconcileError},
    jwks::{Jwk, Jwks, JwksError, UpdateStrategy},
    metrics::MetricsRecorder,
    reconciler::{PassKind, ReconcileOutcome, Reconciler, ReconcilerBuilder},
    scheduler::{Action, CounterState, Schedule, Scheduler},
    store::{memory::InMemoryStore, ResourceStore, StoreError},
    target::{JwksTarget, JwksTargetSpec, JwksTargetStatus, TargetKey},
    verification::{HttpJwksFetcher, JwksFetcher, VerificationError},
};
