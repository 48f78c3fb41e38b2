//! Reconciler orchestrating one pass over a target.
//!
//! A pass reads the target, asks the [`Scheduler`] what is due and then runs
//! one of three paths:
//!
//! - **full pass**: source secret, JWKS generation, key-set object, serving
//!   configuration, workload, endpoint, in that order, followed by
//!   verification when it is due. A failing phase aborts the rest of the pass,
//!   marks the target not ready and is returned to the caller.
//! - **verify-only**: source secret, endpoint, verification. Nothing here
//!   fails the pass.
//! - **skip**: nothing is done.
//!
//! Status is written back after every path that changes it. Verification
//! failures downgrade the `Ready` condition but never fail the pass.
//!
//! After a pass, the next delay is computed and the scheduling counter is
//! handed to a detached best-effort writer.

use crate::config::Config;
use crate::convergence::{ConvergenceManager, WorkloadChange};
use crate::error::{ErrorKind, ReconcileError};
use crate::jwks::{generate_from_secret, JwksError, UpdateStrategy};
use crate::metrics::{ConfigMapKind, MetricsRecorder, OperationResult, ServingOperation};
use crate::prelude::*;
use crate::scheduler::{Action, ArtifactPresence, Scheduler};
use crate::store::resources::Secret;
use crate::store::{ResourceStore, StoreError};
use crate::target::{JwksTarget, JwksTargetSpec, TargetKey};
use crate::verification::{
    HttpJwksFetcher, JwksFetcher, ReadinessPolicy, VerificationError, VerificationOutcome, Verifier,
};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

mod counter;
mod status;

const READY_MESSAGE: &str = "JWKS successfully updated";

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// Which path a pass took.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PassKind {
    /// Every phase ran.
    FullPass,
    /// Only verification ran.
    VerifyOnly,
    /// Nothing was due.
    Skipped,
    /// The target is gone or being deleted; its artifacts were removed.
    Cleanup,
}

/// Result of a pass that did not fail.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReconcileOutcome {
    /// Delay before the next pass; `None` when the target needs no further passes.
    pub requeue_after: Option<Duration>,
    /// Path the pass took.
    pub pass: PassKind,
}

/// Builder for [`Reconciler`].
pub struct ReconcilerBuilder {
    store: Arc<dyn ResourceStore>,
    config: Config,
    fetcher: Option<Arc<dyn JwksFetcher>>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    readiness: ReadinessPolicy,
    clock: Option<Clock>,
}

impl fmt::Debug for ReconcilerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcilerBuilder")
            .field("config", &self.config)
            .field("fetcher", &self.fetcher.as_ref().map(|_| "<JwksFetcher>"))
            .field("metrics", &self.metrics.as_ref().map(|_| "<MetricsRecorder>"))
            .field("readiness", &self.readiness)
            .field("clock", &self.clock.as_ref().map(|_| "<Clock>"))
            .finish_non_exhaustive()
    }
}

impl ReconcilerBuilder {
    /// Uses `fetcher` to fetch the served key set instead of plain HTTP.
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn JwksFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Reports metrics to `metrics`.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Overrides how long verification waits for a ready serving instance.
    #[must_use]
    pub fn readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Overrides the time source used for status timestamps and scheduling.
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the reconciler.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::InvalidConfiguration`] if the configuration
    /// does not validate or the HTTP client cannot be built.
    pub fn build(self) -> Result<Reconciler, ReconcileError> {
        self.config
            .validate()
            .map_err(|e| ReconcileError::InvalidConfiguration(e.to_string()))?;

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(
                HttpJwksFetcher::new(self.config.verification.effective_timeout())
                    .map_err(|e| ReconcileError::InvalidConfiguration(e.to_string()))?,
            ),
        };

        let convergence = ConvergenceManager::new(self.store.clone(), self.config.nginx.clone());
        let verifier = Verifier::new(
            self.store.clone(),
            fetcher,
            self.config.verification.clone(),
        )
        .with_readiness(self.readiness);

        Ok(Reconciler {
            scheduler: Scheduler::new(self.config.clone()),
            store: self.store,
            config: self.config,
            convergence,
            verifier,
            metrics: self.metrics,
            clock: self.clock.unwrap_or_else(|| Arc::new(OffsetDateTime::now_utc)),
        })
    }
}

/// Runs reconciliation passes for any number of targets.
///
/// Holds no per-target state; concurrent passes for different targets are
/// independent. Callers must not run two passes for the same target at once.
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    config: Config,
    scheduler: Scheduler,
    convergence: ConvergenceManager,
    verifier: Verifier,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    clock: Clock,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("convergence", &self.convergence)
            .field("verifier", &self.verifier)
            .field("metrics", &self.metrics.as_ref().map(|_| "<MetricsRecorder>"))
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a builder over `store` with the operator `config`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use jwks_operator::{Config, InMemoryStore, Reconciler};
    /// use std::sync::Arc;
    ///
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = Config::load(None, "jwks-system")?;
    /// let reconciler = Reconciler::builder(Arc::new(InMemoryStore::new()), config).build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder(store: Arc<dyn ResourceStore>, config: Config) -> ReconcilerBuilder {
        ReconcilerBuilder {
            store,
            config,
            fetcher: None,
            metrics: None,
            readiness: ReadinessPolicy::default(),
            clock: None,
        }
    }

    /// The operator configuration the reconciler was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn now(&self) -> OffsetDateTime {
        (self.clock)()
    }

    fn metrics(&self) -> Option<&dyn MetricsRecorder> {
        self.metrics.as_deref()
    }

    /// Runs one pass for the target `key`.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::Target`] if the target cannot be read.
    /// - [`ReconcileError::Cancelled`] if `cancel` fires during the pass.
    /// - The error of the failing phase of a full pass. The target's status
    ///   has already been updated to reflect it.
    pub async fn reconcile(
        &self,
        key: &TargetKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }

        let target = match self.store.get_target(key).await {
            Ok(target) => target,
            Err(e) if e.is_not_found() => {
                info!("JWKS target not found, cleaning up: target={key}");
                let gone = JwksTarget::new(&key.namespace, &key.name, JwksTargetSpec::default());
                self.convergence.cleanup(&gone, false).await;
                return Ok(cleaned_up());
            }
            Err(e) => return Err(ReconcileError::Target(e)),
        };

        if target.is_being_deleted() {
            info!("JWKS target being deleted, cleaning up: target={key}");
            self.convergence
                .cleanup(&target, self.config.cleanup_on_delete)
                .await;
            return Ok(cleaned_up());
        }

        let now = self.now();
        let presence = self.artifact_presence(&target).await;
        let counter_state = self.scheduler.counter_state(&target, now);
        let (target, pass) = match self.scheduler.decide_action(&target, &presence, now) {
            Action::FullPass => (self.full_pass(target, cancel).await?, PassKind::FullPass),
            Action::VerifyOnly => (self.verify_only(target, cancel).await?, PassKind::VerifyOnly),
            Action::Skip => {
                debug!("Skipping reconciliation and verification, too soon since last update: target={key}");
                (target, PassKind::Skipped)
            }
        };

        let schedule = self.scheduler.next_delay(&target, counter_state);
        if let Some(count) = schedule.counter {
            counter::spawn_counter_update(self.store.clone(), target.key(), count);
        }
        debug!(
            "Next reconciliation scheduled: target={key}, delay_ms={}",
            schedule.delay.as_millis()
        );

        Ok(ReconcileOutcome {
            requeue_after: Some(schedule.delay),
            pass,
        })
    }

    async fn artifact_presence(&self, target: &JwksTarget) -> ArtifactPresence {
        let namespace = target.namespace();
        let key_set = exists(
            self.store
                .get_config_map(namespace, &target.spec.config_map_name)
                .await,
        );
        let serving_config = match target.serving_config_name() {
            Some(name) => exists(self.store.get_config_map(namespace, name).await),
            None => false,
        };
        let workload = exists(self.store.get_deployment(namespace, target.name()).await);

        ArtifactPresence {
            key_set,
            serving_config,
            workload,
        }
    }

    async fn full_pass(
        &self,
        mut target: JwksTarget,
        cancel: &CancellationToken,
    ) -> Result<JwksTarget, ReconcileError> {
        let started = Instant::now();
        let now = self.now();
        let verification_due = self.scheduler.verification_due(&target, now);

        let converged = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ReconcileError::Cancelled),
            result = self.converge(&mut target, now) => result,
        };

        let secret = match converged {
            Ok(secret) => secret,
            Err(ReconcileError::Cancelled) => return Err(ReconcileError::Cancelled),
            Err(e) => {
                error!(
                    "Reconciliation failed: target={}, kind={}, error={e}",
                    target.key(),
                    e.kind()
                );
                if let Some(m) = self.metrics() {
                    m.record_error(e.kind());
                    m.record_reconcile(OperationResult::Error, started.elapsed());
                }
                status::set_not_ready(&mut target, e.kind().reason(), e.to_string(), now);
                status::persist(self.store.as_ref(), &target).await;
                return Err(e);
            }
        };

        if verification_due {
            self.verify(&mut target, &secret, cancel).await?;
        }
        if let Some(m) = self.metrics() {
            m.record_reconcile(OperationResult::Success, started.elapsed());
        }

        let persisted = status::persist(self.store.as_ref(), &target).await;
        let target = persisted.unwrap_or(target);
        info!(
            "Reconciliation completed: target={}, kid={}, keys={}",
            target.key(),
            target.status.last_key_id,
            target.status.key_count
        );
        Ok(target)
    }

    /// Phases one to six. Returns the source secret for verification.
    async fn converge(
        &self,
        target: &mut JwksTarget,
        now: OffsetDateTime,
    ) -> Result<Secret, ReconcileError> {
        let key = target.key();
        let namespace = key.namespace.as_str();
        let secret_name = target.spec.certificate_secret.clone();
        let key_set_name = target.spec.config_map_name.clone();

        let secret = self
            .store
            .get_secret(namespace, &secret_name)
            .await
            .map_err(|source| ReconcileError::SourceNotFound {
                secret: secret_name.clone(),
                source,
            })?;
        debug!("Secret retrieved: target={key}, secret={secret_name}");

        let generated = generate_from_secret(&secret);
        if let Some(m) = self.metrics() {
            m.record_jwks_generation(OperationResult::of(&generated));
        }
        let generated = generated.map_err(ReconcileError::GenerationFailed)?;
        let kid = generated
            .keys
            .first()
            .map(|k| k.kid.clone())
            .unwrap_or_default();
        debug!("JWKS generated: target={key}, kid={kid}, keys={}", generated.len());

        let strategy: UpdateStrategy = target
            .update_strategy(&self.config)
            .parse()
            .map_err(|e: JwksError| ReconcileError::InvalidConfiguration(e.to_string()))?;
        let published = self
            .convergence
            .publish_key_set(
                namespace,
                &key_set_name,
                strategy,
                target.keep_old_keys(&self.config),
                target.old_keys_ttl(&self.config),
                &generated,
            )
            .await;
        if let Some(m) = self.metrics() {
            m.record_config_map_update(ConfigMapKind::Jwks, OperationResult::of(&published));
        }
        let published = published.map_err(|source| ReconcileError::KeySetUpdateFailed {
            name: key_set_name.clone(),
            source,
        })?;

        if target.serving_enabled() {
            let serving_config = self.convergence.ensure_serving_config(target).await;
            if let Some(m) = self.metrics() {
                let result = OperationResult::of(&serving_config);
                m.record_config_map_update(ConfigMapKind::ServingConfig, result);
                m.record_serving_operation(ServingOperation::Config, result);
            }
            serving_config.map_err(ReconcileError::ServingConfigUpdateFailed)?;
            target.status.last_serving_config_update_time = Some(now);

            let workload = self.convergence.ensure_workload(target, now).await;
            if let Some(m) = self.metrics() {
                m.record_serving_operation(ServingOperation::Deployment, OperationResult::of(&workload));
            }
            if workload.map_err(ReconcileError::ServingWorkloadFailed)? != WorkloadChange::Unchanged {
                debug!("nginx Deployment converged: target={key}");
            }

            let endpoint = self.convergence.ensure_endpoint(target).await;
            if let Some(m) = self.metrics() {
                m.record_serving_operation(ServingOperation::Service, OperationResult::of(&endpoint));
            }
            endpoint.map_err(ReconcileError::ServingEndpointFailed)?;
        }

        target.status.last_key_id = kid;
        target.status.key_count = published.len();
        status::set_ready(target, READY_MESSAGE, now);
        Ok(secret)
    }

    async fn verify_only(
        &self,
        mut target: JwksTarget,
        cancel: &CancellationToken,
    ) -> Result<JwksTarget, ReconcileError> {
        let key = target.key();
        debug!("Performing JWKS verification only: target={key}");

        let secret = match self
            .store
            .get_secret(target.namespace(), &target.spec.certificate_secret)
            .await
        {
            Ok(secret) => secret,
            Err(e) => {
                warn!("Failed to get secret for verification, skipping: target={key}, error={e}");
                return Ok(target);
            }
        };

        if let Err(e) = self.convergence.ensure_endpoint(&target).await {
            warn!("Failed to ensure service before verification, skipping: target={key}, error={e}");
            return Ok(target);
        }

        self.verify(&mut target, &secret, cancel).await?;
        let persisted = status::persist(self.store.as_ref(), &target).await;
        Ok(persisted.unwrap_or(target))
    }

    /// Runs verification and folds its result into `target`'s status.
    ///
    /// Only cancellation is returned as an error.
    async fn verify(
        &self,
        target: &mut JwksTarget,
        secret: &Secret,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        let key = target.key();
        match self.verifier.verify(target, secret, cancel).await {
            Ok(VerificationOutcome::Verified { attempts }) => {
                if attempts > 1 {
                    info!("JWKS verification succeeded after retries: target={key}, attempts={attempts}");
                } else {
                    debug!("JWKS verification succeeded: target={key}");
                }
                if let Some(m) = self.metrics() {
                    m.record_verification(OperationResult::Success);
                }
                target.status.last_verified_time = Some(self.now());
            }
            Ok(VerificationOutcome::NotReady(_) | VerificationOutcome::Disabled) => {}
            Err(VerificationError::Cancelled) => return Err(ReconcileError::Cancelled),
            Err(e) => {
                warn!("JWKS verification failed after all retry attempts: target={key}, error={e}");
                if let Some(m) = self.metrics() {
                    m.record_verification(OperationResult::Error);
                }
                status::set_not_ready(
                    target,
                    ErrorKind::VerificationFailed.reason(),
                    format!("Failed to verify JWKS from nginx: {e}"),
                    self.now(),
                );
            }
        }
        Ok(())
    }
}

fn cleaned_up() -> ReconcileOutcome {
    ReconcileOutcome {
        requeue_after: None,
        pass: PassKind::Cleanup,
    }
}

/// Whether a read found its object. Errors other than not-found count as
/// present so a flaky read does not force a full pass.
fn exists<T>(result: Result<T, StoreError>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) if e.is_not_found() => false,
        Err(e) => {
            debug!("Failed to check artifact existence, assuming present: error={e}");
            true
        }
    }
}
