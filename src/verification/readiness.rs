//! Readiness gate run before the served key set is fetched.

use crate::constants::LEGACY_WORKLOAD_PREFIX;
use crate::convergence::find_workload;
use crate::prelude::*;
use crate::store::resources::{Labels, Pod, PodPhase};
use crate::store::ResourceStore;
use crate::verification::VerificationError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long the gate waits for a ready instance.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReadinessPolicy {
    /// Number of pod listings before giving up. At least one is always made.
    pub attempts: u32,
    /// Delay between listings.
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Default)]
struct PodCounts {
    matching: usize,
    running: usize,
    ready: usize,
}

impl PodCounts {
    fn of(pods: &[Pod]) -> Self {
        Self {
            matching: pods.len(),
            running: pods.iter().filter(|p| p.phase == PodPhase::Running).count(),
            ready: pods.iter().filter(|p| p.is_serving()).count(),
        }
    }
}

/// Waits until the endpoint `service` has at least one running, ready instance.
///
/// # Errors
/// - [`VerificationError::NotReady`] if the endpoint is missing, has no
///   selector, or has no ready instance after every attempt. The message of
///   the last case carries the observed instance and workload counts.
/// - [`VerificationError::Cancelled`] if `cancel` fires while waiting.
pub(crate) async fn wait_until_ready(
    store: &dyn ResourceStore,
    namespace: &str,
    service: &str,
    policy: ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<(), VerificationError> {
    let endpoint = store.get_service(namespace, service).await.map_err(|e| {
        VerificationError::NotReady(format!("failed to get service {namespace}/{service}: {e}"))
    })?;
    let selector = endpoint.spec.selector;
    if selector.is_empty() {
        return Err(VerificationError::NotReady(format!(
            "service {namespace}/{service} has no selector"
        )));
    }

    let attempts = policy.attempts.max(1);
    let mut counts = PodCounts::default();
    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::select! {
                () = cancel.cancelled() => return Err(VerificationError::Cancelled),
                () = tokio::time::sleep(policy.interval) => {}
            }
        }

        match store.list_pods(namespace, &selector).await {
            Ok(pods) => {
                counts = PodCounts::of(&pods);
                if counts.ready > 0 {
                    debug!(
                        "Service has ready pods: namespace={namespace}, service={service}, ready={}, attempt={attempt}",
                        counts.ready
                    );
                    return Ok(());
                }
            }
            Err(e) => {
                debug!("Failed to list pods: namespace={namespace}, service={service}, attempt={attempt}, error={e}");
                counts = PodCounts::default();
            }
        }
    }

    Err(VerificationError::NotReady(
        diagnose(store, namespace, service, attempts, &selector, &counts).await,
    ))
}

async fn diagnose(
    store: &dyn ResourceStore,
    namespace: &str,
    service: &str,
    attempts: u32,
    selector: &Labels,
    counts: &PodCounts,
) -> String {
    let head = format!(
        "service {namespace}/{service} has no ready pods after {attempts} attempts: found {} pods matching selectors {selector:?}, {} running, {} ready",
        counts.matching, counts.running, counts.ready
    );

    match find_workload(store, namespace, service).await {
        Ok(Some(d)) => format!(
            "{head}; deployment {namespace}/{} exists: replicas={}, ready={}, available={}, podLabels={:?}",
            d.metadata.name,
            d.status.replicas,
            d.status.ready_replicas,
            d.status.available_replicas,
            d.spec.template.labels
        ),
        _ => format!(
            "{head}; deployment {namespace}/{service} or {namespace}/{LEGACY_WORKLOAD_PREFIX}{service} not found"
        ),
    }
}
