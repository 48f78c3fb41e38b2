//! Work-queue driver around a [`Reconciler`].
//!
//! The controller consumes target keys from a channel and keeps every known
//! target on a timer:
//!
//! - at most one pass runs per key; a trigger that arrives while a pass is in
//!   flight is folded into a single follow-up pass.
//! - a trigger for a key with a pending timer replaces the timer.
//! - after a successful pass the key is re-enqueued after the delay the
//!   reconciler returned.
//! - after a failed pass the key is re-enqueued with exponential backoff, or
//!   after the fixed delay the error requests. A pass that panics counts as
//!   a failed pass.
//!
//! Cancelling the token passed to [`Controller::run`] stops the loop, the
//! in-flight passes and every pending timer.

use crate::config::RetryConfig;
use crate::error::ReconcileError;
use crate::prelude::*;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::target::TargetKey;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, Id, JoinError, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

type PassResult = (TargetKey, Result<ReconcileOutcome, ReconcileError>);

/// Drives reconciliation passes for every target it is told about.
pub struct Controller {
    reconciler: Arc<Reconciler>,
    triggers: mpsc::Receiver<TargetKey>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

/// A scheduled re-enqueue. `seq` tells a live timer apart from one that was
/// replaced after it had already fired.
struct Timer {
    seq: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct Queue {
    in_flight: HashSet<TargetKey>,
    running: HashMap<Id, TargetKey>,
    dirty: HashSet<TargetKey>,
    timers: HashMap<TargetKey, Timer>,
    failures: HashMap<TargetKey, u32>,
    next_seq: u64,
}

impl Controller {
    /// Creates a controller fed by `triggers`.
    ///
    /// Senders push a key whenever the target or one of its inputs changes.
    /// Keys may be pushed repeatedly; duplicates are coalesced.
    pub fn new(reconciler: Arc<Reconciler>, triggers: mpsc::Receiver<TargetKey>) -> Self {
        Self {
            reconciler,
            triggers,
        }
    }

    /// Runs until `cancel` fires.
    ///
    /// Closing the trigger channel does not stop the controller; targets it
    /// already knows about keep being reconciled on their timers.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Starting JWKS controller");

        let mut queue = Queue::default();
        let mut passes: JoinSet<PassResult> = JoinSet::new();
        let mut timers: JoinSet<(TargetKey, u64)> = JoinSet::new();
        let mut triggers_open = true;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                trigger = self.triggers.recv(), if triggers_open => match trigger {
                    Some(key) => self.trigger(key, &mut queue, &mut passes, &cancel),
                    None => {
                        debug!("Trigger channel closed; continuing with scheduled passes");
                        triggers_open = false;
                    }
                },
                Some(joined) = passes.join_next_with_id() => match joined {
                    Ok((id, (key, result))) => {
                        queue.running.remove(&id);
                        self.complete(key, result, &mut queue, &mut passes, &mut timers, &cancel);
                    }
                    Err(e) => self.abandon(e, &mut queue, &mut passes, &mut timers, &cancel),
                },
                Some(joined) = timers.join_next() => {
                    if let Ok((key, seq)) = joined {
                        if queue.timers.get(&key).is_some_and(|t| t.seq == seq) {
                            queue.timers.remove(&key);
                            self.start(key, &mut queue, &mut passes, &cancel);
                        }
                    }
                },
            }
        }

        info!("Stopping JWKS controller");
        timers.shutdown().await;
        passes.shutdown().await;
    }

    fn trigger(
        &self,
        key: TargetKey,
        queue: &mut Queue,
        passes: &mut JoinSet<PassResult>,
        cancel: &CancellationToken,
    ) {
        if queue.in_flight.contains(&key) {
            debug!("Pass already in flight; coalescing trigger: target={key}");
            queue.dirty.insert(key);
            return;
        }
        if let Some(timer) = queue.timers.remove(&key) {
            timer.handle.abort();
        }
        self.start(key, queue, passes, cancel);
    }

    fn start(
        &self,
        key: TargetKey,
        queue: &mut Queue,
        passes: &mut JoinSet<PassResult>,
        cancel: &CancellationToken,
    ) {
        queue.in_flight.insert(key.clone());
        let reconciler = Arc::clone(&self.reconciler);
        let token = cancel.child_token();
        let task_key = key.clone();
        let handle = passes.spawn(async move {
            let result = reconciler.reconcile(&task_key, &token).await;
            (task_key, result)
        });
        queue.running.insert(handle.id(), key);
    }

    fn complete(
        &self,
        key: TargetKey,
        result: Result<ReconcileOutcome, ReconcileError>,
        queue: &mut Queue,
        passes: &mut JoinSet<PassResult>,
        timers: &mut JoinSet<(TargetKey, u64)>,
        cancel: &CancellationToken,
    ) {
        let delay = match result {
            Ok(outcome) => {
                queue.failures.remove(&key);
                outcome.requeue_after
            }
            Err(ReconcileError::Cancelled) => {
                queue.in_flight.remove(&key);
                return;
            }
            Err(e) => {
                let delay = self.failure_delay(&key, e.requeue_after(), queue);
                warn!(
                    "Reconciliation failed; retrying: target={key}, error={e}, backoff_ms={}",
                    delay.as_millis()
                );
                Some(delay)
            }
        };
        self.requeue(key, delay, queue, passes, timers, cancel);
    }

    /// Handles a pass task that panicked or was aborted.
    fn abandon(
        &self,
        error: JoinError,
        queue: &mut Queue,
        passes: &mut JoinSet<PassResult>,
        timers: &mut JoinSet<(TargetKey, u64)>,
        cancel: &CancellationToken,
    ) {
        let Some(key) = queue.running.remove(&error.id()) else {
            warn!("Reconciliation task failed: error={error}");
            return;
        };
        if error.is_cancelled() {
            queue.in_flight.remove(&key);
            return;
        }

        let delay = self.failure_delay(&key, None, queue);
        error!(
            "Reconciliation task panicked; retrying: target={key}, error={error}, backoff_ms={}",
            delay.as_millis()
        );
        self.requeue(key, Some(delay), queue, passes, timers, cancel);
    }

    fn failure_delay(&self, key: &TargetKey, requested: Option<Duration>, queue: &mut Queue) -> Duration {
        let failures = queue.failures.entry(key.clone()).or_insert(0);
        *failures = failures.saturating_add(1);
        debug!("Consecutive failed passes: target={key}, failures={failures}");
        requested.unwrap_or_else(|| backoff(&self.reconciler.config().retry, *failures))
    }

    /// Releases `key` and schedules its next pass, or reruns it at once when a
    /// trigger arrived while it was in flight.
    fn requeue(
        &self,
        key: TargetKey,
        delay: Option<Duration>,
        queue: &mut Queue,
        passes: &mut JoinSet<PassResult>,
        timers: &mut JoinSet<(TargetKey, u64)>,
        cancel: &CancellationToken,
    ) {
        queue.in_flight.remove(&key);

        if queue.dirty.remove(&key) {
            self.start(key, queue, passes, cancel);
            return;
        }

        match delay {
            Some(delay) => {
                queue.next_seq += 1;
                let seq = queue.next_seq;
                let timer_key = key.clone();
                let handle = timers.spawn(async move {
                    sleep(delay).await;
                    (timer_key, seq)
                });
                queue.timers.insert(key, Timer { seq, handle });
            }
            None => {
                debug!("Target no longer scheduled: target={key}");
                queue.failures.remove(&key);
            }
        }
    }
}

/// Backoff after `failures` consecutive failed passes.
///
/// Grows from `initial_delay` by `backoff_multiplier` per failure, stops
/// growing after `max_attempts` failures and never exceeds `max_delay`. Up to
/// 10% jitter is added, still clamped to `max_delay`.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn backoff(retry: &RetryConfig, failures: u32) -> Duration {
    let exponent = failures.clamp(1, retry.max_attempts.max(1)) - 1;
    let factor = retry.backoff_multiplier.max(1.0).powi(exponent as i32);
    let base = Duration::try_from_secs_f64(retry.initial_delay.as_secs_f64() * factor)
        .unwrap_or(retry.max_delay)
        .min(retry.max_delay);

    let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
    let jitter = base_ms / 10;
    let add = if jitter > 0 {
        fastrand::u64(0..=jitter)
    } else {
        0
    };

    Duration::from_millis(base_ms.saturating_add(add)).min(retry.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::constants::{SECRET_KEY_TLS_CERT, SECRET_KEY_TLS_KEY};
    use crate::error::ErrorKind;
    use crate::metrics::{ConfigMapKind, MetricsRecorder, OperationResult, ServingOperation};
    use crate::store::memory::InMemoryStore;
    use crate::store::resources::{ObjectMeta, Secret};
    use crate::store::ResourceKind;
    use crate::target::{JwksTarget, JwksTargetSpec};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, PartialEq)]
    enum Event {
        Reconciled,
        Failed(ErrorKind),
    }

    struct ChannelMetrics(mpsc::UnboundedSender<(Event, Instant)>);

    impl MetricsRecorder for ChannelMetrics {
        fn record_reconcile(&self, result: OperationResult, _duration: Duration) {
            if result == OperationResult::Success {
                let _ = self.0.send((Event::Reconciled, Instant::now()));
            }
        }
        fn record_config_map_update(&self, _kind: ConfigMapKind, _result: OperationResult) {}
        fn record_jwks_generation(&self, _result: OperationResult) {}
        fn record_serving_operation(&self, _op: ServingOperation, _result: OperationResult) {}
        fn record_verification(&self, _result: OperationResult) {}
        fn record_error(&self, kind: ErrorKind) {
            let _ = self.0.send((Event::Failed(kind), Instant::now()));
        }
    }

    /// Panics on the first error it is told about, then reports like [`ChannelMetrics`].
    struct PanicOnFirstError {
        inner: ChannelMetrics,
        panicked: AtomicBool,
    }

    impl MetricsRecorder for PanicOnFirstError {
        fn record_reconcile(&self, result: OperationResult, duration: Duration) {
            self.inner.record_reconcile(result, duration);
        }
        fn record_config_map_update(&self, _kind: ConfigMapKind, _result: OperationResult) {}
        fn record_jwks_generation(&self, _result: OperationResult) {}
        fn record_serving_operation(&self, _op: ServingOperation, _result: OperationResult) {}
        fn record_verification(&self, _result: OperationResult) {}
        fn record_error(&self, kind: ErrorKind) {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("metrics sink unavailable");
            }
            self.inner.record_error(kind);
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        key: TargetKey,
        triggers: mpsc::Sender<TargetKey>,
        events: mpsc::UnboundedReceiver<(Event, Instant)>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn harness(seed: impl FnOnce(&InMemoryStore)) -> Harness {
        harness_with(seed, |events| Arc::new(ChannelMetrics(events)))
    }

    fn harness_with(
        seed: impl FnOnce(&InMemoryStore),
        metrics: impl FnOnce(mpsc::UnboundedSender<(Event, Instant)>) -> Arc<dyn MetricsRecorder>,
    ) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let target = JwksTarget::new(
            "ns",
            "issuer",
            JwksTargetSpec {
                certificate_secret: "issuer-tls".to_string(),
                config_map_name: "issuer-jwks".to_string(),
                ..JwksTargetSpec::default()
            },
        );
        let key = target.key();
        store.insert_target(target);
        seed(&store);

        let (events_tx, events) = mpsc::unbounded_channel();
        let config = Config {
            namespace: "jwks-system".to_string(),
            ..Config::default()
        };
        let reconciler = Reconciler::builder(store.clone(), config)
            .metrics(metrics(events_tx))
            .build()
            .unwrap();

        let (triggers, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Controller::new(Arc::new(reconciler), rx).run(cancel.clone()));

        Harness {
            store,
            key,
            triggers,
            events,
            cancel,
            handle,
        }
    }

    fn seed_secret(store: &InMemoryStore) {
        store.insert_secret(Secret {
            metadata: ObjectMeta::new("ns", "issuer-tls"),
            data: [
                (
                    SECRET_KEY_TLS_CERT.to_string(),
                    include_bytes!("../tests/testdata/rsa-cert.pem").to_vec(),
                ),
                (
                    SECRET_KEY_TLS_KEY.to_string(),
                    include_bytes!("../tests/testdata/rsa-key.pem").to_vec(),
                ),
            ]
            .into_iter()
            .collect(),
        });
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        };

        let first = backoff(&retry, 1);
        assert!(first >= Duration::from_secs(5) && first <= Duration::from_millis(5500));
        let third = backoff(&retry, 3);
        assert!(third >= Duration::from_secs(20) && third <= Duration::from_secs(22));
        assert_eq!(backoff(&retry, 9), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_stops_growing_after_max_attempts() {
        let retry = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 3.0,
        };

        let capped = backoff(&retry, 7);
        assert!(capped >= Duration::from_secs(3) && capped <= Duration::from_millis(3300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_secret_rechecked_after_fixed_delay() {
        let mut h = harness(|_| {});
        h.triggers.send(h.key.clone()).await.unwrap();

        let (first, t0) = h.events.recv().await.unwrap();
        let (second, t1) = h.events.recv().await.unwrap();
        assert_eq!(first, Event::Failed(ErrorKind::SourceNotFound));
        assert_eq!(second, Event::Failed(ErrorKind::SourceNotFound));
        assert_eq!(t1 - t0, Duration::from_secs(30));

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pass_backs_off_exponentially() {
        let mut h = harness(|store| {
            seed_secret(store);
            store.fail_writes(ResourceKind::ConfigMap, true);
        });
        h.triggers.send(h.key.clone()).await.unwrap();

        let mut at = Vec::new();
        for _ in 0..3 {
            let (event, t) = h.events.recv().await.unwrap();
            assert_eq!(event, Event::Failed(ErrorKind::KeySetUpdateFailed));
            at.push(t);
        }
        let first = at[1] - at[0];
        let second = at[2] - at[1];
        assert!(first >= Duration::from_secs(5) && first <= Duration::from_millis(5500));
        assert!(second >= Duration::from_secs(10) && second <= Duration::from_secs(11));

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_resets_to_scheduled_delay() {
        let mut h = harness(seed_secret);
        h.store.fail_writes(ResourceKind::ConfigMap, true);
        h.triggers.send(h.key.clone()).await.unwrap();

        let (event, _) = h.events.recv().await.unwrap();
        assert_eq!(event, Event::Failed(ErrorKind::KeySetUpdateFailed));
        h.store.fail_writes(ResourceKind::ConfigMap, false);

        let (event, _) = h.events.recv().await.unwrap();
        assert_eq!(event, Event::Reconciled);
        assert!(h.store.config_map("ns", "issuer-jwks").is_some());

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_triggers_are_coalesced() {
        let mut h = harness(|_| {});
        for _ in 0..3 {
            h.triggers.send(h.key.clone()).await.unwrap();
        }

        let (_, t0) = h.events.recv().await.unwrap();
        let (_, t1) = h.events.recv().await.unwrap();
        let (_, t2) = h.events.recv().await.unwrap();
        assert_eq!(t1, t0);
        assert_eq!(t2 - t1, Duration::from_secs(30));

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicked_pass_is_retried_with_backoff() {
        let mut h = harness_with(
            |_| {},
            |events| {
                Arc::new(PanicOnFirstError {
                    inner: ChannelMetrics(events),
                    panicked: AtomicBool::new(false),
                })
            },
        );
        let triggered = Instant::now();
        h.triggers.send(h.key.clone()).await.unwrap();

        let (event, at) = h.events.recv().await.unwrap();
        assert_eq!(event, Event::Failed(ErrorKind::SourceNotFound));
        let waited = at - triggered;
        assert!(waited >= Duration::from_secs(5) && waited <= Duration::from_millis(5500));

        // The key is no longer held as in flight, so a trigger starts a pass.
        h.triggers.send(h.key.clone()).await.unwrap();
        let (event, again) = h.events.recv().await.unwrap();
        assert_eq!(event, Event::Failed(ErrorKind::SourceNotFound));
        assert_eq!(again, at);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_pending_timers() {
        let mut h = harness(|_| {});
        h.triggers.send(h.key.clone()).await.unwrap();
        h.events.recv().await.unwrap();

        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), h.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(h.events.try_recv().is_err());
    }
}
