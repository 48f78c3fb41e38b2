//! End-to-end reconciliation passes against the in-memory store.
//!
//! The tests cover:
//! - Full pass with serving and verification
//! - Verify-only passes between key updates
//! - Key rotation with both update strategies
//! - Verification failure downgrading readiness
//! - Scheduling cadence across restarts and dropped counter writes
//! - Cleanup on deletion

use async_trait::async_trait;
use jwks_operator::constants::{CONFIG_MAP_KEY_JWKS, SECRET_KEY_TLS_CERT, SECRET_KEY_TLS_KEY};
use jwks_operator::jwks::generate_from_secret;
use jwks_operator::store::resources::{ObjectMeta, Pod, PodPhase, Secret};
use jwks_operator::store::ResourceKind;
use jwks_operator::target::ConditionStatus;
use jwks_operator::verification::ReadinessPolicy;
use jwks_operator::{
    Config, InMemoryStore, Jwks, JwksFetcher, JwksTarget, JwksTargetSpec, PassKind, Reconciler,
    TargetKey, VerificationError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::macros::datetime;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

const RSA_CERT: &[u8] = include_bytes!("testdata/rsa-cert.pem");
const RSA_KEY: &[u8] = include_bytes!("testdata/rsa-key.pem");
const ROTATED_CERT: &[u8] = include_bytes!("testdata/rotated-cert.pem");
const ROTATED_KEY: &[u8] = include_bytes!("testdata/rotated-key.pem");

/// Serves whatever the key-set object currently holds.
struct PublishedKeySet {
    store: Arc<InMemoryStore>,
}

#[async_trait]
impl JwksFetcher for PublishedKeySet {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, VerificationError> {
        assert_eq!(url, "http://issuer.ns.svc.cluster.local/jwks.json");
        self.store
            .config_map("ns", "issuer-jwks")
            .and_then(|cm| cm.entry(CONFIG_MAP_KEY_JWKS).map(<[u8]>::to_vec))
            .ok_or_else(|| VerificationError::Fetch("connection refused".to_string()))
    }
}

/// Serves a fixed document regardless of what was published.
struct FixedBody(Vec<u8>);

#[async_trait]
impl JwksFetcher for FixedBody {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, VerificationError> {
        Ok(self.0.clone())
    }
}

#[derive(Clone)]
struct TestClock(Arc<Mutex<OffsetDateTime>>);

impl TestClock {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(datetime!(2024-05-01 12:00 UTC))))
    }

    fn now(&self) -> OffsetDateTime {
        *self.0.lock().unwrap()
    }

    fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

fn secret(cert: &[u8], key: &[u8]) -> Secret {
    Secret {
        metadata: ObjectMeta::new("ns", "issuer-tls"),
        data: [
            (SECRET_KEY_TLS_CERT.to_string(), cert.to_vec()),
            (SECRET_KEY_TLS_KEY.to_string(), key.to_vec()),
        ]
        .into_iter()
        .collect(),
    }
}

fn target(serving: bool, strategy: &str) -> JwksTarget {
    JwksTarget::new(
        "ns",
        "issuer",
        JwksTargetSpec {
            certificate_secret: "issuer-tls".to_string(),
            config_map_name: "issuer-jwks".to_string(),
            nginx_config_map_name: serving.then(|| "issuer-nginx".to_string()),
            update_strategy: Some(strategy.to_string()),
            ..JwksTargetSpec::default()
        },
    )
}

fn serving_pod() -> Pod {
    let labels = [("app", "issuer"), ("jwks-config", "issuer")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Pod {
        metadata: ObjectMeta::new("ns", "issuer-6d4f9").with_labels(labels),
        phase: PodPhase::Running,
        ready: true,
    }
}

fn config() -> Config {
    let mut config = Config {
        namespace: "jwks-system".to_string(),
        ..Config::default()
    };
    config.verification.retry_delay = Duration::from_millis(10);
    config
}

fn reconciler(
    store: &Arc<InMemoryStore>,
    config: Config,
    fetcher: Arc<dyn JwksFetcher>,
    clock: &TestClock,
) -> Reconciler {
    let clock = clock.clone();
    Reconciler::builder(store.clone(), config)
        .fetcher(fetcher)
        .readiness(ReadinessPolicy {
            attempts: 1,
            interval: Duration::ZERO,
        })
        .clock(Arc::new(move || clock.now()))
        .build()
        .unwrap()
}

/// Lets the detached counter writer land before the next pass reads status.
async fn settle_counter(store: &InMemoryStore, key: &TargetKey, expected: u32) {
    for _ in 0..100 {
        if store.target(key).and_then(|t| t.status.fast_reconcile_count) == Some(expected) {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("scheduling counter never reached {expected}");
}

fn published(store: &InMemoryStore) -> Jwks {
    let cm = store.config_map("ns", "issuer-jwks").unwrap();
    Jwks::from_json(cm.entry(CONFIG_MAP_KEY_JWKS).unwrap()).unwrap()
}

#[tokio::test]
async fn test_full_pass_publishes_serves_and_verifies() {
    let store = Arc::new(InMemoryStore::new());
    let key = store.insert_target(target(true, "rolling")).unwrap().key();
    store.insert_secret(secret(RSA_CERT, RSA_KEY));
    store.insert_pod(serving_pod());
    let clock = TestClock::new();
    let fetcher = Arc::new(PublishedKeySet {
        store: store.clone(),
    });
    let reconciler = reconciler(&store, config(), fetcher, &clock);

    let outcome = reconciler
        .reconcile(&key, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.pass, PassKind::FullPass);
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(10)));

    let stored = store.target(&key).unwrap();
    assert!(stored.is_ready());
    assert_eq!(stored.status.last_verified_time, Some(clock.now()));
    assert_eq!(stored.status.last_serving_config_update_time, Some(clock.now()));
    assert_eq!(stored.status.key_count, 1);
    assert_eq!(published(&store).keys[0].kid, stored.status.last_key_id);

    assert!(store.config_map("ns", "issuer-nginx").is_some());
    let deployment = store.deployment("ns", "issuer").unwrap();
    assert_eq!(deployment.spec.template.labels["app"], "issuer");
    let service = store.service("ns", "issuer").unwrap();
    assert_eq!(service.spec.selector["app"], "issuer");
}

#[tokio::test]
async fn test_passes_between_key_updates_only_verify() {
    let store = Arc::new(InMemoryStore::new());
    let key = store.insert_target(target(true, "rolling")).unwrap().key();
    store.insert_secret(secret(RSA_CERT, RSA_KEY));
    store.insert_pod(serving_pod());
    let clock = TestClock::new();
    let fetcher = Arc::new(PublishedKeySet {
        store: store.clone(),
    });
    let reconciler = reconciler(&store, config(), fetcher, &clock);
    let cancel = CancellationToken::new();

    reconciler.reconcile(&key, &cancel).await.unwrap();
    settle_counter(&store, &key, 1).await;

    clock.advance(Duration::from_secs(5));
    let outcome = reconciler.reconcile(&key, &cancel).await.unwrap();
    assert_eq!(outcome.pass, PassKind::Skipped);
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(30)));
    settle_counter(&store, &key, 2).await;

    let first_update = store.target(&key).unwrap().status.last_update_time;
    clock.advance(Duration::from_secs(61));
    let outcome = reconciler.reconcile(&key, &cancel).await.unwrap();
    assert_eq!(outcome.pass, PassKind::VerifyOnly);

    let stored = store.target(&key).unwrap();
    assert_eq!(stored.status.last_verified_time, Some(clock.now()));
    assert_eq!(stored.status.last_update_time, first_update);
}

#[tokio::test]
async fn test_rolling_rotation_keeps_previous_key() {
    let store = Arc::new(InMemoryStore::new());
    let key = store.insert_target(target(false, "rolling")).unwrap().key();
    store.insert_secret(secret(RSA_CERT, RSA_KEY));
    let clock = TestClock::new();
    let reconciler = reconciler(&store, config(), Arc::new(FixedBody(Vec::new())), &clock);
    let cancel = CancellationToken::new();

    reconciler.reconcile(&key, &cancel).await.unwrap();
    settle_counter(&store, &key, 1).await;
    let first_kid = store.target(&key).unwrap().status.last_key_id;

    store.insert_secret(secret(ROTATED_CERT, ROTATED_KEY));
    clock.advance(Duration::from_secs(6 * 60 * 60));
    let outcome = reconciler.reconcile(&key, &cancel).await.unwrap();
    assert_eq!(outcome.pass, PassKind::FullPass);

    let stored = store.target(&key).unwrap();
    assert_ne!(stored.status.last_key_id, first_kid);
    assert_eq!(stored.status.key_count, 2);
    let kids: Vec<_> = published(&store).keys.into_iter().map(|k| k.kid).collect();
    assert_eq!(kids, vec![first_kid, stored.status.last_key_id]);
}

#[tokio::test(start_paused = true)]
async fn test_rolling_rotation_with_serving_verifies_against_previous_key() {
    let store = Arc::new(InMemoryStore::new());
    let key = store.insert_target(target(true, "rolling")).unwrap().key();
    store.insert_secret(secret(RSA_CERT, RSA_KEY));
    store.insert_pod(serving_pod());
    let clock = TestClock::new();
    let fetcher = Arc::new(PublishedKeySet {
        store: store.clone(),
    });
    let reconciler = reconciler(&store, config(), fetcher, &clock);
    let cancel = CancellationToken::new();

    reconciler.reconcile(&key, &cancel).await.unwrap();
    settle_counter(&store, &key, 1).await;
    let first = store.target(&key).unwrap();
    assert!(first.is_ready());

    store.insert_secret(secret(ROTATED_CERT, ROTATED_KEY));
    clock.advance(Duration::from_secs(6 * 60 * 60));
    let outcome = reconciler.reconcile(&key, &cancel).await.unwrap();
    assert_eq!(outcome.pass, PassKind::FullPass);

    // The served set leads with the previous key, which the rotated private
    // key cannot match.
    let stored = store.target(&key).unwrap();
    let kids: Vec<_> = published(&store).keys.into_iter().map(|k| k.kid).collect();
    assert_eq!(kids, vec![first.status.last_key_id.clone(), stored.status.last_key_id.clone()]);
    assert_eq!(stored.status.key_count, 2);

    let condition = stored.ready_condition().unwrap();
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(condition.reason, "JWKSVerificationFailed");
    assert!(condition.message.starts_with("Failed to verify JWKS from nginx: "));
    assert_eq!(stored.status.last_verified_time, first.status.last_verified_time);
}

#[tokio::test]
async fn test_immediate_rotation_replaces_key_and_verifies() {
    let store = Arc::new(InMemoryStore::new());
    let key = store.insert_target(target(true, "immediate")).unwrap().key();
    store.insert_secret(secret(RSA_CERT, RSA_KEY));
    store.insert_pod(serving_pod());
    let clock = TestClock::new();
    let fetcher = Arc::new(PublishedKeySet {
        store: store.clone(),
    });
    let reconciler = reconciler(&store, config(), fetcher, &clock);
    let cancel = CancellationToken::new();

    reconciler.reconcile(&key, &cancel).await.unwrap();
    settle_counter(&store, &key, 1).await;

    store.insert_secret(secret(ROTATED_CERT, ROTATED_KEY));
    clock.advance(Duration::from_secs(6 * 60 * 60));
    reconciler.reconcile(&key, &cancel).await.unwrap();

    let stored = store.target(&key).unwrap();
    assert!(stored.is_ready());
    assert_eq!(stored.status.key_count, 1);
    assert_eq!(stored.status.last_verified_time, Some(clock.now()));
    assert_eq!(published(&store).keys[0].kid, stored.status.last_key_id);
}

#[tokio::test(start_paused = true)]
async fn test_served_key_mismatch_downgrades_readiness() {
    let store = Arc::new(InMemoryStore::new());
    let key = store.insert_target(target(true, "rolling")).unwrap().key();
    store.insert_secret(secret(RSA_CERT, RSA_KEY));
    store.insert_pod(serving_pod());
    let unrelated = generate_from_secret(&secret(ROTATED_CERT, ROTATED_KEY))
        .unwrap()
        .to_json()
        .unwrap();
    let clock = TestClock::new();
    let reconciler = reconciler(&store, config(), Arc::new(FixedBody(unrelated)), &clock);

    let outcome = reconciler
        .reconcile(&key, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.pass, PassKind::FullPass);

    let stored = store.target(&key).unwrap();
    let condition = stored.ready_condition().unwrap();
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(condition.reason, "JWKSVerificationFailed");
    assert!(condition.message.starts_with("Failed to verify JWKS from nginx: "));
    assert_eq!(stored.status.last_verified_time, None);
    assert!(store.config_map("ns", "issuer-jwks").is_some());
}

#[tokio::test]
async fn test_unready_serving_instance_does_not_fail_pass() {
    let store = Arc::new(InMemoryStore::new());
    let key = store.insert_target(target(true, "rolling")).unwrap().key();
    store.insert_secret(secret(RSA_CERT, RSA_KEY));
    let clock = TestClock::new();
    let fetcher = Arc::new(PublishedKeySet {
        store: store.clone(),
    });
    let reconciler = reconciler(&store, config(), fetcher, &clock);

    reconciler
        .reconcile(&key, &CancellationToken::new())
        .await
        .unwrap();

    let stored = store.target(&key).unwrap();
    assert!(stored.is_ready());
    assert_eq!(stored.status.last_verified_time, None);
}

#[tokio::test]
async fn test_restart_after_long_pause_returns_to_fast_cadence() {
    let store = Arc::new(InMemoryStore::new());
    let key = store.insert_target(target(true, "rolling")).unwrap().key();
    store.insert_secret(secret(RSA_CERT, RSA_KEY));
    store.insert_pod(serving_pod());
    let clock = TestClock::new();
    let fetcher = Arc::new(PublishedKeySet {
        store: store.clone(),
    });
    let reconciler = reconciler(&store, config(), fetcher, &clock);
    let cancel = CancellationToken::new();

    reconciler.reconcile(&key, &cancel).await.unwrap();
    settle_counter(&store, &key, 1).await;
    clock.advance(Duration::from_secs(10));
    reconciler.reconcile(&key, &cancel).await.unwrap();
    settle_counter(&store, &key, 2).await;

    // Nothing ran for 40 minutes: the process was down.
    clock.advance(Duration::from_secs(40 * 60));
    let outcome = reconciler.reconcile(&key, &cancel).await.unwrap();
    assert_eq!(outcome.pass, PassKind::VerifyOnly);
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(10)));
    settle_counter(&store, &key, 1).await;
    assert_eq!(
        store.target(&key).unwrap().status.last_verified_time,
        Some(clock.now())
    );

    clock.advance(Duration::from_secs(10));
    let outcome = reconciler.reconcile(&key, &cancel).await.unwrap();
    assert_eq!(outcome.pass, PassKind::Skipped);
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(30)));
    settle_counter(&store, &key, 2).await;
}

#[tokio::test]
async fn test_dropped_counter_write_falls_back_to_steady_interval() {
    let store = Arc::new(InMemoryStore::new());
    let key = store.insert_target(target(true, "rolling")).unwrap().key();
    store.insert_secret(secret(RSA_CERT, RSA_KEY));
    store.insert_pod(serving_pod());
    let clock = TestClock::new();
    let fetcher = Arc::new(PublishedKeySet {
        store: store.clone(),
    });
    let reconciler = reconciler(&store, config(), fetcher, &clock);
    let cancel = CancellationToken::new();

    reconciler.reconcile(&key, &cancel).await.unwrap();
    settle_counter(&store, &key, 1).await;

    store.fail_writes(ResourceKind::Target, true);
    clock.advance(Duration::from_secs(10));
    let outcome = reconciler.reconcile(&key, &cancel).await.unwrap();
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(30)));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    store.fail_writes(ResourceKind::Target, false);
    assert_eq!(store.target(&key).unwrap().status.fast_reconcile_count, Some(1));

    clock.advance(Duration::from_secs(30));
    let outcome = reconciler.reconcile(&key, &cancel).await.unwrap();
    assert_eq!(outcome.pass, PassKind::Skipped);
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(60)));
    settle_counter(&store, &key, 2).await;
}

#[tokio::test]
async fn test_restart_is_not_inferred_without_serving() {
    let store = Arc::new(InMemoryStore::new());
    let key = store.insert_target(target(false, "rolling")).unwrap().key();
    store.insert_secret(secret(RSA_CERT, RSA_KEY));
    let clock = TestClock::new();
    let reconciler = reconciler(&store, config(), Arc::new(FixedBody(Vec::new())), &clock);
    let cancel = CancellationToken::new();

    reconciler.reconcile(&key, &cancel).await.unwrap();
    settle_counter(&store, &key, 1).await;
    clock.advance(Duration::from_secs(10));
    reconciler.reconcile(&key, &cancel).await.unwrap();
    settle_counter(&store, &key, 2).await;

    clock.advance(Duration::from_secs(40 * 60));
    let outcome = reconciler.reconcile(&key, &cancel).await.unwrap();
    assert_eq!(outcome.pass, PassKind::Skipped);
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(60)));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(store.target(&key).unwrap().status.fast_reconcile_count, Some(2));
}

#[tokio::test]
async fn test_deletion_removes_artifacts() {
    let store = Arc::new(InMemoryStore::new());
    let key = store.insert_target(target(true, "rolling")).unwrap().key();
    store.insert_secret(secret(RSA_CERT, RSA_KEY));
    store.insert_pod(serving_pod());
    let clock = TestClock::new();
    let fetcher = Arc::new(PublishedKeySet {
        store: store.clone(),
    });
    let mut config = config();
    config.cleanup_on_delete = true;
    let reconciler = reconciler(&store, config, fetcher, &clock);
    let cancel = CancellationToken::new();

    reconciler.reconcile(&key, &cancel).await.unwrap();
    settle_counter(&store, &key, 1).await;
    assert!(store.deployment("ns", "issuer").is_some());

    let mut deleting = store.target(&key).unwrap();
    deleting.metadata.deletion_timestamp = Some(clock.now());
    store.insert_target(deleting);

    let outcome = reconciler.reconcile(&key, &cancel).await.unwrap();
    assert_eq!(outcome.pass, PassKind::Cleanup);
    assert_eq!(outcome.requeue_after, None);
    assert!(store.deployment("ns", "issuer").is_none());
    assert!(store.service("ns", "issuer").is_none());
    assert!(store.config_map("ns", "issuer-jwks").is_none());
    assert!(store.config_map("ns", "issuer-nginx").is_none());
}
