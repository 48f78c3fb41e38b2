//! Names, keys and fixed timings shared by the reconciliation engine.
//!
//! Everything here is part of the observable contract with the resource store
//! (label keys, annotation keys, object data keys), so changing a value is a
//! compatibility break for already-converged targets.

use std::time::Duration;

/// Data key of the source secret holding the PEM certificate.
pub const SECRET_KEY_TLS_CERT: &str = "tls.crt";

/// Data key of the source secret holding the PEM private key.
pub const SECRET_KEY_TLS_KEY: &str = "tls.key";

/// Data key of the key-set object holding the serialized JWKS.
pub const CONFIG_MAP_KEY_JWKS: &str = "jwks.json";

/// Data key of the serving-configuration object holding the server config.
pub const CONFIG_MAP_KEY_SERVING_CONFIG: &str = "default.conf";

/// Path at which the key set is always served.
pub const JWKS_ENDPOINT_PATH: &str = "/jwks.json";

/// Liveness probe path of the serving workload.
pub const HEALTH_CHECK_PATH: &str = "/healthz";

/// Label carrying the application name.
pub const LABEL_APP: &str = "app";
/// Label tying a companion object back to its target.
pub const LABEL_JWKS_CONFIG: &str = "jwks-config";
/// Label marking objects owned by this engine.
pub const LABEL_MANAGED_BY: &str = "managed-by";
/// Value of [`LABEL_MANAGED_BY`].
pub const LABEL_MANAGED_BY_VALUE: &str = "jwks-operator";

/// Pod-template annotation recording the serving-configuration content hash.
pub const ANNOTATION_SERVING_CONFIG_HASH: &str = "jwks-operator.example.com/nginx-configmap-hash";
/// Pod-template annotation recording the key-set content hash.
pub const ANNOTATION_JWKS_HASH: &str = "jwks-operator.example.com/jwks-configmap-hash";
/// Pod-template annotation whose change forces a rolling restart.
pub const ANNOTATION_RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";
/// Legacy target annotation holding the scheduling counter.
pub const ANNOTATION_FAST_RECONCILE_COUNT: &str = "jwks-operator.example.com/fast-reconcile-count";

/// Volume carrying the serving configuration.
pub const VOLUME_SERVING_CONFIG: &str = "nginx-config";
/// Volume carrying the key-set document.
pub const VOLUME_JWKS_DATA: &str = "jwks-data";

/// Mount path of the serving configuration inside the workload.
pub const SERVING_CONFIG_MOUNT_PATH: &str = "/etc/nginx/conf.d";
/// Mount path of the key-set document inside the workload.
pub const JWKS_MOUNT_PATH: &str = "/usr/share/nginx/html/jwks.json";
/// Document root of the serving workload.
pub const DOCUMENT_ROOT: &str = "/usr/share/nginx/html";

/// Name of the serving container.
pub const SERVING_CONTAINER_NAME: &str = "nginx";
/// Name of the serving port on the container and the endpoint.
pub const SERVING_PORT_NAME: &str = "http";
/// Port exposed by the serving endpoint.
pub const SERVICE_PORT: u16 = 80;
/// Prefix of the workload name used by older releases.
pub const LEGACY_WORKLOAD_PREFIX: &str = "nginx-";

/// Suffix appended to `<service>.<namespace>` to reach the endpoint in-cluster.
pub const CLUSTER_LOCAL_SUFFIX: &str = "svc.cluster.local";

/// Probe timings of the serving workload, in seconds.
pub const LIVENESS_INITIAL_DELAY_SECONDS: u32 = 10;
/// See [`LIVENESS_INITIAL_DELAY_SECONDS`].
pub const LIVENESS_PERIOD_SECONDS: u32 = 10;
/// See [`LIVENESS_INITIAL_DELAY_SECONDS`].
pub const READINESS_INITIAL_DELAY_SECONDS: u32 = 5;
/// See [`LIVENESS_INITIAL_DELAY_SECONDS`].
pub const READINESS_PERIOD_SECONDS: u32 = 5;

/// Name of the readiness condition on a target.
pub const CONDITION_READY: &str = "Ready";
/// Reason recorded on a successful pass.
pub const REASON_RECONCILED: &str = "Reconciled";

/// Delay requested after a pass that found the source secret missing.
pub const SOURCE_MISSING_RECHECK: Duration = Duration::from_secs(30);

/// Upper bound on the detached scheduling-counter update.
pub const COUNTER_UPDATE_TIMEOUT: Duration = Duration::from_secs(5);
