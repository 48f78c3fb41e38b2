//! The JWKS target resource.
//!
//! A target names one source secret and the objects derived from it. The
//! spec is owned by the user; the status is owned by the reconciler.

use crate::config::Config;
use crate::constants::{
    ANNOTATION_FAST_RECONCILE_COUNT, CONDITION_READY, JWKS_ENDPOINT_PATH,
};
use crate::store::resources::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;

/// Namespace and name of a target.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TargetKey {
    /// Namespace of the target.
    pub namespace: String,
    /// Name of the target.
    pub name: String,
}

impl TargetKey {
    /// Creates a key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A JWKS target: one source certificate published as one key set.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JwksTarget {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    pub spec: JwksTargetSpec,
    /// Observed state.
    pub status: JwksTargetStatus,
}

/// Desired state of a [`JwksTarget`].
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JwksTargetSpec {
    /// Secret holding `tls.crt` and `tls.key`.
    pub certificate_secret: String,
    /// Object the key set is stored in.
    pub config_map_name: String,
    /// Object the serving configuration is stored in. Absent disables serving.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nginx_config_map_name: Option<String>,
    /// Request path of the key set. Kept for compatibility; the key set is
    /// served at every path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// `rolling` or `immediate`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<String>,
    /// Whether previously published keys are kept on rotation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_old_keys: Option<bool>,
    /// How long old keys are kept, e.g. `720h`. Not enforced.
    #[serde(rename = "oldKeysTTL", skip_serializing_if = "Option::is_none")]
    pub old_keys_ttl: Option<String>,
    /// Override of the reconcile interval, e.g. `5m`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile_interval: Option<String>,
    /// Override of the key-update interval, e.g. `6h`.
    #[serde(rename = "jwksUpdateInterval", skip_serializing_if = "Option::is_none")]
    pub key_update_interval: Option<String>,
    /// Override of the verification interval, e.g. `1m`.
    #[serde(
        rename = "jwksVerificationInterval",
        skip_serializing_if = "Option::is_none"
    )]
    pub verification_interval: Option<String>,
}

/// Observed state of a [`JwksTarget`].
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JwksTargetStatus {
    /// Latest observations; at least `Ready` after the first pass.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// When the key set was last written successfully.
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_update_time: Option<OffsetDateTime>,
    /// `kid` of the most recently generated key.
    #[serde(rename = "lastKeyID", skip_serializing_if = "String::is_empty")]
    pub last_key_id: String,
    /// Number of keys in the stored key set.
    pub key_count: usize,
    /// When the serving configuration was last converged.
    #[serde(
        rename = "nginxConfigUpdated",
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_serving_config_update_time: Option<OffsetDateTime>,
    /// When the served key set was last verified.
    #[serde(
        rename = "jwksVerified",
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_verified_time: Option<OffsetDateTime>,
    /// Advisory scheduling counter; see [`JwksTarget::schedule_counter`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fast_reconcile_count: Option<u32>,
}

/// Tri-state status of a [`Condition`].
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// Not yet determined.
    #[default]
    Unknown,
}

/// One observation on a target.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `Ready`.
    #[serde(rename = "type")]
    pub condition_type: String,
    /// Condition status.
    pub status: ConditionStatus,
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable detail.
    pub message: String,
    /// Spec generation the observation was made against.
    pub observed_generation: i64,
    /// When `status` last changed.
    #[serde(with = "time::serde::rfc3339")]
    pub last_transition_time: OffsetDateTime,
}

impl JwksTarget {
    /// Creates a target that has not been observed yet.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: JwksTargetSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: JwksTargetStatus::default(),
        }
    }

    /// Returns the target's key.
    pub fn key(&self) -> TargetKey {
        TargetKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Namespace of the target.
    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Name of the target. Also the name of its workload and endpoint.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Whether deletion of the target has been requested.
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Name of the serving-configuration object, when serving is enabled.
    pub fn serving_config_name(&self) -> Option<&str> {
        self.spec
            .nginx_config_map_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    /// Whether the key set is served over HTTP for this target.
    pub fn serving_enabled(&self) -> bool {
        self.serving_config_name().is_some()
    }

    /// The `Ready` condition, if one has been recorded.
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == CONDITION_READY)
    }

    /// Whether the last pass left the target ready.
    pub fn is_ready(&self) -> bool {
        self.ready_condition()
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Whether the recorded `Ready` condition was produced by the current spec.
    pub fn observed_current_generation(&self) -> bool {
        self.ready_condition()
            .is_some_and(|c| c.observed_generation == self.metadata.generation)
    }

    /// Persisted scheduling counter.
    ///
    /// Read from `status.fastReconcileCount`, falling back to the legacy
    /// annotation; absent or unparseable values read as zero.
    pub fn schedule_counter(&self) -> u32 {
        if let Some(count) = self.status.fast_reconcile_count {
            return count;
        }
        self.metadata
            .annotations
            .get(ANNOTATION_FAST_RECONCILE_COUNT)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Normalized request path of the key set.
    pub fn endpoint(&self) -> String {
        normalize_endpoint(self.spec.endpoint.as_deref().unwrap_or_default())
    }

    /// Update strategy name, falling back to the operator default.
    pub fn update_strategy<'a>(&'a self, config: &'a Config) -> &'a str {
        self.spec
            .update_strategy
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(config.default_update_strategy.as_str())
    }

    /// Whether old keys are kept, falling back to the operator default.
    pub fn keep_old_keys(&self, config: &Config) -> bool {
        self.spec.keep_old_keys.unwrap_or(config.default_keep_old_keys)
    }

    /// How long old keys should be kept.
    pub fn old_keys_ttl(&self, config: &Config) -> Duration {
        effective_interval(self.spec.old_keys_ttl.as_deref(), config.default_old_keys_ttl)
    }

    /// Interval between passes in steady state.
    pub fn reconcile_interval(&self, config: &Config) -> Duration {
        effective_interval(self.spec.reconcile_interval.as_deref(), config.reconcile_interval)
    }

    /// Interval after which the key set is regenerated.
    pub fn key_update_interval(&self, config: &Config) -> Duration {
        effective_interval(
            self.spec.key_update_interval.as_deref(),
            config.jwks_update_interval,
        )
    }

    /// Interval after which the served key set is verified again.
    pub fn verification_interval(&self, config: &Config) -> Duration {
        effective_interval(
            self.spec.verification_interval.as_deref(),
            config.jwks_verification_interval,
        )
    }
}

/// Parses a per-target override, falling back to `default` when the override
/// is absent, unparseable or zero.
fn effective_interval(value: Option<&str>, default: Duration) -> Duration {
    value
        .and_then(|v| humantime::parse_duration(v.trim()).ok())
        .filter(|d| !d.is_zero())
        .unwrap_or(default)
}

/// Defaults an empty path to `/jwks.json` and ensures a leading `/`.
pub(crate) fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.is_empty() {
        return JWKS_ENDPOINT_PATH.to_string();
    }
    if endpoint.starts_with('/') {
        endpoint.to_string()
    } else {
        format!("/{endpoint}")
    }
}
