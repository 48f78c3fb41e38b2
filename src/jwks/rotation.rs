//! Key rotation: merging a previously published key set with a new one.

use crate::jwks::{Jwk, Jwks, JwksError};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How a newly generated key set replaces the stored one.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum UpdateStrategy {
    /// Merge with the stored keys when old keys are kept.
    #[default]
    Rolling,
    /// Replace the stored keys outright.
    Immediate,
}

impl UpdateStrategy {
    /// Returns the configuration spelling of the strategy.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rolling => "rolling",
            Self::Immediate => "immediate",
        }
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStrategy {
    type Err = JwksError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rolling" => Ok(Self::Rolling),
            "immediate" => Ok(Self::Immediate),
            other => Err(JwksError::InvalidStrategy(other.to_string())),
        }
    }
}

/// Merges `new` into `old`.
///
/// Keeps every key of `old` in order, then appends the keys of `new` whose
/// `kid` is not already present. No `kid` appears twice in the result.
pub fn merge(old: &Jwks, new: &Jwks) -> Jwks {
    if old.is_empty() {
        return new.clone();
    }

    let mut merged = old.clone();
    for key in &new.keys {
        add_key(&mut merged, key.clone());
    }
    merged
}

/// Whether writing `new` over `old` would publish a key that is not yet
/// published.
pub fn should_update(old: &Jwks, new: &Jwks) -> bool {
    if new.is_empty() {
        return false;
    }
    if old.is_empty() {
        return true;
    }

    let published: HashSet<&str> = old.keys.iter().map(|k| k.kid.as_str()).collect();
    new.keys.iter().any(|k| !published.contains(k.kid.as_str()))
}

/// Appends `key` unless a key with the same `kid` is present.
/// Returns whether the key was added.
pub fn add_key(jwks: &mut Jwks, key: Jwk) -> bool {
    if jwks.contains_kid(&key.kid) {
        return false;
    }
    jwks.keys.push(key);
    true
}

/// Removes keys older than `ttl`.
///
/// Keys carry no creation time, so nothing is removed and old keys accumulate
/// under the rolling strategy.
// TODO: record per-key publication time in the key-set object and prune by
// `ttl` and `maxOldKeys` once the retention rule is settled.
pub fn remove_expired_keys(jwks: &mut Jwks, ttl: Duration) {
    let _ = (jwks, ttl);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(kids: &[&str]) -> Jwks {
        Jwks::new(
            kids.iter()
                .map(|kid| Jwk {
                    kid: kid.to_string(),
                    ..Jwk::default()
                })
                .collect(),
        )
    }

    fn kids(jwks: &Jwks) -> Vec<&str> {
        jwks.keys.iter().map(|k| k.kid.as_str()).collect()
    }

    #[test]
    fn test_merge_dedups_and_keeps_order() {
        let merged = merge(&set(&["1", "2"]), &set(&["2", "3"]));
        assert_eq!(kids(&merged), ["1", "2", "3"]);
    }

    #[test]
    fn test_merge_into_empty_returns_new() {
        assert_eq!(merge(&Jwks::default(), &set(&["a"])), set(&["a"]));
    }

    #[test]
    fn test_merge_with_empty_new_returns_old() {
        assert_eq!(merge(&set(&["a", "b"]), &Jwks::default()), set(&["a", "b"]));
    }

    #[test]
    fn test_should_update() {
        assert!(should_update(&Jwks::default(), &set(&["1"])));
        assert!(!should_update(&set(&["1", "2"]), &set(&["1", "2"])));
        assert!(should_update(&set(&["1", "2"]), &set(&["1", "3"])));
        assert!(!should_update(&set(&["1"]), &Jwks::default()));
        assert!(!should_update(&Jwks::default(), &Jwks::default()));
    }

    #[test]
    fn test_add_key_is_idempotent() {
        let mut jwks = set(&["a"]);
        assert!(!add_key(&mut jwks, set(&["a"]).keys.remove(0)));
        assert!(add_key(&mut jwks, set(&["b"]).keys.remove(0)));
        assert_eq!(kids(&jwks), ["a", "b"]);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("rolling".parse::<UpdateStrategy>().unwrap(), UpdateStrategy::Rolling);
        assert_eq!(
            "immediate".parse::<UpdateStrategy>().unwrap(),
            UpdateStrategy::Immediate
        );
        let err = "Rolling".parse::<UpdateStrategy>().unwrap_err();
        assert!(matches!(err, JwksError::InvalidStrategy(s) if s == "Rolling"));
    }

    #[test]
    fn test_remove_expired_keys_keeps_everything() {
        let mut jwks = set(&["a", "b", "c"]);
        remove_expired_keys(&mut jwks, Duration::ZERO);
        assert_eq!(jwks.len(), 3);
    }
}
