//! Mutations of a target's observed status.

use crate::constants::{CONDITION_READY, REASON_RECONCILED};
use crate::prelude::*;
use crate::store::ResourceStore;
use crate::target::{Condition, ConditionStatus, JwksTarget};
use time::OffsetDateTime;

/// Records or replaces the `Ready` condition.
///
/// The transition time only moves when the condition's status flips.
pub(crate) fn set_ready_condition(
    target: &mut JwksTarget,
    status: ConditionStatus,
    reason: &str,
    message: String,
    now: OffsetDateTime,
) {
    let observed_generation = target.metadata.generation;
    let conditions = &mut target.status.conditions;

    match conditions
        .iter_mut()
        .find(|c| c.condition_type == CONDITION_READY)
    {
        Some(condition) => {
            if condition.status != status {
                condition.last_transition_time = now;
            }
            condition.status = status;
            condition.reason = reason.to_string();
            condition.message = message;
            condition.observed_generation = observed_generation;
        }
        None => conditions.push(Condition {
            condition_type: CONDITION_READY.to_string(),
            status,
            reason: reason.to_string(),
            message,
            observed_generation,
            last_transition_time: now,
        }),
    }
}

/// Marks a successful full pass.
pub(crate) fn set_ready(target: &mut JwksTarget, message: &str, now: OffsetDateTime) {
    set_ready_condition(
        target,
        ConditionStatus::True,
        REASON_RECONCILED,
        message.to_string(),
        now,
    );
    target.status.last_update_time = Some(now);
}

pub(crate) fn set_not_ready(
    target: &mut JwksTarget,
    reason: &str,
    message: String,
    now: OffsetDateTime,
) {
    set_ready_condition(target, ConditionStatus::False, reason, message, now);
}

/// Writes the status of `target` back to the store.
///
/// Failures are logged and otherwise ignored; the next pass recomputes and
/// writes the status again. Returns the stored copy on success.
pub(crate) async fn persist(store: &dyn ResourceStore, target: &JwksTarget) -> Option<JwksTarget> {
    match store.update_target_status(target).await {
        Ok(stored) => Some(stored),
        Err(e) if e.is_conflict() => {
            warn!(
                "Status update conflict, retrying on next pass: namespace={}, name={}",
                target.namespace(),
                target.name()
            );
            None
        }
        Err(e) => {
            warn!(
                "Failed to update status: namespace={}, name={}, error={e}",
                target.namespace(),
                target.name()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::JwksTargetSpec;
    use time::macros::datetime;

    fn target() -> JwksTarget {
        let mut target = JwksTarget::new("ns", "issuer", JwksTargetSpec::default());
        target.metadata.generation = 3;
        target
    }

    #[test]
    fn test_ready_records_generation_and_update_time() {
        let mut target = target();
        let now = datetime!(2024-05-01 12:00 UTC);
        set_ready(&mut target, "JWKS successfully updated", now);

        let condition = target.ready_condition().unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, "Reconciled");
        assert_eq!(condition.observed_generation, 3);
        assert_eq!(target.status.last_update_time, Some(now));
        assert!(target.observed_current_generation());
    }

    #[test]
    fn test_transition_time_moves_only_on_flip() {
        let mut target = target();
        let t0 = datetime!(2024-05-01 12:00 UTC);
        let t1 = datetime!(2024-05-01 12:05 UTC);
        let t2 = datetime!(2024-05-01 12:10 UTC);

        set_not_ready(&mut target, "SecretNotFound", "missing".to_string(), t0);
        set_not_ready(&mut target, "JWKSGenerationFailed", "bad cert".to_string(), t1);
        let condition = target.ready_condition().unwrap();
        assert_eq!(condition.last_transition_time, t0);
        assert_eq!(condition.reason, "JWKSGenerationFailed");

        set_ready(&mut target, "ok", t2);
        assert_eq!(target.ready_condition().unwrap().last_transition_time, t2);
        assert_eq!(target.status.conditions.len(), 1);
    }

    #[test]
    fn test_not_ready_leaves_update_time() {
        let mut target = target();
        set_not_ready(
            &mut target,
            "ConfigMapUpdateFailed",
            "boom".to_string(),
            datetime!(2024-05-01 12:00 UTC),
        );
        assert!(!target.is_ready());
        assert_eq!(target.status.last_update_time, None);
    }
}
