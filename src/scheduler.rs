//! Decides what a pass does and when the next one runs.
//!
//! Scheduling state is a small counter persisted on the target
//! ([`JwksTarget::schedule_counter`]) together with the last-verified time.
//! A counter of 0 means "just started": the next pass runs after
//! [`FIRST_FAST_DELAY`]. Counter 1 is followed by [`SECOND_FAST_DELAY`], and
//! from 2 on the target is polled at its steady interval.
//!
//! The counter is advisory. It is written by a detached best-effort task, so
//! every rule below tolerates a stale or missing value.

use crate::config::Config;
use crate::target::JwksTarget;
use std::time::Duration;
use time::OffsetDateTime;

/// Delay after the first pass following a start.
pub const FIRST_FAST_DELAY: Duration = Duration::from_secs(10);

/// Delay after the second pass following a start.
pub const SECOND_FAST_DELAY: Duration = Duration::from_secs(30);

/// A last verification older than this, seen in steady state, means the
/// process was restarted.
pub const RESTART_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// A counter still at 1 with a verification this recent is stuck.
pub const STUCK_COUNTER_WINDOW: Duration = Duration::from_secs(5 * 60);

/// What a pass should do.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Action {
    /// Nothing is due; only requeue.
    Skip,
    /// Only the served key set needs verifying.
    VerifyOnly,
    /// Run every phase.
    FullPass,
}

/// When the next pass should run, and the counter to persist for it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Schedule {
    /// Delay before the next pass.
    pub delay: Duration,
    /// New counter value, when it changes.
    pub counter: Option<u32>,
}

/// Which derived artifacts currently exist in the store.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ArtifactPresence {
    /// The key-set object.
    pub key_set: bool,
    /// The serving-configuration object.
    pub serving_config: bool,
    /// The serving workload.
    pub workload: bool,
}

impl ArtifactPresence {
    /// Whether every artifact the target needs exists.
    ///
    /// Serving artifacts only count when serving is enabled.
    pub fn is_complete(&self, serving_enabled: bool) -> bool {
        self.key_set && (!serving_enabled || (self.serving_config && self.workload))
    }
}

/// Scheduling counter and verification age of a target, as seen when a pass starts.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CounterState {
    /// Counter as persisted on the target.
    pub persisted: u32,
    /// Counter after restart inference.
    pub effective: u32,
    /// Time since the last verification, if there was one.
    pub since_verified: Option<Duration>,
}

impl CounterState {
    // A healthy target leaves counter 1 after one pass spaced
    // FIRST_FAST_DELAY after its verification. Seeing 1 again once at least
    // SECOND_FAST_DELAY has passed since a recent verification means the
    // counter write was dropped.
    fn counter_stuck(&self) -> bool {
        self.since_verified
            .is_some_and(|since| since >= SECOND_FAST_DELAY && since < STUCK_COUNTER_WINDOW)
    }
}

/// Applies the scheduling rules with the operator's default intervals.
#[derive(Debug, Clone)]
pub struct Scheduler {
    config: Config,
}

impl Scheduler {
    /// Creates a scheduler resolving intervals against `config`.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Chooses between a full pass, a verification-only pass and skipping.
    pub fn decide_action(
        &self,
        target: &JwksTarget,
        presence: &ArtifactPresence,
        now: OffsetDateTime,
    ) -> Action {
        if self.full_pass_due(target, presence, now) {
            Action::FullPass
        } else if self.verification_due(target, now) {
            Action::VerifyOnly
        } else {
            Action::Skip
        }
    }

    /// Whether every phase has to run.
    pub fn full_pass_due(
        &self,
        target: &JwksTarget,
        presence: &ArtifactPresence,
        now: OffsetDateTime,
    ) -> bool {
        if !target.observed_current_generation() {
            return true;
        }
        let Some(last_update) = target.status.last_update_time else {
            return true;
        };
        if !presence.is_complete(target.serving_enabled()) {
            return true;
        }
        elapsed(last_update, now) >= target.key_update_interval(&self.config)
    }

    /// Whether the served key set should be verified during this pass.
    ///
    /// Never due for a target without serving.
    pub fn verification_due(&self, target: &JwksTarget, now: OffsetDateTime) -> bool {
        if !target.serving_enabled() {
            return false;
        }
        let Some(last_verified) = target.status.last_verified_time else {
            return true;
        };
        self.effective_counter(target, now) == 0
            || elapsed(last_verified, now) >= target.verification_interval(&self.config)
    }

    /// The persisted counter, reset to 0 when a restart is inferred.
    ///
    /// A restart is inferred for a serving target in steady state whose last
    /// verification is missing or older than [`RESTART_THRESHOLD`]: a warm
    /// process would have verified more recently than that.
    pub fn effective_counter(&self, target: &JwksTarget, now: OffsetDateTime) -> u32 {
        let counter = target.schedule_counter();
        if counter < 2 || !target.serving_enabled() {
            return counter;
        }
        match target.status.last_verified_time {
            Some(at) if elapsed(at, now) <= RESTART_THRESHOLD => counter,
            _ => 0,
        }
    }

    /// Captures the scheduling state of `target` before a pass touches its status.
    ///
    /// A successful verification moves `last_verified_time` to the present,
    /// which hides both a restart and a stuck counter. Callers take this
    /// snapshot at decide time and hand it to [`Scheduler::next_delay`].
    pub fn counter_state(&self, target: &JwksTarget, now: OffsetDateTime) -> CounterState {
        CounterState {
            persisted: target.schedule_counter(),
            effective: self.effective_counter(target, now),
            since_verified: target.status.last_verified_time.map(|at| elapsed(at, now)),
        }
    }

    /// Delay before the next pass and the counter to persist.
    pub fn next_delay(&self, target: &JwksTarget, state: CounterState) -> Schedule {
        let steady = self.steady_interval(target);

        match state.effective {
            0 => Schedule {
                delay: FIRST_FAST_DELAY,
                counter: Some(1),
            },
            1 if state.counter_stuck() => Schedule {
                delay: steady,
                counter: Some(2),
            },
            1 => Schedule {
                delay: SECOND_FAST_DELAY,
                counter: Some(2),
            },
            counter => Schedule {
                delay: steady,
                counter: (counter != state.persisted).then_some(counter),
            },
        }
    }

    /// Steady-state polling interval: the shorter of the reconcile and
    /// verification intervals.
    pub fn steady_interval(&self, target: &JwksTarget) -> Duration {
        target
            .reconcile_interval(&self.config)
            .min(target.verification_interval(&self.config))
    }
}

/// Time from `since` to `now`; zero if `since` is in the future.
fn elapsed(since: OffsetDateTime, now: OffsetDateTime) -> Duration {
    Duration::try_from(now - since).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Condition, ConditionStatus, JwksTargetSpec};
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);
    const ALL_PRESENT: ArtifactPresence = ArtifactPresence {
        key_set: true,
        serving_config: true,
        workload: true,
    };

    fn scheduler() -> Scheduler {
        Scheduler::new(Config::default())
    }

    fn target(serving: bool) -> JwksTarget {
        JwksTarget::new(
            "ns",
            "issuer",
            JwksTargetSpec {
                certificate_secret: "issuer-tls".to_string(),
                config_map_name: "issuer-jwks".to_string(),
                nginx_config_map_name: serving.then(|| "issuer-nginx".to_string()),
                ..JwksTargetSpec::default()
            },
        )
    }

    /// A target whose last full pass and verification both happened at `at`.
    fn converged(at: OffsetDateTime, counter: u32) -> JwksTarget {
        let mut target = target(true);
        target.metadata.generation = 1;
        target.status.conditions.push(Condition {
            condition_type: "Ready".to_string(),
            status: ConditionStatus::True,
            reason: "Reconciled".to_string(),
            message: String::new(),
            observed_generation: 1,
            last_transition_time: at,
        });
        target.status.last_update_time = Some(at);
        target.status.last_verified_time = Some(at);
        target.status.fast_reconcile_count = Some(counter);
        target
    }

    fn minutes(m: i64) -> time::Duration {
        time::Duration::minutes(m)
    }

    #[test]
    fn test_new_target_needs_full_pass() {
        let action = scheduler().decide_action(&target(true), &ArtifactPresence::default(), NOW);
        assert_eq!(action, Action::FullPass);
    }

    #[test]
    fn test_generation_change_forces_full_pass() {
        let mut target = converged(NOW, 2);
        target.metadata.generation = 2;
        assert_eq!(
            scheduler().decide_action(&target, &ALL_PRESENT, NOW),
            Action::FullPass
        );
    }

    #[test]
    fn test_missing_artifact_forces_full_pass() {
        let target = converged(NOW, 2);
        let presence = ArtifactPresence {
            workload: false,
            ..ALL_PRESENT
        };
        assert_eq!(
            scheduler().decide_action(&target, &presence, NOW),
            Action::FullPass
        );
    }

    #[test]
    fn test_serving_artifacts_ignored_without_serving() {
        let presence = ArtifactPresence {
            key_set: true,
            ..ArtifactPresence::default()
        };
        assert!(presence.is_complete(false));
        assert!(!presence.is_complete(true));
    }

    #[test]
    fn test_key_update_interval_forces_full_pass() {
        let target = converged(NOW - time::Duration::hours(6), 2);
        let presence = ALL_PRESENT;
        assert!(scheduler().full_pass_due(&target, &presence, NOW));
        assert!(!scheduler().full_pass_due(&target, &presence, NOW - minutes(1)));
    }

    #[test]
    fn test_verification_interval_gives_verify_only() {
        let target = converged(NOW - minutes(1), 2);
        assert_eq!(
            scheduler().decide_action(&target, &ALL_PRESENT, NOW),
            Action::VerifyOnly
        );
    }

    #[test]
    fn test_nothing_due_skips() {
        let target = converged(NOW - time::Duration::seconds(20), 2);
        assert_eq!(
            scheduler().decide_action(&target, &ALL_PRESENT, NOW),
            Action::Skip
        );
    }

    #[test]
    fn test_verification_never_due_without_serving() {
        let mut target = target(false);
        target.status.fast_reconcile_count = Some(0);
        assert!(!scheduler().verification_due(&target, NOW));
    }

    #[test]
    fn test_fast_sequence_for_new_target() {
        let scheduler = scheduler();

        // Pass 1 verified just now.
        let mut target = converged(NOW, 0);
        target.status.fast_reconcile_count = None;
        let first = scheduler.next_delay(&target, scheduler.counter_state(&target, NOW));
        assert_eq!(first, Schedule { delay: FIRST_FAST_DELAY, counter: Some(1) });

        // Pass 2 runs ten seconds later.
        target.status.fast_reconcile_count = first.counter;
        let at = NOW + time::Duration::seconds(10);
        let second = scheduler.next_delay(&target, scheduler.counter_state(&target, at));
        assert_eq!(second, Schedule { delay: SECOND_FAST_DELAY, counter: Some(2) });

        // Pass 3 and later use the steady interval: min(5m, 1m).
        target.status.fast_reconcile_count = second.counter;
        let at = at + time::Duration::seconds(30);
        let third = scheduler.next_delay(&target, scheduler.counter_state(&target, at));
        assert_eq!(third, Schedule { delay: Duration::from_secs(60), counter: None });
    }

    #[test]
    fn test_restart_resets_counter() {
        let scheduler = scheduler();
        let target = converged(NOW - minutes(40), 2);

        assert_eq!(scheduler.effective_counter(&target, NOW), 0);
        assert!(scheduler.verification_due(&target, NOW));
        assert_eq!(
            scheduler.next_delay(&target, scheduler.counter_state(&target, NOW)),
            Schedule { delay: FIRST_FAST_DELAY, counter: Some(1) }
        );
    }

    #[test]
    fn test_restart_survives_verification_during_the_pass() {
        let scheduler = scheduler();
        let mut target = converged(NOW - minutes(40), 2);
        let state = scheduler.counter_state(&target, NOW);

        // The pass verifies successfully.
        target.status.last_verified_time = Some(NOW);

        assert_eq!(state.effective, 0);
        assert_eq!(
            scheduler.next_delay(&target, state),
            Schedule { delay: FIRST_FAST_DELAY, counter: Some(1) }
        );
    }

    #[test]
    fn test_counter_one_shortly_after_verification_is_not_stuck() {
        let scheduler = scheduler();
        let target = converged(NOW - time::Duration::seconds(10), 1);
        assert_eq!(
            scheduler.next_delay(&target, scheduler.counter_state(&target, NOW)),
            Schedule { delay: SECOND_FAST_DELAY, counter: Some(2) }
        );
    }

    #[test]
    fn test_recent_verification_is_not_a_restart() {
        let target = converged(NOW - minutes(29), 2);
        assert_eq!(scheduler().effective_counter(&target, NOW), 2);
    }

    #[test]
    fn test_no_restart_inference_without_serving() {
        let mut target = target(false);
        target.status.fast_reconcile_count = Some(2);
        assert_eq!(scheduler().effective_counter(&target, NOW), 2);
    }

    #[test]
    fn test_stuck_counter_is_forced_to_steady() {
        let scheduler = scheduler();
        let target = converged(NOW - minutes(2), 1);
        assert_eq!(
            scheduler.next_delay(&target, scheduler.counter_state(&target, NOW)),
            Schedule { delay: Duration::from_secs(60), counter: Some(2) }
        );
    }

    #[test]
    fn test_target_overrides_steady_interval() {
        let mut target = converged(NOW, 2);
        target.spec.reconcile_interval = Some("30s".to_string());
        target.spec.verification_interval = Some("10m".to_string());
        assert_eq!(scheduler().steady_interval(&target), Duration::from_secs(30));

        target.spec.reconcile_interval = Some("not-a-duration".to_string());
        assert_eq!(scheduler().steady_interval(&target), Duration::from_secs(300));
    }

    #[test]
    fn test_legacy_annotation_counter() {
        let mut target = converged(NOW, 0);
        target.status.fast_reconcile_count = None;
        target.metadata.annotations.insert(
            crate::constants::ANNOTATION_FAST_RECONCILE_COUNT.to_string(),
            "2".to_string(),
        );
        assert_eq!(scheduler().effective_counter(&target, NOW), 2);
    }
}
