//! Pure scheduling logic over pending actions. No I/O; callers pass `now`
//! explicitly so every transition is reproducible in tests.

use crate::action::{ActionStatus, PendingAction};

/// Retry delays in seconds, indexed by attempt number. Attempt-indexed rather
/// than formula-driven so early and late delays can be tuned independently.
pub const BACKOFF_SECS: [i64; 5] = [0, 5, 30, 120, 600];

/// Past this many attempts the action requires human attention.
pub const MAX_ATTEMPTS: u32 = 5;

/// Next eligible retry instant for an action that has failed `retry_count`
/// times, or `None` once retries are exhausted. Counts beyond the table
/// clamp to its last entry.
pub fn next_retry_time(retry_count: u32, now: i64) -> Option<i64> {
    if retry_count >= MAX_ATTEMPTS {
        return None;
    }
    let delay = BACKOFF_SECS[(retry_count as usize).min(BACKOFF_SECS.len() - 1)];
    Some(now.saturating_add(delay))
}

/// Whether the action may be submitted right now. Fresh actions always
/// qualify; errored ones only while attempts remain and their scheduled
/// retry time has arrived.
pub fn is_eligible(action: &PendingAction, now: i64) -> bool {
    match action.status {
        ActionStatus::Pending => true,
        ActionStatus::Syncing => false,
        ActionStatus::Error => {
            if action.retry_count >= MAX_ATTEMPTS {
                return false;
            }
            match action.next_retry_at {
                Some(at) => now >= at,
                None => false,
            }
        }
    }
}

/// Records a transient failure: bumps the attempt counter and schedules the
/// next retry from the backoff table.
pub fn record_failure(action: &mut PendingAction, message: &str, now: i64) {
    action.retry_count = action.retry_count.saturating_add(1);
    action.status = ActionStatus::Error;
    action.error_message = Some(message.to_string());
    action.last_error_at = Some(now);
    action.next_retry_at = next_retry_time(action.retry_count, now);
}

/// Records a failure the remote classified as permanent (validation
/// rejection): the action is exhausted immediately and waits for a human.
pub fn record_permanent_failure(action: &mut PendingAction, message: &str, now: i64) {
    action.retry_count = MAX_ATTEMPTS;
    action.status = ActionStatus::Error;
    action.error_message = Some(message.to_string());
    action.last_error_at = Some(now);
    action.next_retry_at = None;
}

/// Puts an exhausted (or errored) action back at the front of the line after
/// an explicit operator request.
pub fn reset_for_manual_retry(action: &mut PendingAction) {
    action.status = ActionStatus::Pending;
    action.retry_count = 0;
    action.next_retry_at = None;
    action.error_message = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use fieldsync_core::UpdateWeldStatusRequest;

    fn make_action() -> PendingAction {
        PendingAction::new(
            "p-100",
            Action::UpdateWeldStatus(UpdateWeldStatusRequest {
                weld_id: "W-001".into(),
                status: "fit_up".into(),
            }),
            1_000,
        )
    }

    #[test]
    fn backoff_table_is_attempt_indexed() {
        let now = 1_000;
        assert_eq!(next_retry_time(0, now), Some(1_000));
        assert_eq!(next_retry_time(1, now), Some(1_005));
        assert_eq!(next_retry_time(2, now), Some(1_030));
        assert_eq!(next_retry_time(3, now), Some(1_120));
        assert_eq!(next_retry_time(4, now), Some(1_600));
    }

    #[test]
    fn exhausted_counts_get_no_retry_time() {
        assert_eq!(next_retry_time(5, 1_000), None);
        assert_eq!(next_retry_time(17, 1_000), None);
    }

    #[test]
    fn pending_actions_are_always_eligible() {
        let action = make_action();
        assert!(is_eligible(&action, 0));
        assert!(is_eligible(&action, i64::MAX));
    }

    #[test]
    fn syncing_actions_are_never_eligible() {
        let mut action = make_action();
        action.status = ActionStatus::Syncing;
        assert!(!is_eligible(&action, i64::MAX));
    }

    #[test]
    fn eligibility_flips_exactly_at_next_retry_at() {
        let mut action = make_action();
        record_failure(&mut action, "503", 1_000);

        assert_eq!(action.next_retry_at, Some(1_005));
        assert!(!is_eligible(&action, 1_004));
        assert!(is_eligible(&action, 1_005));
        assert!(is_eligible(&action, 1_006));
    }

    #[test]
    fn errored_without_schedule_is_not_eligible() {
        let mut action = make_action();
        action.status = ActionStatus::Error;
        action.next_retry_at = None;
        assert!(!is_eligible(&action, i64::MAX));
    }

    #[test]
    fn record_failure_advances_attempt_state() {
        let mut action = make_action();
        record_failure(&mut action, "connection reset", 2_000);

        assert_eq!(action.status, ActionStatus::Error);
        assert_eq!(action.retry_count, 1);
        assert_eq!(action.error_message.as_deref(), Some("connection reset"));
        assert_eq!(action.last_error_at, Some(2_000));
        assert_eq!(action.next_retry_at, Some(2_005));
    }

    #[test]
    fn fifth_failure_exhausts_retries_forever() {
        let mut action = make_action();
        action.retry_count = 4;
        record_failure(&mut action, "still down", 3_000);

        assert_eq!(action.retry_count, 5);
        assert_eq!(action.next_retry_at, None);
        assert!(!is_eligible(&action, i64::MAX));
    }

    #[test]
    fn permanent_failure_exhausts_immediately() {
        let mut action = make_action();
        record_permanent_failure(&mut action, "duplicate key", 3_000);

        assert_eq!(action.retry_count, MAX_ATTEMPTS);
        assert_eq!(action.next_retry_at, None);
        assert!(!is_eligible(&action, i64::MAX));
    }

    #[test]
    fn manual_reset_restores_eligibility() {
        let mut action = make_action();
        action.retry_count = 4;
        record_failure(&mut action, "still down", 3_000);
        assert!(!is_eligible(&action, i64::MAX));

        reset_for_manual_retry(&mut action);

        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.retry_count, 0);
        assert_eq!(action.next_retry_at, None);
        assert_eq!(action.error_message, None);
        assert!(is_eligible(&action, 0));
    }
}
