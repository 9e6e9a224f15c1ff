//! Reminder cooldown: suppresses repeat reminders for the same condition.
//!
//! An overdue task is reminded at most once per configured interval; a
//! due-soon reminder fires once per (task, due date), so moving the due date
//! re-arms it. State is in-memory and resets on restart.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

/// What a cooldown entry guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReminderKey {
    Overdue(i64),
    DueSoon { task_id: i64, due: DateTime<Utc> },
}

/// In-memory map of reminder key → cooldown expiry.
#[derive(Debug, Default)]
pub struct ReminderCooldown {
    expiries: Mutex<HashMap<ReminderKey, DateTime<Utc>>>,
}

impl ReminderCooldown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if `key` is in cooldown, and if not, start one lasting until
    /// `until`.
    ///
    /// Returns `true` if the reminder should go out.
    pub fn check_and_set(&self, key: ReminderKey, now: DateTime<Utc>, until: DateTime<Utc>) -> bool {
        let mut expiries = self.expiries();
        if expiries.get(&key).is_some_and(|expiry| *expiry > now) {
            tracing::debug!(?key, "Reminder suppressed by cooldown");
            return false;
        }
        expiries.insert(key, until);
        true
    }

    /// Drop the cooldown for `key` (e.g. when the reminder could not be submitted).
    pub fn clear(&self, key: ReminderKey) {
        self.expiries().remove(&key);
    }

    /// Forget expired entries. Returns how many were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut expiries = self.expiries();
        let before = expiries.len();
        expiries.retain(|_, expiry| *expiry > now);
        before - expiries.len()
    }

    pub fn len(&self) -> usize {
        self.expiries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expiries(&self) -> std::sync::MutexGuard<'_, HashMap<ReminderKey, DateTime<Utc>>> {
        self.expiries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_check_and_set_suppresses_until_expiry() {
        let cooldown = ReminderCooldown::new();
        let now = Utc::now();
        let key = ReminderKey::Overdue(4);

        assert!(cooldown.check_and_set(key, now, now + Duration::hours(24)));
        assert!(!cooldown.check_and_set(key, now + Duration::hours(23), now + Duration::hours(47)));
        assert!(cooldown.check_and_set(key, now + Duration::hours(24), now + Duration::hours(48)));
    }

    #[test]
    fn test_due_soon_key_includes_due_date() {
        let cooldown = ReminderCooldown::new();
        let now = Utc::now();
        let due = now + Duration::minutes(30);
        let moved = now + Duration::minutes(45);

        assert!(cooldown.check_and_set(ReminderKey::DueSoon { task_id: 1, due }, now, due));
        assert!(!cooldown.check_and_set(ReminderKey::DueSoon { task_id: 1, due }, now, due));
        assert!(cooldown.check_and_set(
            ReminderKey::DueSoon { task_id: 1, due: moved },
            now,
            moved
        ));
    }

    #[test]
    fn test_clear_and_prune() {
        let cooldown = ReminderCooldown::new();
        let now = Utc::now();

        cooldown.check_and_set(ReminderKey::Overdue(1), now, now + Duration::minutes(1));
        cooldown.check_and_set(ReminderKey::Overdue(2), now, now + Duration::hours(1));
        cooldown.check_and_set(ReminderKey::Overdue(3), now, now + Duration::hours(1));
        assert_eq!(cooldown.len(), 3);

        cooldown.clear(ReminderKey::Overdue(3));
        assert!(cooldown.check_and_set(ReminderKey::Overdue(3), now, now + Duration::hours(1)));

        assert_eq!(cooldown.prune(now + Duration::minutes(5)), 1);
        assert_eq!(cooldown.len(), 2);
    }
}
