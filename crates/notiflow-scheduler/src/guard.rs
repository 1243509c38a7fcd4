//! Execution guard — time-windowed deduplication of firings.
//!
//! Keys are `(task_id, hour, minute)` of the local firing minute. A key stays
//! in the set for the configured window, measured on the scheduler clock, and
//! is pruned lazily on the next check. Each engine owns its own guard; there
//! is no process-wide state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Timelike};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GuardKey {
    task_id: String,
    hour: u32,
    minute: u32,
}

#[derive(Debug)]
pub struct ExecutionGuard {
    window: chrono::Duration,
    entries: Mutex<HashMap<GuardKey, DateTime<FixedOffset>>>,
}

impl ExecutionGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(1)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the firing slot for this task and minute.
    /// Returns false if the slot was already claimed inside the window.
    pub fn try_acquire(&self, task_id: &str, now: &DateTime<FixedOffset>) -> bool {
        let key = GuardKey {
            task_id: task_id.to_string(),
            hour: now.hour(),
            minute: now.minute(),
        };
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = self.window;
        entries.retain(|_, claimed| now.signed_duration_since(*claimed) < window);

        if entries.contains_key(&key) {
            tracing::debug!("🔒 Guard hit for task {task_id} at {:02}:{:02}", key.hour, key.minute);
            return false;
        }
        entries.insert(key, *now);
        true
    }

    /// Live keys, expired entries included until the next check prunes them.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, h: u32, m: u32, s: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2026, 3, day, h, m, s).unwrap()
    }

    #[test]
    fn test_second_acquire_in_same_minute_is_rejected() {
        let guard = ExecutionGuard::new(Duration::from_secs(120));
        assert!(guard.try_acquire("t1", &at(2, 9, 30, 0)));
        assert!(!guard.try_acquire("t1", &at(2, 9, 30, 45)));
        assert!(guard.try_acquire("t2", &at(2, 9, 30, 0)));
        assert!(guard.try_acquire("t1", &at(2, 9, 31, 0)));
    }

    #[test]
    fn test_same_minute_next_day_is_allowed() {
        let guard = ExecutionGuard::new(Duration::from_secs(120));
        assert!(guard.try_acquire("t1", &at(2, 9, 30, 0)));
        assert!(guard.try_acquire("t1", &at(3, 9, 30, 0)));
    }

    #[test]
    fn test_expired_entries_are_pruned() {
        let guard = ExecutionGuard::new(Duration::from_secs(3600));
        for m in 0..10 {
            guard.try_acquire("t1", &at(2, 9, m, 0));
        }
        assert_eq!(guard.len(), 10);
        guard.try_acquire("t2", &at(2, 10, 30, 0));
        assert_eq!(guard.len(), 1);
    }
}
