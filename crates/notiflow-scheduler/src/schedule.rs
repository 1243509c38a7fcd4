//! Schedule matching at minute granularity.
//! Supports the four frequency classes: daily, weekly, selected days, one-time.
//! All comparisons happen in the tenant's local time (a fixed UTC offset).
//!
//! No cron crate dependency: the schedule vocabulary is matched directly.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, Timelike, Weekday};

use crate::tasks::{Frequency, Task};

/// Parse "HH:MM" (also "H:MM" and "HH:MM:SS") into hour and minute.
pub fn parse_hhmm(time: &str) -> Option<(u32, u32)> {
    let mut parts = time.trim().split(':');
    let hour: u32 = parts.next()?.trim().parse().ok()?;
    let minute: u32 = parts.next()?.trim().parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

/// English weekday name, as stored in task documents.
pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Parse a weekday name ("Monday", "monday", "Mon").
pub fn parse_weekday(name: &str) -> Option<Weekday> {
    name.trim().parse().ok()
}

fn time_matches(task_time: &str, now: &DateTime<FixedOffset>) -> bool {
    match parse_hhmm(task_time) {
        Some((h, m)) => now.hour() == h && now.minute() == m,
        None => false,
    }
}

fn day_matches(name: &str, now: &DateTime<FixedOffset>) -> bool {
    parse_weekday(name) == Some(now.weekday())
}

/// Whether `now` (local, minute granularity) is a firing minute for the task.
pub fn is_due(task: &Task, now: &DateTime<FixedOffset>) -> bool {
    if !task.is_schedulable() {
        return false;
    }
    match task.frequency {
        Frequency::Daily => time_matches(&task.time, now),
        Frequency::Weekly => {
            task.weekly_day.as_deref().is_some_and(|d| day_matches(d, now))
                && time_matches(&task.time, now)
        }
        Frequency::SelectedDays => {
            task.selected_days.iter().any(|d| day_matches(d, now))
                && time_matches(&task.time, now)
        }
        Frequency::OneTime => match &task.datetime {
            Some(at) => {
                let at = at.with_timezone(now.offset());
                at.date_naive() == now.date_naive()
                    && at.hour() == now.hour()
                    && at.minute() == now.minute()
            }
            None => false,
        },
    }
}

/// Next firing minute strictly after `now`, if the task has one.
pub fn next_execution(task: &Task, now: &DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    if !task.is_schedulable() {
        return None;
    }
    match task.frequency {
        Frequency::OneTime => {
            let at = task.datetime?.with_timezone(now.offset());
            (at > *now).then_some(at)
        }
        Frequency::Daily => next_on_days(&task.time, now, |_| true),
        Frequency::Weekly => {
            let day = parse_weekday(task.weekly_day.as_deref()?)?;
            next_on_days(&task.time, now, |d| d == day)
        }
        Frequency::SelectedDays => {
            let days: Vec<Weekday> = task
                .selected_days
                .iter()
                .filter_map(|d| parse_weekday(d))
                .collect();
            if days.is_empty() {
                return None;
            }
            next_on_days(&task.time, now, |d| days.contains(&d))
        }
    }
}

/// Earliest local date-time at `time` on an accepted weekday, after `now`.
fn next_on_days<F>(time: &str, now: &DateTime<FixedOffset>, accept: F) -> Option<DateTime<FixedOffset>>
where
    F: Fn(Weekday) -> bool,
{
    let (h, m) = parse_hhmm(time)?;
    let at = NaiveTime::from_hms_opt(h, m, 0)?;
    // Today plus a full week covers every weekday at least once.
    for offset in 0..=7 {
        let date = now.date_naive() + Duration::days(offset);
        if !accept(date.weekday()) {
            continue;
        }
        let candidate = date.and_time(at).and_local_timezone(*now.offset()).single()?;
        if candidate > *now {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("09:30"), Some((9, 30)));
        assert_eq!(parse_hhmm("9:05"), Some((9, 5)));
        assert_eq!(parse_hhmm("23:59:00"), Some((23, 59)));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("noon"), None);
    }

    #[test]
    fn test_daily_fires_only_at_its_minute() {
        let task = Task::daily("t1", "digest", "09:30");
        // 2026-03-02 is a Monday.
        assert!(is_due(&task, &local(2026, 3, 2, 9, 30)));
        assert!(!is_due(&task, &local(2026, 3, 2, 9, 31)));
        assert!(!is_due(&task, &local(2026, 3, 2, 10, 30)));
        assert!(is_due(&task, &local(2026, 3, 3, 9, 30)));
    }

    #[test]
    fn test_daily_fires_once_per_day() {
        let task = Task::daily("t1", "digest", "09:30");
        let start = local(2026, 3, 2, 0, 0);
        let hits = (0..24 * 60)
            .map(|m| start + Duration::minutes(m))
            .filter(|t| is_due(&task, t))
            .count();
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_weekly_requires_weekday() {
        let task = Task::weekly("t1", "report", "Monday", "08:00");
        assert!(is_due(&task, &local(2026, 3, 2, 8, 0)));
        assert!(!is_due(&task, &local(2026, 3, 3, 8, 0)));
    }

    #[test]
    fn test_selected_days() {
        let task = Task::selected_days("t1", "gym", &["Tuesday", "Thursday"], "18:15");
        assert!(is_due(&task, &local(2026, 3, 3, 18, 15)));
        assert!(is_due(&task, &local(2026, 3, 5, 18, 15)));
        assert!(!is_due(&task, &local(2026, 3, 4, 18, 15)));
    }

    #[test]
    fn test_one_time_matches_exact_minute_in_local_offset() {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 4, 0, 0).unwrap();
        let mut task = Task::once("t1", "launch", at);
        let ist = FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap();
        let now = ist.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap();
        assert!(is_due(&task, &now));
        assert!(!is_due(&task, &(now + Duration::minutes(1))));

        task.executed = true;
        assert!(!is_due(&task, &now));
    }

    #[test]
    fn test_inactive_task_never_due() {
        let mut task = Task::daily("t1", "digest", "09:30");
        task.is_active = false;
        assert!(!is_due(&task, &local(2026, 3, 2, 9, 30)));
    }

    #[test]
    fn test_next_execution_daily() {
        let task = Task::daily("t1", "digest", "09:30");
        let next = next_execution(&task, &local(2026, 3, 2, 9, 30)).unwrap();
        assert_eq!(next, local(2026, 3, 3, 9, 30));
        let next = next_execution(&task, &local(2026, 3, 2, 7, 0)).unwrap();
        assert_eq!(next, local(2026, 3, 2, 9, 30));
    }

    #[test]
    fn test_next_execution_weekly_wraps_week() {
        let task = Task::weekly("t1", "report", "Monday", "08:00");
        let next = next_execution(&task, &local(2026, 3, 2, 8, 0)).unwrap();
        assert_eq!(next, local(2026, 3, 9, 8, 0));
    }

    #[test]
    fn test_next_execution_one_time_in_past() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let task = Task::once("t1", "launch", at);
        assert!(next_execution(&task, &local(2026, 3, 2, 0, 0)).is_none());
    }
}
