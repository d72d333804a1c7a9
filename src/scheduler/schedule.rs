//! Schedule variants and their `next_run` computation (spec §4.8).

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::task::descriptor::{TaskKind, ResourceRequirements};

/// A schedule variant, each with its own due-time rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    Interval { minutes: i64 },
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: chrono::Weekday, hour: u32, minute: u32 },
    /// Day of month clamped to 28 at creation time (spec §4.8).
    Monthly { day: u32, hour: u32, minute: u32 },
    Once { at: DateTime<Utc> },
}

/// A template from which the Scheduler builds a [`TaskDescriptor`] on each
/// due tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub kind: TaskKind,
    pub task_type: String,
    pub priority: i64,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub requirements: ResourceRequirements,
}

/// One scheduled entry: a template plus its variant and run bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEntry {
    pub id: crate::ids::Id,
    pub name: String,
    pub template: TaskTemplate,
    pub schedule: ScheduleKind,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl ScheduledEntry {
    pub fn new(name: impl Into<String>, template: TaskTemplate, schedule: ScheduleKind) -> Self {
        let schedule = clamp_monthly_day(schedule);
        let now = Utc::now();
        let (next_run, enabled) = match &schedule {
            ScheduleKind::Once { at } if *at <= now => (None, false),
            _ => (Some(next_run_for(&schedule, None, now)), true),
        };
        Self {
            id: crate::ids::Id::new(),
            name: name.into(),
            template,
            schedule,
            enabled,
            last_run: None,
            next_run,
        }
    }

    /// Record a run and roll `next_run` forward; one-shots disable themselves.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        if matches!(self.schedule, ScheduleKind::Once { .. }) {
            self.enabled = false;
            self.next_run = None;
            return;
        }
        self.next_run = Some(next_run_for(&self.schedule, self.last_run, now));
    }
}

fn clamp_monthly_day(schedule: ScheduleKind) -> ScheduleKind {
    match schedule {
        ScheduleKind::Monthly { day, hour, minute } => ScheduleKind::Monthly {
            day: day.min(28),
            hour,
            minute,
        },
        other => other,
    }
}

/// Compute the next due moment for a variant, given its `last_run` (if any)
/// and the current time `now`.
pub fn next_run_for(schedule: &ScheduleKind, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match schedule {
        ScheduleKind::Interval { minutes } => match last_run {
            Some(last) => last + chrono::Duration::minutes(*minutes),
            None => now + chrono::Duration::minutes(*minutes),
        },
        ScheduleKind::Daily { hour, minute } => next_time_at_or_after(now, *hour, *minute, 1),
        ScheduleKind::Weekly { weekday, hour, minute } => next_weekly(now, *weekday, *hour, *minute),
        ScheduleKind::Monthly { day, hour, minute } => next_monthly(now, *day, *hour, *minute),
        ScheduleKind::Once { at } => *at,
    }
}

/// Next occurrence of `hour:minute` strictly in the future (or at `now`),
/// advancing by one day at a time if already past today.
fn next_time_at_or_after(now: DateTime<Utc>, hour: u32, minute: u32, _step_days: i64) -> DateTime<Utc> {
    let today_at = now
        .date_naive()
        .and_time(NaiveTime::from_hms_opt(hour, minute, 0).unwrap());
    let today_at = Utc.from_utc_datetime(&today_at);
    if today_at >= now {
        today_at
    } else {
        today_at + chrono::Duration::days(1)
    }
}

fn next_weekly(now: DateTime<Utc>, weekday: chrono::Weekday, hour: u32, minute: u32) -> DateTime<Utc> {
    let candidate = now
        .date_naive()
        .and_time(NaiveTime::from_hms_opt(hour, minute, 0).unwrap());
    let mut candidate = Utc.from_utc_datetime(&candidate);
    loop {
        if candidate.weekday() == weekday && candidate >= now {
            return candidate;
        }
        candidate += chrono::Duration::days(1);
        let naive = candidate
            .date_naive()
            .and_time(NaiveTime::from_hms_opt(hour, minute, 0).unwrap());
        candidate = Utc.from_utc_datetime(&naive);
    }
}

/// Next occurrence of `day hour:minute`; if the target month has fewer than
/// `day` days, use that month's last day instead (spec §4.8).
fn next_monthly(now: DateTime<Utc>, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    let mut year = now.year();
    let mut month = now.month();
    loop {
        let actual_day = day.min(days_in_month(year, month));
        let naive_date = chrono::NaiveDate::from_ymd_opt(year, month, actual_day).unwrap();
        let candidate = Utc.from_utc_datetime(&naive_date.and_time(NaiveTime::from_hms_opt(hour, minute, 0).unwrap()));
        if candidate >= now {
            return candidate;
        }
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next_month_first = if month == 12 {
        chrono::NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        chrono::NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .unwrap();
    let this_month_first = chrono::NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    (next_month_first - this_month_first).num_days() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> TaskTemplate {
        TaskTemplate {
            kind: TaskKind::Command {
                program: "true".into(),
                args: vec![],
            },
            task_type: "utility".into(),
            priority: 1,
            timeout_seconds: 0,
            requirements: ResourceRequirements::default(),
        }
    }

    #[test]
    fn interval_with_no_last_run_uses_now() {
        let now = Utc::now();
        let next = next_run_for(&ScheduleKind::Interval { minutes: 10 }, None, now);
        assert_eq!(next, now + chrono::Duration::minutes(10));
    }

    #[test]
    fn interval_with_last_run_adds_to_last_run() {
        let last = Utc::now() - chrono::Duration::minutes(5);
        let next = next_run_for(&ScheduleKind::Interval { minutes: 10 }, Some(last), Utc::now());
        assert_eq!(next, last + chrono::Duration::minutes(10));
    }

    #[test]
    fn monthly_day_is_clamped_to_28_at_creation() {
        let entry = ScheduledEntry::new(
            "end-of-month",
            template(),
            ScheduleKind::Monthly { day: 31, hour: 0, minute: 0 },
        );
        match entry.schedule {
            ScheduleKind::Monthly { day, .. } => assert_eq!(day, 28),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn monthly_falls_back_to_last_day_when_month_is_short() {
        // February never has a 28-clamped day beyond 28, so pick a case
        // where 28 actually differs from the month's last day: not
        // applicable since clamp is always <=28, which every month has.
        // Instead verify the general day_in_month fallback directly for a
        // synthetic day=30 input bypassing the entry-level clamp.
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let next = next_monthly(now, 30, 9, 0);
        assert_eq!(next.day(), 28);
        assert_eq!(next.month(), 2);
    }

    #[test]
    fn once_in_the_past_is_reported_by_caller_as_disabled() {
        let past = Utc::now() - chrono::Duration::hours(1);
        let entry = ScheduledEntry::new("one-shot", template(), ScheduleKind::Once { at: past });
        assert!(!entry.enabled);
        assert!(entry.next_run.is_none());
    }

    #[test]
    fn weekly_picks_next_matching_weekday_at_or_after_now() {
        let now = Utc::now();
        let next = next_weekly(now, chrono::Weekday::Mon, 9, 0);
        assert_eq!(next.weekday(), chrono::Weekday::Mon);
        assert!(next >= now - chrono::Duration::days(7));
    }
}
