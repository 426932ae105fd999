//! Scheduling policies and next-run computation.

use std::time::Duration;

use chrono::{DateTime, Days, LocalResult, NaiveDateTime, NaiveTime, TimeZone};

/// How the scheduler decides when the next batch runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Once a day at `hour:00` local time. Failed runs are retried after
    /// `retry_delay` until one succeeds.
    DailyAtHour { hour: u32, retry_delay: Duration },

    /// Every `period`, optionally also once immediately at startup. A failed
    /// run is simply followed by the next tick.
    FixedInterval { period: Duration, run_on_startup: bool },
}

impl SchedulePolicy {
    pub fn run_on_startup(&self) -> bool {
        matches!(self, SchedulePolicy::FixedInterval { run_on_startup: true, .. })
    }

    pub fn describe(&self) -> String {
        match self {
            SchedulePolicy::DailyAtHour { hour, retry_delay } => format!(
                "daily at {:02}:00, retry after {}s",
                hour,
                retry_delay.as_secs()
            ),
            SchedulePolicy::FixedInterval { period, run_on_startup } => format!(
                "every {}s, run on startup: {}",
                period.as_secs(),
                run_on_startup
            ),
        }
    }

    /// Wall-clock time of the next regular run after `now`, or `None` when it
    /// is beyond the representable range.
    pub fn next_run<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        match self {
            SchedulePolicy::DailyAtHour { hour, .. } => Some(next_daily_run(now, *hour)),
            SchedulePolicy::FixedInterval { period, .. } => next_interval_run(now, *period),
        }
    }
}

/// Next occurrence of `hour:00:00.000` strictly after `now`.
///
/// Today's slot is used when `now` is still before it, otherwise tomorrow's.
pub fn next_daily_run<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> DateTime<Tz> {
    let slot = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(slot);
    let candidate = resolve_local(&now.timezone(), today);
    if *now < candidate {
        candidate
    } else {
        let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
        resolve_local(&now.timezone(), tomorrow)
    }
}

pub fn next_interval_run<Tz: TimeZone>(now: &DateTime<Tz>, period: Duration) -> Option<DateTime<Tz>> {
    let period = chrono::Duration::from_std(period).ok()?;
    now.clone().checked_add_signed(period)
}

// A wall-clock time skipped by a DST jump is pushed forward one hour.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            let shifted = naive + chrono::Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .unwrap_or_else(|| tz.from_utc_datetime(&naive))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    #[test]
    fn afternoon_rolls_over_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 14, 30, 0).unwrap();
        let next = next_daily_run(&now, 1);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 15, 1, 0, 0).unwrap());
        assert_eq!(next - now, chrono::Duration::minutes(630));
    }

    #[test]
    fn early_morning_stays_on_today() {
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 0, 15, 0).unwrap();
        assert_eq!(
            next_daily_run(&now, 1),
            Utc.with_ymd_and_hms(2024, 3, 14, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn exactly_on_the_hour_moves_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 1, 0, 0).unwrap();
        assert_eq!(
            next_daily_run(&now, 1),
            Utc.with_ymd_and_hms(2024, 3, 15, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn offset_does_not_change_the_distance() {
        let tz = FixedOffset::east_opt(9 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 12, 31, 14, 30, 0).unwrap();
        let next = next_daily_run(&now, 1);
        assert_eq!(next, tz.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap());
        assert_eq!(next - now, chrono::Duration::minutes(630));
    }

    #[test]
    fn interval_adds_the_period() {
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 14, 30, 0).unwrap();
        let next = next_interval_run(&now, Duration::from_secs(5 * 60)).unwrap();
        assert_eq!((next - now).num_milliseconds(), 300_000);
    }

    #[test]
    fn oversized_interval_has_no_next_run() {
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 14, 30, 0).unwrap();
        assert_eq!(next_interval_run(&now, Duration::from_secs(60_000_000_000_000)), None);
        assert_eq!(next_interval_run(&now, Duration::MAX), None);
    }

    #[test]
    fn startup_run_only_for_fixed_interval() {
        let daily = SchedulePolicy::DailyAtHour {
            hour: 1,
            retry_delay: Duration::from_secs(600),
        };
        let interval = SchedulePolicy::FixedInterval {
            period: Duration::from_secs(300),
            run_on_startup: true,
        };
        assert!(!daily.run_on_startup());
        assert!(interval.run_on_startup());
    }

    #[test]
    fn next_run_follows_the_policy() {
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 14, 30, 0).unwrap();
        let daily = SchedulePolicy::DailyAtHour {
            hour: 1,
            retry_delay: Duration::from_secs(600),
        };
        let interval = SchedulePolicy::FixedInterval {
            period: Duration::from_secs(300),
            run_on_startup: false,
        };
        assert_eq!(daily.next_run(&now), Utc.with_ymd_and_hms(2024, 3, 15, 1, 0, 0).single());
        assert_eq!(interval.next_run(&now), Utc.with_ymd_and_hms(2024, 3, 14, 14, 35, 0).single());
    }
}
