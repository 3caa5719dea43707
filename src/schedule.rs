use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Local, TimeZone};
use cron::Schedule;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static HH_MM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([01]\d|2[0-3]):([0-5]\d)$").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleParseError {
    #[error("schedule `{0}` is neither HH:MM nor a valid cron expression")]
    Invalid(String),
}

/// Tagged schedule: `HH:MM` means once daily at that local time, anything
/// else is handed to the cron parser unmodified.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    DailyAt { hour: u8, minute: u8 },
    Raw { expr: String, schedule: Box<Schedule> },
}

impl ScheduleSpec {
    pub fn parse(text: &str) -> Result<Self, ScheduleParseError> {
        let trimmed = text.trim();
        if let Some(caps) = HH_MM_RE.captures(trimmed) {
            let hour: u8 = caps[1].parse().unwrap();
            let minute: u8 = caps[2].parse().unwrap();
            return Ok(ScheduleSpec::DailyAt { hour, minute });
        }
        match Schedule::from_str(trimmed) {
            Ok(schedule) => Ok(ScheduleSpec::Raw {
                expr: trimmed.to_string(),
                schedule: Box::new(schedule),
            }),
            Err(_) => Err(ScheduleParseError::Invalid(trimmed.to_string())),
        }
    }

    /// Next fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        match self {
            ScheduleSpec::DailyAt { hour, minute } => {
                let mut date = now.date_naive();
                for _ in 0..3 {
                    if let Some(naive) =
                        date.and_hms_opt(u32::from(*hour), u32::from(*minute), 0)
                    {
                        if let Some(candidate) = Local.from_local_datetime(&naive).earliest() {
                            if candidate > now {
                                return Some(candidate);
                            }
                        }
                    }
                    // Today's slot has passed (or fell into a DST gap).
                    date += Duration::days(1);
                }
                None
            }
            ScheduleSpec::Raw { schedule, .. } => schedule.after(&now).next(),
        }
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::DailyAt { hour, minute } => write!(f, "{hour:02}:{minute:02}"),
            ScheduleSpec::Raw { expr, .. } => f.write_str(expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(y, mo, d)
                    .unwrap()
                    .and_hms_opt(h, mi, 0)
                    .unwrap(),
            )
            .earliest()
            .unwrap()
    }

    #[test]
    fn hh_mm_parses_as_daily() {
        match ScheduleSpec::parse("02:30").unwrap() {
            ScheduleSpec::DailyAt { hour, minute } => {
                assert_eq!((hour, minute), (2, 30));
            }
            other => panic!("expected DailyAt, got {other:?}"),
        }
    }

    #[test]
    fn cron_expression_passes_through() {
        match ScheduleSpec::parse("0 0 3 * * * *").unwrap() {
            ScheduleSpec::Raw { expr, .. } => assert_eq!(expr, "0 0 3 * * * *"),
            other => panic!("expected Raw, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(ScheduleSpec::parse("25:99").is_err());
        assert!(ScheduleSpec::parse("whenever").is_err());
    }

    #[test]
    fn daily_next_is_today_if_still_ahead() {
        let spec = ScheduleSpec::parse("14:00").unwrap();
        let now = local(2024, 6, 1, 9, 0);
        let next = spec.next_after(now).unwrap();
        assert_eq!(next, local(2024, 6, 1, 14, 0));
    }

    #[test]
    fn daily_next_rolls_to_tomorrow() {
        let spec = ScheduleSpec::parse("14:00").unwrap();
        let now = local(2024, 6, 1, 15, 0);
        let next = spec.next_after(now).unwrap();
        assert_eq!(next, local(2024, 6, 2, 14, 0));
    }

    proptest! {
        #[test]
        fn any_valid_clock_time_parses(hour in 0u8..24, minute in 0u8..60) {
            let text = format!("{hour:02}:{minute:02}");
            let spec = ScheduleSpec::parse(&text).unwrap();
            let ok = matches!(
                spec,
                ScheduleSpec::DailyAt { hour: h, minute: m } if h == hour && m == minute
            );
            prop_assert!(ok);
        }
    }
}
