//! Cron and interval evaluation.
//!
//! Cron expressions are evaluated in the schedule's IANA timezone and the
//! result is converted to UTC for storage, so "every day at 09:00
//! Europe/Berlin" follows daylight-saving changes.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use courier_core::models::{JobState, Schedule};
use croner::Cron;

use crate::error::{DeliveryError, Result};

/// Whether a scheduled job should run on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTiming {
    /// Run now.
    Due,
    /// Not yet due.
    NotYet,
    /// Cron job with no stored `next_run`: compute it without running.
    Initialize,
}

fn parse_timezone(name: &str) -> Result<Tz> {
    Tz::from_str(name)
        .map_err(|e| DeliveryError::configuration(format!("invalid timezone {name:?}: {e}")))
}

fn parse_cron(expression: &str) -> Result<Cron> {
    Cron::from_str(expression).map_err(|e| {
        DeliveryError::configuration(format!("invalid cron expression {expression:?}: {e}"))
    })
}

/// Checks that a schedule can be evaluated.
///
/// # Errors
///
/// Returns `ConfigurationError` for an unparsable cron expression, an
/// unknown timezone or a zero interval.
pub fn validate(schedule: &Schedule) -> Result<()> {
    match schedule {
        Schedule::Cron { expression, timezone } => {
            parse_timezone(timezone)?;
            parse_cron(expression)?;
            Ok(())
        },
        Schedule::Interval { seconds: 0 } => {
            Err(DeliveryError::configuration("interval must be at least one second"))
        },
        Schedule::Interval { .. } => Ok(()),
    }
}

/// First fire time strictly after `after`.
///
/// # Errors
///
/// Returns `ConfigurationError` if the schedule is invalid or has no future
/// occurrence.
pub fn next_occurrence(schedule: &Schedule, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match schedule {
        Schedule::Cron { expression, timezone } => {
            let tz = parse_timezone(timezone)?;
            let cron = parse_cron(expression)?;
            let local = after.with_timezone(&tz);

            let next = cron.find_next_occurrence(&local, false).map_err(|e| {
                DeliveryError::configuration(format!(
                    "no next occurrence for {expression:?} after {after}: {e}"
                ))
            })?;

            Ok(next.with_timezone(&Utc))
        },
        Schedule::Interval { seconds } => {
            if *seconds == 0 {
                return Err(DeliveryError::configuration("interval must be at least one second"));
            }
            let seconds = i64::try_from(*seconds)
                .map_err(|_| DeliveryError::configuration("interval out of range"))?;
            Ok(after + Duration::seconds(seconds))
        },
    }
}

/// Decides whether a job runs at `now` given its persisted state.
///
/// Cron jobs run once their stored `next_run` has passed. Interval jobs run
/// when no previous run exists or the interval since `last_run` elapsed.
pub fn job_timing(schedule: &Schedule, state: &JobState, now: DateTime<Utc>) -> JobTiming {
    match schedule {
        Schedule::Cron { .. } => match state.next_run {
            None => JobTiming::Initialize,
            Some(next_run) if next_run <= now => JobTiming::Due,
            Some(_) => JobTiming::NotYet,
        },
        Schedule::Interval { seconds } => {
            let interval = Duration::seconds(i64::try_from(*seconds).unwrap_or(i64::MAX / 1000));
            match state.last_run {
                None => JobTiming::Due,
                Some(last_run) if last_run + interval <= now => JobTiming::Due,
                Some(_) => JobTiming::NotYet,
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn cron(expression: &str, timezone: &str) -> Schedule {
        Schedule::Cron { expression: expression.to_string(), timezone: timezone.to_string() }
    }

    #[test]
    fn hourly_cron_fires_on_the_hour() {
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap();

        let next = next_occurrence(&cron("0 * * * *", "UTC"), after).unwrap();

        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn occurrence_is_strictly_after() {
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();

        let next = next_occurrence(&cron("0 * * * *", "UTC"), after).unwrap();

        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn cron_is_evaluated_in_route_timezone() {
        // 09:00 in Berlin is 07:00 UTC during summer time.
        let after = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();

        let next = next_occurrence(&cron("0 9 * * *", "Europe/Berlin"), after).unwrap();

        assert_eq!(next, Utc.with_ymd_and_hms(2024, 7, 1, 7, 0, 0).unwrap());
    }

    #[test]
    fn interval_adds_seconds() {
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        let next = next_occurrence(&Schedule::Interval { seconds: 900 }, after).unwrap();

        assert_eq!(next, after + Duration::minutes(15));
    }

    #[test]
    fn invalid_schedules_are_configuration_errors() {
        assert!(matches!(
            validate(&cron("not a cron", "UTC")),
            Err(DeliveryError::ConfigurationError { .. })
        ));
        assert!(validate(&cron("0 * * * *", "Mars/Olympus")).is_err());
        assert!(validate(&Schedule::Interval { seconds: 0 }).is_err());
        assert!(validate(&cron("*/5 * * * *", "America/New_York")).is_ok());
    }

    #[test]
    fn cron_timing_follows_next_run() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let schedule = cron("0 * * * *", "UTC");

        assert_eq!(job_timing(&schedule, &JobState::default(), now), JobTiming::Initialize);
        let due = JobState { last_run: None, next_run: Some(now) };
        assert_eq!(job_timing(&schedule, &due, now), JobTiming::Due);
        let later = JobState { last_run: None, next_run: Some(now + Duration::minutes(1)) };
        assert_eq!(job_timing(&schedule, &later, now), JobTiming::NotYet);
    }

    #[test]
    fn interval_timing_follows_last_run() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let schedule = Schedule::Interval { seconds: 600 };

        assert_eq!(job_timing(&schedule, &JobState::default(), now), JobTiming::Due);
        let recent = JobState { last_run: Some(now - Duration::minutes(5)), next_run: None };
        assert_eq!(job_timing(&schedule, &recent, now), JobTiming::NotYet);
        let stale = JobState { last_run: Some(now - Duration::minutes(10)), next_run: None };
        assert_eq!(job_timing(&schedule, &stale, now), JobTiming::Due);
    }
}
