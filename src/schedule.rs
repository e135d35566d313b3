//! Cron schedules for automated root rotation.
//!
//! Accepts the standard five-field form `minute hour day-of-month month
//! day-of-week` plus the `@hourly`/`@daily`/`@weekly`/`@monthly`/`@yearly`
//! shorthands, and evaluates it with the `cron` crate. Weekdays are numbered
//! from Sunday = 0 (7 is also Sunday) as in crontab. All times are UTC.

use crate::{AzSecretsError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::str::FromStr;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7 };

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    /// Six-field form handed to `cron`, with a zero seconds field.
    normalized: String,
    schedule: cron::Schedule,
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for CronSchedule {}

impl CronSchedule {
    /// Parses a cron expression.
    ///
    /// # Example
    ///
    /// ```
    /// use azsecrets::schedule::CronSchedule;
    ///
    /// assert!(CronSchedule::parse("0 2 * * SUN").is_ok());
    /// assert!(CronSchedule::parse("*/15 9-17 * * 1-5").is_ok());
    /// assert!(CronSchedule::parse("61 * * * *").is_err());
    /// ```
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let expanded = match expr {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(AzSecretsError::invalid(format!(
                "rotation_schedule: expected 5 fields, got {} in {:?}",
                fields.len(),
                expr
            )));
        }

        for (field, spec) in fields.iter().zip([&MINUTE, &HOUR, &DAY_OF_MONTH]) {
            check_numeric_field(field, spec)?;
        }
        let months = expand_named_field(fields[3], &MONTH, &MONTH_NAMES, 1, |m| m)?;
        // `cron` numbers weekdays from Sunday = 1.
        let weekdays = expand_named_field(fields[4], &DAY_OF_WEEK, &WEEKDAY_NAMES, 0, |d| d % 7 + 1)?;

        let normalized = format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], months, weekdays
        );
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            AzSecretsError::invalid(format!("rotation_schedule: invalid expression {:?}: {}", expr, e))
        })?;

        Ok(Self { normalized, schedule })
    }

    /// Returns the first instant strictly after `after` that matches.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

fn invalid_item(spec: &FieldSpec, item: &str) -> AzSecretsError {
    AzSecretsError::invalid(format!("rotation_schedule: invalid {} {:?}", spec.name, item))
}

/// Splits `item` into its range and step, rejecting steps outside `1..=max`.
fn split_step<'a>(item: &'a str, spec: &FieldSpec) -> Result<(&'a str, Option<u32>)> {
    match item.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step.parse().map_err(|_| invalid_item(spec, item))?;
            if step == 0 || step > spec.max {
                return Err(invalid_item(spec, item));
            }
            Ok((range, Some(step)))
        }
        None => Ok((item, None)),
    }
}

/// Minute, hour and day-of-month are passed through to `cron` after the
/// step and range-order checks it does not make.
fn check_numeric_field(field: &str, spec: &FieldSpec) -> Result<()> {
    for item in field.split(',') {
        let (range, _) = split_step(item, spec)?;
        if let Some((lo, hi)) = range.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                if lo > hi {
                    return Err(invalid_item(spec, item));
                }
            }
        }
    }
    Ok(())
}

/// Expands a month or weekday field into an explicit numeric list in
/// `cron`'s numbering, so names and the Sunday aliases never reach it.
fn expand_named_field(
    field: &str,
    spec: &FieldSpec,
    names: &[&str],
    names_offset: u32,
    to_cron: impl Fn(u32) -> u32,
) -> Result<String> {
    if field == "*" {
        return Ok(field.to_string());
    }

    let value = |text: &str| -> Option<u32> {
        let v = match text.parse::<u32>() {
            Ok(v) => v,
            Err(_) => {
                let upper = text.to_ascii_uppercase();
                names.iter().position(|n| *n == upper)? as u32 + names_offset
            }
        };
        (spec.min..=spec.max).contains(&v).then_some(v)
    };

    let mut set = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = split_step(item, spec)?;
        let (lo, hi) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (
                value(lo).ok_or_else(|| invalid_item(spec, item))?,
                value(hi).ok_or_else(|| invalid_item(spec, item))?,
            )
        } else {
            let v = value(range).ok_or_else(|| invalid_item(spec, item))?;
            // "5/15" runs from 5 to the end of the field
            if step.is_some() {
                (v, spec.max)
            } else {
                (v, v)
            }
        };
        if lo > hi {
            return Err(invalid_item(spec, item));
        }
        let step = step.unwrap_or(1) as usize;
        set.extend((lo..=hi).step_by(step).map(&to_cron));
    }

    Ok(set
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_daily_at_two() {
        let cron = CronSchedule::parse("0 2 * * *").unwrap();
        assert_eq!(
            cron.next_after(at("2024-03-10T01:15:00Z")),
            Some(at("2024-03-10T02:00:00Z"))
        );
        assert_eq!(
            cron.next_after(at("2024-03-10T02:00:00Z")),
            Some(at("2024-03-11T02:00:00Z"))
        );
    }

    #[test]
    fn test_steps_and_ranges() {
        let cron = CronSchedule::parse("*/15 9-17 * * 1-5").unwrap();
        // Saturday evening rolls over to Monday morning
        assert_eq!(
            cron.next_after(at("2024-03-09T18:00:00Z")),
            Some(at("2024-03-11T09:00:00Z"))
        );
        assert_eq!(
            cron.next_after(at("2024-03-11T09:07:30Z")),
            Some(at("2024-03-11T09:15:00Z"))
        );
    }

    #[test]
    fn test_names_and_sunday_alias() {
        let by_name = CronSchedule::parse("0 0 * JAN SUN").unwrap();
        let by_number = CronSchedule::parse("0 0 * 1 7").unwrap();
        let by_zero = CronSchedule::parse("0 0 * jan 0").unwrap();
        assert_eq!(by_name, by_number);
        assert_eq!(by_name, by_zero);

        // 2024-03-10 is a Sunday
        let sundays = CronSchedule::parse("0 6 * * 0").unwrap();
        assert_eq!(
            sundays.next_after(at("2024-03-08T00:00:00Z")),
            Some(at("2024-03-10T06:00:00Z"))
        );
    }

    #[test]
    fn test_shorthands() {
        assert_eq!(
            CronSchedule::parse("@daily").unwrap(),
            CronSchedule::parse("0 0 * * *").unwrap()
        );
        let monthly = CronSchedule::parse("@monthly").unwrap();
        assert_eq!(
            monthly.next_after(at("2024-01-31T12:00:00Z")),
            Some(at("2024-02-01T00:00:00Z"))
        );
    }

    #[test]
    fn test_day_of_month_and_day_of_week() {
        // Both fields must match: the next Friday the 13th
        let cron = CronSchedule::parse("0 0 13 * FRI").unwrap();
        assert_eq!(
            cron.next_after(at("2024-03-04T00:00:00Z")),
            Some(at("2024-09-13T00:00:00Z"))
        );
    }

    #[test]
    fn test_invalid_expressions() {
        for expr in [
            "",
            "* * * *",
            "60 * * * *",
            "* 24 * * *",
            "*/0 * * * *",
            "5-1 * * * *",
            "* * * FOO *",
            "1/4294967295 * * * *",
            "* * * */13 *",
            "* * * * 8",
        ] {
            assert!(CronSchedule::parse(expr).is_err(), "{:?} should be rejected", expr);
        }
    }

    #[test]
    fn test_impossible_date() {
        let cron = CronSchedule::parse("0 0 30 2 *").unwrap();
        assert_eq!(cron.next_after(at("2024-01-01T00:00:00Z")), None);
    }
}
