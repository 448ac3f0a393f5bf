//! Five-field cron expressions: minute, hour, day-of-month, month,
//! day-of-week (0 = Sunday).
//!
//! Supported operators per field: `*`, `a`, `a-b`, `a,b`, `*/n`, and
//! `a/n`. A `*/n` step matches every n-th value starting at the field
//! minimum, whether or not n divides the field range.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike};
use thiserror::Error;

/// Search horizon for the next matching minute (one leap year).
const MAX_SCAN_MINUTES: u32 = 366 * 24 * 60;

/// Cron parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    /// Expression does not have exactly five fields.
    #[error("expected 5 cron fields, got {0}")]
    FieldCount(usize),
    /// A field contains an unsupported token.
    #[error("invalid cron field '{field}': {reason}")]
    InvalidField {
        /// Offending field text.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A value is outside its field's range.
    #[error("value {value} out of range {min}-{max}")]
    OutOfRange {
        /// Offending value.
        value: u32,
        /// Field minimum.
        min: u32,
        /// Field maximum.
        max: u32,
    },
    /// No matching time within the search horizon.
    #[error("no matching time within a year of {0}")]
    NoMatch(String),
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days: Vec<u32>,
    months: Vec<u32>,
    weekdays: Vec<u32>,
}

impl CronExpr {
    /// Parse a five-field expression.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }
        Ok(Self {
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            days: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            weekdays: parse_field(fields[4], 0, 6)?,
        })
    }

    /// True when the instant matches all five fields.
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.minutes.contains(&at.minute())
            && self.hours.contains(&at.hour())
            && self.days.contains(&at.day())
            && self.months.contains(&at.month())
            && self.weekdays.contains(&at.weekday().num_days_from_sunday())
    }

    /// First matching instant strictly after `after`, scanning minute by
    /// minute up to a year out.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Result<DateTime<Tz>, CronError>
    where
        DateTime<Tz>: std::fmt::Display,
    {
        let mut at = after
            .clone()
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or_else(|| after.clone())
            + Duration::minutes(1);
        for _ in 0..MAX_SCAN_MINUTES {
            if self.matches(&at) {
                return Ok(at);
            }
            at += Duration::minutes(1);
        }
        Err(CronError::NoMatch(after.to_string()))
    }
}

/// Parse one field into its sorted set of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>, CronError> {
    let mut values = std::collections::BTreeSet::new();
    for part in field.split(',') {
        if part.is_empty() {
            return Err(CronError::InvalidField {
                field: field.to_owned(),
                reason: "empty list element".to_owned(),
            });
        }
        if part == "*" {
            values.extend(min..=max);
            continue;
        }
        if let Some((base, step)) = part.split_once('/') {
            let step: u32 = step.parse().map_err(|_| CronError::InvalidField {
                field: field.to_owned(),
                reason: format!("bad step '{step}'"),
            })?;
            if step == 0 {
                return Err(CronError::InvalidField {
                    field: field.to_owned(),
                    reason: "step of zero".to_owned(),
                });
            }
            let start = if base == "*" {
                min
            } else {
                parse_value(base, field, min, max)?
            };
            let mut v = start;
            while v <= max {
                values.insert(v);
                v += step;
            }
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo = parse_value(lo, field, min, max)?;
            let hi = parse_value(hi, field, min, max)?;
            if lo > hi {
                return Err(CronError::InvalidField {
                    field: field.to_owned(),
                    reason: format!("descending range {lo}-{hi}"),
                });
            }
            values.extend(lo..=hi);
            continue;
        }
        values.insert(parse_value(part, field, min, max)?);
    }
    Ok(values.into_iter().collect())
}

fn parse_value(text: &str, field: &str, min: u32, max: u32) -> Result<u32, CronError> {
    let value: u32 = text.trim().parse().map_err(|_| CronError::InvalidField {
        field: field.to_owned(),
        reason: format!("not a number: '{text}'"),
    })?;
    if value < min || value > max {
        return Err(CronError::OutOfRange { value, min, max });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(spec: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(spec)
            .expect("valid time")
            .with_timezone(&Utc)
    }

    #[test]
    fn test_parse_wildcard() {
        let expr = CronExpr::parse("* * * * *").expect("parse");
        assert!(expr.matches(&at("2026-08-01T09:30:00Z")));
    }

    #[test]
    fn test_parse_exact() {
        let expr = CronExpr::parse("0 9 * * 1").expect("parse");
        // 2026-08-03 is a Monday.
        assert!(expr.matches(&at("2026-08-03T09:00:00Z")));
        assert!(!expr.matches(&at("2026-08-03T09:01:00Z")));
        // Tuesday does not match weekday 1.
        assert!(!expr.matches(&at("2026-08-04T09:00:00Z")));
    }

    #[test]
    fn test_sunday_is_zero() {
        let expr = CronExpr::parse("0 9 * * 0").expect("parse");
        // 2026-08-02 is a Sunday.
        assert!(expr.matches(&at("2026-08-02T09:00:00Z")));
    }

    #[test]
    fn test_step_from_field_minimum() {
        // 7 does not divide 60: matches 0, 7, 14, ..., 56.
        let expr = CronExpr::parse("*/7 * * * *").expect("parse");
        for minute in [0u32, 7, 14, 21, 28, 35, 42, 49, 56] {
            assert!(
                expr.matches(&at(&format!("2026-08-01T10:{minute:02}:00Z"))),
                "minute {minute}"
            );
        }
        assert!(!expr.matches(&at("2026-08-01T10:58:00Z")));
        assert!(!expr.matches(&at("2026-08-01T10:59:00Z")));
    }

    #[test]
    fn test_step_with_base() {
        let expr = CronExpr::parse("5/15 * * * *").expect("parse");
        for minute in [5u32, 20, 35, 50] {
            assert!(expr.matches(&at(&format!("2026-08-01T10:{minute:02}:00Z"))));
        }
        assert!(!expr.matches(&at("2026-08-01T10:00:00Z")));
    }

    #[test]
    fn test_ranges_and_lists() {
        let expr = CronExpr::parse("0 9-11,14 * * 1-5").expect("parse");
        assert!(expr.matches(&at("2026-08-03T10:00:00Z")));
        assert!(expr.matches(&at("2026-08-03T14:00:00Z")));
        assert!(!expr.matches(&at("2026-08-03T13:00:00Z")));
        // Saturday excluded by 1-5.
        assert!(!expr.matches(&at("2026-08-08T10:00:00Z")));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            CronExpr::parse("* * * *").expect_err("four fields"),
            CronError::FieldCount(4)
        );
        assert!(matches!(
            CronExpr::parse("61 * * * *").expect_err("out of range"),
            CronError::OutOfRange { value: 61, .. }
        ));
        assert!(matches!(
            CronExpr::parse("*/0 * * * *").expect_err("zero step"),
            CronError::InvalidField { .. }
        ));
        assert!(matches!(
            CronExpr::parse("a * * * *").expect_err("not a number"),
            CronError::InvalidField { .. }
        ));
        assert!(matches!(
            CronExpr::parse("9-5 * * * *").expect_err("descending"),
            CronError::InvalidField { .. }
        ));
    }

    #[test]
    fn test_next_after() {
        let expr = CronExpr::parse("0 9 * * *").expect("parse");
        let next = expr.next_after(&at("2026-08-01T10:00:00Z")).expect("next");
        assert_eq!(next, at("2026-08-02T09:00:00Z"));
        // From just before: same day.
        let next = expr.next_after(&at("2026-08-01T08:59:00Z")).expect("next");
        assert_eq!(next, at("2026-08-01T09:00:00Z"));
        // Strictly after: an exact hit advances a full day.
        let next = expr.next_after(&at("2026-08-01T09:00:00Z")).expect("next");
        assert_eq!(next, at("2026-08-02T09:00:00Z"));
    }

    #[test]
    fn test_next_after_weekly() {
        let expr = CronExpr::parse("0 9 * * 1").expect("parse");
        let next = expr.next_after(&at("2026-08-01T00:00:00Z")).expect("next");
        // First Monday after Aug 1, 2026 is Aug 3.
        assert_eq!(next, at("2026-08-03T09:00:00Z"));
    }
}
