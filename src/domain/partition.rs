//! Time periods and partition bounds.
//!
//! Everything here is pure: truncation, period stepping and partition naming
//! never touch the database.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    Day,
    /// ISO week, starting Monday 00:00 UTC
    Week,
    Month,
}

impl PeriodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    /// Start of the period containing `ts`
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let date = ts.date_naive();
        let start = match self {
            Self::Day => date,
            Self::Week => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
            Self::Month => date - Duration::days(i64::from(date.day0())),
        };
        midnight(start)
    }

    /// Start of the period following the one that contains `ts`
    pub fn next_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.truncate(ts);
        match self {
            Self::Day => start + Duration::days(1),
            Self::Week => start + Duration::days(7),
            // 32 days past the 1st always lands inside the next month
            Self::Month => self.truncate(start + Duration::days(32)),
        }
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// `ts - span`, clamped to the earliest representable instant
pub fn saturating_sub(ts: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    ts.checked_sub_signed(span)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `ts + span`, clamped to the latest representable instant
pub fn saturating_add(ts: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    ts.checked_add_signed(span)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown period string
#[derive(Debug, Clone, Error)]
#[error("unknown period kind: {0} (expected day, week or month)")]
pub struct ParsePeriodError(pub String);

impl FromStr for PeriodKind {
    type Err = ParsePeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(Self::Day),
            "week" | "weekly" => Ok(Self::Week),
            "month" | "monthly" => Ok(Self::Month),
            other => Err(ParsePeriodError(other.to_string())),
        }
    }
}

impl ToSql for PeriodKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PeriodKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Half-open interval `[start, end)` covered by one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PartitionBounds {
    /// Bounds of the `kind` period containing `ts`
    pub fn containing(ts: DateTime<Utc>, kind: PeriodKind) -> Self {
        Self {
            start: kind.truncate(ts),
            end: kind.next_start(ts),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn overlaps(&self, other: &PartitionBounds) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Deterministic physical name for the partition of `table` starting at `period_start`
pub fn partition_name(table: &str, period_start: DateTime<Utc>) -> String {
    format!("{}_p{}", table, period_start.format("%Y%m%d"))
}

/// A registered partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub parent_table: String,
    pub name: String,
    pub period: PeriodKind,
    pub bounds: PartitionBounds,
    pub created_at: DateTime<Utc>,
}

/// Result of an idempotent create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    Created,
    AlreadyExists,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 17, 42).unwrap()
    }

    #[test]
    fn test_truncate_day() {
        let start = PeriodKind::Day.truncate(at(2026, 10, 18, 15));
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_truncate_week_starts_monday() {
        // 2026-10-18 is a Sunday
        let start = PeriodKind::Week.truncate(at(2026, 10, 18, 23));
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap());

        let monday = PeriodKind::Week.truncate(at(2026, 10, 12, 0));
        assert_eq!(monday, start);
    }

    #[test]
    fn test_month_stepping_handles_short_months_and_year_end() {
        let feb = PeriodKind::Month.next_start(at(2026, 1, 31, 12));
        assert_eq!(feb, Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());

        let mar = PeriodKind::Month.next_start(at(2026, 2, 14, 0));
        assert_eq!(mar, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());

        let jan = PeriodKind::Month.next_start(at(2026, 12, 31, 23));
        assert_eq!(jan, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_bounds_are_half_open() {
        let bounds = PartitionBounds::containing(at(2026, 10, 18, 9), PeriodKind::Day);
        assert!(bounds.contains(bounds.start));
        assert!(!bounds.contains(bounds.end));

        let next = PartitionBounds::containing(bounds.end, PeriodKind::Day);
        assert!(!bounds.overlaps(&next));
        assert_eq!(bounds.end, next.start);
    }

    #[test]
    fn test_partition_name_is_stable() {
        let start = PeriodKind::Month.truncate(at(2026, 10, 18, 9));
        assert_eq!(partition_name("calls", start), "calls_p20261001");
        assert_eq!(partition_name("calls", start), partition_name("calls", start));
    }

    #[test]
    fn test_period_parsing() {
        assert_eq!("monthly".parse::<PeriodKind>().unwrap(), PeriodKind::Month);
        assert_eq!("Day".parse::<PeriodKind>().unwrap(), PeriodKind::Day);
        assert!("hour".parse::<PeriodKind>().is_err());
    }
}
