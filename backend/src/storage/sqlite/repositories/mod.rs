//! Repository implementations over the sqlite connection.
//!
//! Instants persist as RFC 3339 UTC strings with fixed millisecond
//! precision, so lexicographic order on the column equals chronological
//! order.

pub mod identity_repository;
pub mod ledger_repository;
pub mod lesson_repository;
pub mod notification_repository;
pub mod teacher_repository;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

pub(crate) fn fmt_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| anyhow!("Invalid stored instant '{}': {}", raw, e))
}

pub(crate) fn parse_instant_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_instant(&s)).transpose()
}

pub(crate) fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| anyhow!("Invalid stored date '{}': {}", raw, e))
}

/// Weekday sets persist as comma-separated digits ("1,3").
pub(crate) fn fmt_weekdays(weekdays: &[u8]) -> String {
    weekdays
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn parse_weekdays(raw: &str) -> Vec<u8> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}
