//! Timezone-correct conversions between civil wall-clock time and UTC
//! instants.
//!
//! All range and recurrence math in the domain is expressed through the two
//! primitives here (`to_instant` and `day_bounds`) so that offset handling
//! lives in exactly one place.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Resolve a civil (date, time) in a named zone to an absolute UTC instant.
///
/// During a DST fold the earlier of the two candidate instants wins; a
/// wall-clock time that does not exist (DST gap) is rejected as invalid
/// input.
pub fn to_instant(date: NaiveDate, time: NaiveTime, zone: Tz) -> Result<DateTime<Utc>> {
    let local = date.and_time(time);
    zone.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("Local time {} does not exist in zone {}", local, zone))
}

/// Project a UTC instant back onto the wall clock of a zone.
pub fn to_local(instant: DateTime<Utc>, zone: Tz) -> (NaiveDate, NaiveTime) {
    let local = instant.with_timezone(&zone);
    (local.date_naive(), local.time())
}

/// Start-of-day and end-of-day (23:59:59.999) of a civil date in a zone,
/// as UTC instants.
pub fn day_bounds(date: NaiveDate, zone: Tz) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start_time = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
    let end_time = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap();
    let start = to_instant(date, start_time, zone)?;
    let end = to_instant(date, end_time, zone)?;
    Ok((start, end))
}
