use chrono::{DateTime, NaiveDate};

/// Format used for day-shard directory names.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// UTC calendar date of a millisecond Unix timestamp.
pub fn utc_day(timestamp_millis: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(timestamp_millis).map(|dt| dt.date_naive())
}

/// Directory name for the day containing `timestamp_millis`.
pub fn day_key(timestamp_millis: i64) -> Option<String> {
    utc_day(timestamp_millis).map(|d| d.format(DAY_FORMAT).to_string())
}

/// Whether a directory name looks like a day-shard directory (`YYYY-MM-DD`).
pub fn is_day_key(name: &str) -> bool {
    name.len() == 10 && NaiveDate::parse_from_str(name, DAY_FORMAT).is_ok()
}
