//! Small utilities shared by the HMQ crates: millisecond timestamps,
//! duration parsing for configuration values, and a current/max counter.

#![deny(unsafe_code)]

use std::time::Duration;

use serde::{de, Deserialize, Deserializer};

mod counter;

pub use counter::Counter;

pub type TimestampMillis = i64;

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    chrono::Local::now().timestamp_millis()
}

#[inline]
pub fn timestamp_secs() -> i64 {
    chrono::Local::now().timestamp()
}

#[inline]
pub fn format_timestamp_now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Parses durations like `1h30m15s`, `500ms`, `30s` or a bare number of
/// seconds.
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_ascii_lowercase();
    if text.is_empty() {
        return Duration::ZERO;
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Duration::from_secs(secs);
    }

    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num.push(c);
            continue;
        }
        let value: u64 = num.parse().unwrap_or(0);
        num.clear();
        match c {
            'h' => total += Duration::from_secs(value * 3600),
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    total += Duration::from_millis(value);
                } else {
                    total += Duration::from_secs(value * 60);
                }
            }
            's' => total += Duration::from_secs(value),
            _ => {}
        }
    }
    total
}

/// Serde helper deserializing a duration from a string value.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Serde helper serializing a duration back to the string form accepted by
/// [`to_duration`].
pub fn serialize_duration<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let millis = d.as_millis();
    if millis % 1000 == 0 {
        serializer.serialize_str(&format!("{}s", millis / 1000))
    } else {
        serializer.serialize_str(&format!("{millis}ms"))
    }
}

/// Serde helper for optional durations; empty string means none.
pub fn deserialize_duration_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    if v.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(to_duration(&v)))
    }
}

/// Serde helper rejecting zero durations.
pub fn deserialize_duration_nonzero<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let d = deserialize_duration(deserializer)?;
    if d.is_zero() {
        Err(de::Error::custom("duration must be non-zero"))
    } else {
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse() {
        assert_eq!(to_duration("1h30m15s"), Duration::from_secs(5415));
        assert_eq!(to_duration("500ms"), Duration::from_millis(500));
        assert_eq!(to_duration("30"), Duration::from_secs(30));
        assert_eq!(to_duration(""), Duration::ZERO);
        assert_eq!(to_duration("2m"), Duration::from_secs(120));
    }

    #[test]
    fn timestamps_are_monotonic_enough() {
        let a = timestamp_millis();
        let b = timestamp_millis();
        assert!(b >= a);
    }
}
