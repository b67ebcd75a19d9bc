//! Parsing of size and time rule values.

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time};

/// Split `"1.5 MiB"` into `("1.5", "mib")`.
fn split_number(value: &str) -> Option<(&str, String)> {
    let value = value.trim();
    let split = value.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    (!number.is_empty()).then(|| (number, unit.trim().to_ascii_lowercase()))
}

/// Parse a byte count such as `512`, `100K`, `1.5MB` or `2GiB`.
///
/// Plain unit letters are decimal (`1K` is 1000 bytes); the `iB` forms are
/// binary (`1KiB` is 1024 bytes). Case is ignored.
pub(crate) fn parse_size(value: &str) -> Option<u64> {
    let (number, unit) = split_number(value)?;
    let unit = unit.strip_suffix('b').unwrap_or(&unit);
    let (prefix, binary) = match unit.strip_suffix('i') {
        Some(prefix) => (prefix, true),
        None => (unit, false),
    };
    let exponent = match prefix {
        "" if binary => return None,
        "" => 0,
        "k" => 1,
        "m" => 2,
        "g" => 3,
        "t" => 4,
        "p" => 5,
        _ => return None,
    };
    let base: u64 = if binary { 1024 } else { 1000 };
    let multiplier = base.checked_pow(exponent)?;

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier);
    }
    let fractional: f64 = number.parse().ok()?;
    let bytes = (fractional * multiplier as f64).round();
    (bytes.is_finite() && bytes >= 0.0 && bytes <= u64::MAX as f64).then_some(bytes as u64)
}

/// Resolve a point in time relative to `now`.
///
/// Accepted forms, all interpreted in UTC unless an offset is given:
/// RFC 3339, `YYYY-MM-DD`, `YYYY-MM-DD HH:MM[:SS]`, `@<unix seconds>`,
/// `now`, `today`, `yesterday`, and ages like `3d`, `90min` or `2 weeks ago`.
pub(crate) fn parse_time(value: &str, now: OffsetDateTime) -> Option<OffsetDateTime> {
    let trimmed = value.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "now" => return Some(now),
        "today" => return Some(now.replace_time(Time::MIDNIGHT)),
        "yesterday" => return Some(now.replace_time(Time::MIDNIGHT) - Duration::DAY),
        _ => {},
    }
    if let Some(seconds) = trimmed.strip_prefix('@') {
        return OffsetDateTime::from_unix_timestamp(seconds.parse().ok()?).ok();
    }
    if let Ok(at) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Some(at);
    }
    if let Ok(date) = Date::parse(trimmed, format_description!("[year]-[month]-[day]")) {
        return Some(date.midnight().assume_utc());
    }
    let with_seconds = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let without_seconds = format_description!("[year]-[month]-[day] [hour]:[minute]");
    if let Ok(at) =
        PrimitiveDateTime::parse(trimmed, with_seconds).or_else(|_| PrimitiveDateTime::parse(trimmed, without_seconds))
    {
        return Some(at.assume_utc());
    }
    parse_age(trimmed).and_then(|age| now.checked_sub(age))
}

fn parse_age(value: &str) -> Option<Duration> {
    let (number, unit) = split_number(value)?;
    let amount: f64 = number.parse().ok()?;
    let unit = unit.strip_suffix("ago").unwrap_or(&unit).trim_end();
    let unit = match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Duration::SECOND,
        "m" | "min" | "mins" | "minute" | "minutes" => Duration::MINUTE,
        "h" | "hr" | "hrs" | "hour" | "hours" => Duration::HOUR,
        "d" | "day" | "days" => Duration::DAY,
        "w" | "week" | "weeks" => Duration::WEEK,
        "mo" | "month" | "months" => Duration::days(30),
        "y" | "year" | "years" => Duration::days(365),
        _ => return None,
    };
    Duration::checked_seconds_f64(unit.as_seconds_f64() * amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-03-15 13:45:30 UTC);

    #[rstest]
    #[case("0", Some(0))]
    #[case("512", Some(512))]
    #[case("512B", Some(512))]
    #[case("100K", Some(100_000))]
    #[case("100kb", Some(100_000))]
    #[case("1.5M", Some(1_500_000))]
    #[case("2G", Some(2_000_000_000))]
    #[case("1T", Some(1_000_000_000_000))]
    #[case("1KiB", Some(1024))]
    #[case("4 MiB", Some(4 * 1024 * 1024))]
    #[case("0.5gib", Some(512 * 1024 * 1024))]
    #[case(" 7 ", Some(7))]
    #[case("", None)]
    #[case("ten", None)]
    #[case("-5", None)]
    #[case("5X", None)]
    #[case("5iB", None)]
    #[case("99999999999999999999P", None)]
    fn test_parse_size(#[case] input: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_size(input), expected);
    }

    #[rstest]
    #[case("now", Some(NOW))]
    #[case("today", Some(datetime!(2024-03-15 0:00 UTC)))]
    #[case("Yesterday", Some(datetime!(2024-03-14 0:00 UTC)))]
    #[case("2023-01-02", Some(datetime!(2023-01-02 0:00 UTC)))]
    #[case("2023-01-02 03:04", Some(datetime!(2023-01-02 3:04 UTC)))]
    #[case("2023-01-02 03:04:05", Some(datetime!(2023-01-02 3:04:05 UTC)))]
    #[case("2023-01-02T03:04:05+02:00", Some(datetime!(2023-01-02 3:04:05 +2)))]
    #[case("@0", Some(OffsetDateTime::UNIX_EPOCH))]
    #[case("@1700000000", Some(datetime!(2023-11-14 22:13:20 UTC)))]
    #[case("3d", Some(datetime!(2024-03-12 13:45:30 UTC)))]
    #[case("12h", Some(datetime!(2024-03-15 1:45:30 UTC)))]
    #[case("90min", Some(datetime!(2024-03-15 12:15:30 UTC)))]
    #[case("2 weeks ago", Some(datetime!(2024-03-01 13:45:30 UTC)))]
    #[case("1.5 days", Some(datetime!(2024-03-14 1:45:30 UTC)))]
    #[case("2023-13-01", None)]
    #[case("last tuesday", None)]
    #[case("5 fortnights", None)]
    #[case("@soon", None)]
    fn test_parse_time(#[case] input: &str, #[case] expected: Option<OffsetDateTime>) {
        assert_eq!(parse_time(input, NOW), expected);
    }
}
