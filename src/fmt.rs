//! Provides formatting and parsing helpers for durations and byte sizes.
//!
//! The parsers are used to read human friendly values like `100m` or `10s` from the
//! [config](crate::config), the formatters are used when logging or reporting statistics.
use std::fmt::Write;
use std::time::Duration;

use anyhow::Context;

/// Formats a duration given in microseconds into the given writer.
///
/// The unit (ranging from microseconds to seconds) is chosen so that the output stays short.
/// [format_short_duration](format_short_duration) wraps this and returns a String.
pub fn format_micros(micros: u64, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    if micros < 1_000 {
        return write!(f, "{} us", micros);
    }

    let (value, unit) = if micros < 1_000_000 {
        (micros as f64 / 1_000., "ms")
    } else {
        (micros as f64 / 1_000_000., "s")
    };

    write_with_precision(value, unit, f)
}

/// Formats the given duration using the most concise unit.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use hnproxy::fmt::format_short_duration;
/// assert_eq!(format_short_duration(Duration::from_micros(100)), "100 us");
/// assert_eq!(format_short_duration(Duration::from_micros(8_192)), "8.19 ms");
/// assert_eq!(format_short_duration(Duration::from_micros(32_768)), "32.8 ms");
/// assert_eq!(format_short_duration(Duration::from_micros(128_123)), "128 ms");
/// assert_eq!(format_short_duration(Duration::from_micros(1_128_123)), "1.13 s");
/// assert_eq!(format_short_duration(Duration::from_secs(101)), "101 s");
/// ```
pub fn format_short_duration(duration: Duration) -> String {
    let mut result = String::new();
    let _ = format_micros(duration.as_micros() as u64, &mut result);
    result
}

fn write_with_precision(value: f64, unit: &str, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    if value < 10. {
        write!(f, "{:.2} {}", value, unit)
    } else if value < 100. {
        write!(f, "{:.1} {}", value, unit)
    } else {
        write!(f, "{:.0} {}", value, unit)
    }
}

const SIZE_UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

/// Formats a given size in bytes.
///
/// Sizes below one KiB are reported in bytes, everything else uses the largest binary unit
/// which keeps the number above one.
///
/// # Examples
///
/// ```
/// # use hnproxy::fmt::format_size;
/// assert_eq!(format_size(0), "0 bytes");
/// assert_eq!(format_size(1), "1 byte");
/// assert_eq!(format_size(256), "256 bytes");
/// assert_eq!(format_size(8_734), "8.53 KiB");
/// assert_eq!(format_size(873_400), "853 KiB");
/// assert_eq!(format_size(100 * 1024 * 1024), "100 MiB");
/// assert_eq!(format_size(8_734_000_000), "8.13 GiB");
/// ```
pub fn format_size(size_in_bytes: i64) -> String {
    match size_in_bytes {
        1 => "1 byte".to_owned(),
        size if size < 1024 => format!("{} bytes", size),
        size => {
            let mut value = size as f64 / 1024.;
            let mut unit = 0;
            while value >= 1024. && unit < SIZE_UNITS.len() - 1 {
                value /= 1024.;
                unit += 1;
            }

            let mut result = String::new();
            let _ = write_with_precision(value, SIZE_UNITS[unit], &mut result);
            result
        }
    }
}

lazy_static::lazy_static! {
    static ref SIZE_EXPRESSION: regex::Regex =
        regex::Regex::new(r"^\s*(\d+)\s*([bBkKmMgG]?)\s*$").unwrap();
    static ref DURATION_EXPRESSION: regex::Regex =
        regex::Regex::new(r"^\s*(\d+)\s*(ms|s|m|h|MS|S|M|H)?\s*$").unwrap();
}

/// Parses a size in bytes from a given string.
///
/// The value may carry one of the following suffixes:
/// * **b** or **B**: the value is given in bytes (which is also the default)
/// * **k** or **K**: the value is given in KiB
/// * **m** or **M**: the value is given in MiB
/// * **g** or **G**: the value is given in GiB
///
/// # Examples
///
/// ```
/// # use hnproxy::fmt::parse_size;
/// assert_eq!(parse_size("256").unwrap(), 256);
/// assert_eq!(parse_size("50k").unwrap(), 50 * 1024);
/// assert_eq!(parse_size("100 M").unwrap(), 100 * 1024 * 1024);
///
/// assert_eq!(parse_size("1.5g").is_err(), true);
/// assert_eq!(parse_size("-1").is_err(), true);
/// assert_eq!(parse_size("12 apples").is_err(), true);
/// ```
pub fn parse_size(value: impl AsRef<str>) -> anyhow::Result<i64> {
    let value = value.as_ref();
    let captures = SIZE_EXPRESSION.captures(value).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a size. Expected a positive number and optionally 'b', 'k', 'm' or 'g' as suffix.",
            value
        )
    })?;

    let number = captures[1]
        .parse::<i64>()
        .with_context(|| format!("Size '{}' is out of range.", value))?;
    let factor = match &captures[2] {
        "k" | "K" => 1024,
        "m" | "M" => 1024 * 1024,
        "g" | "G" => 1024 * 1024 * 1024,
        _ => 1,
    };

    number
        .checked_mul(factor)
        .ok_or_else(|| anyhow::anyhow!("Size '{}' is out of range.", value))
}

/// Parses a duration from a given string.
///
/// The value may carry one of the following suffixes:
/// * **ms**: the value is given in milliseconds (which is also the default)
/// * **s**: the value is given in seconds
/// * **m**: the value is given in minutes
/// * **h**: the value is given in hours
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use hnproxy::fmt::parse_duration;
/// assert_eq!(parse_duration("500").unwrap(), Duration::from_millis(500));
/// assert_eq!(parse_duration("250 ms").unwrap(), Duration::from_millis(250));
/// assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
/// assert_eq!(parse_duration("6 M").unwrap(), Duration::from_secs(360));
/// assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
///
/// assert_eq!(parse_duration("2.5s").is_err(), true);
/// assert_eq!(parse_duration("3 days").is_err(), true);
/// ```
pub fn parse_duration(value: impl AsRef<str>) -> anyhow::Result<Duration> {
    let value = value.as_ref();
    let captures = DURATION_EXPRESSION.captures(value).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a duration. Expected a positive number and optionally 'ms', 's', 'm' or 'h' as suffix.",
            value
        )
    })?;

    let number = captures[1]
        .parse::<u64>()
        .with_context(|| format!("Duration '{}' is out of range.", value))?;

    Ok(match captures.get(2).map(|unit| unit.as_str()) {
        Some("s") | Some("S") => Duration::from_secs(number),
        Some("m") | Some("M") => Duration::from_secs(number.saturating_mul(60)),
        Some("h") | Some("H") => Duration::from_secs(number.saturating_mul(60 * 60)),
        _ => Duration::from_millis(number),
    })
}

/// Formats a longer duration like "1d 3h 17m 2s".
///
/// Milliseconds are only reported for durations below one minute.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use hnproxy::fmt::format_duration;
/// assert_eq!(format_duration(Duration::from_millis(0)), "0ms");
/// assert_eq!(format_duration(Duration::from_millis(1_013)), "1s 13ms");
/// assert_eq!(format_duration(Duration::from_millis(62_013)), "1m 2s");
/// assert_eq!(format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(format_duration(Duration::from_secs(24 * 60 * 60 + 59)), "1d 59s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    let parts = [
        (seconds / 86_400, "d"),
        ((seconds / 3_600) % 24, "h"),
        ((seconds / 60) % 60, "m"),
        (seconds % 60, "s"),
    ];

    let mut result = String::new();
    for (value, unit) in parts.iter().filter(|(value, _)| *value > 0) {
        if !result.is_empty() {
            result.push(' ');
        }
        let _ = write!(result, "{}{}", value, unit);
    }

    let millis = duration.subsec_millis();
    if seconds < 60 && (millis > 0 || result.is_empty()) {
        if !result.is_empty() {
            result.push(' ');
        }
        let _ = write!(result, "{}ms", millis);
    }

    result
}
