//! Throughput reported by `dd`.

use std::sync::LazyLock;

use regex::Regex;

use super::{StatusError, compile};

static SPEED: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(?P<value>\d+(?:[.,]\d+)?) (?P<unit>\w+/s)$"));

const DD_OUTPUT_LINES: usize = 3;

/// Extracts the transfer speed from the summary line `dd` prints, in bytes
/// per second. Both `.` and `,` are accepted as decimal separators.
///
/// # Errors
///
/// Returns [`StatusError`] when the line carries no speed, the value is not a
/// number or the unit is not one of kB/s, MB/s or GB/s.
pub fn parse_dd_speed(line: &str) -> Result<u64, StatusError> {
    let trimmed = line.trim_end();
    let captures = SPEED.captures(trimmed).ok_or_else(|| StatusError::DdSpeed {
        line: trimmed.to_owned(),
    })?;
    let raw_value = captures.name("value").map_or("", |m| m.as_str());
    let unit = captures.name("unit").map_or("", |m| m.as_str());

    let value: f64 = raw_value
        .replace(',', ".")
        .parse()
        .map_err(|_| StatusError::DdValue {
            value: raw_value.to_owned(),
        })?;
    let multiplier: f64 = match unit {
        "kB/s" => 1e3,
        "MB/s" => 1e6,
        "GB/s" => 1e9,
        other => {
            return Err(StatusError::DdUnit {
                unit: other.to_owned(),
            });
        }
    };
    Ok(to_bytes(value, multiplier))
}

#[expect(
    clippy::float_arithmetic,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "dd reports non-negative speeds far below u64::MAX"
)]
fn to_bytes(value: f64, multiplier: f64) -> u64 {
    (value * multiplier).round() as u64
}

/// Parses the three-line report `dd` writes to stderr and returns the speed
/// from its last line.
///
/// # Errors
///
/// Returns [`StatusError::DdLineCount`] when the output does not have three
/// lines, or any error from [`parse_dd_speed`].
pub fn parse_dd_output(output: &str) -> Result<u64, StatusError> {
    let lines: Vec<&str> = output.trim().lines().collect();
    if lines.len() != DD_OUTPUT_LINES {
        return Err(StatusError::DdLineCount {
            count: lines.len(),
            output: output.to_owned(),
        });
    }
    let last = lines.last().copied().unwrap_or_default();
    parse_dd_speed(last)
}
