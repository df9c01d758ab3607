//! UPnP time strings.
//!
//! AVTransport reports positions as `H+:MM:SS[.F+]` or `H+:MM:SS[.F0/F1]`
//! and expects seek targets as `HH:MM:SS`. Internally positions are kept
//! in milliseconds.

use crate::errors::BridgeError;

/// Formats milliseconds as HH:MM:SS (sub-second part dropped).
///
/// ```
/// # use pmobridge::time_utils::format_hhmmss;
/// assert_eq!(format_hhmmss(0), "00:00:00");
/// assert_eq!(format_hhmmss(61_500), "00:01:01");
/// assert_eq!(format_hhmmss(3_661_000), "01:01:01");
/// ```
pub fn format_hhmmss(ms: u64) -> String {
    let seconds = ms / 1000;
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}

/// Parses an AVTransport time value into milliseconds.
///
/// Returns `Ok(None)` for the "no information" sentinels renderers use
/// (`NOT_IMPLEMENTED`, `-:--:--`, empty).
pub fn parse_upnp_time(input: &str) -> Result<Option<u64>, BridgeError> {
    let s = input.trim();
    if s.is_empty() || s == "NOT_IMPLEMENTED" || s.starts_with("-:") {
        return Ok(None);
    }

    let (clock, fraction) = match s.split_once('.') {
        Some((clock, fraction)) => (clock, Some(fraction)),
        None => (s, None),
    };

    let parts: Vec<&str> = clock.split(':').collect();
    if parts.len() != 3 {
        return Err(BridgeError::InvalidTimeFormat(format!(
            "'{input}': expected H+:MM:SS"
        )));
    }

    let component = |text: &str, name: &str| -> Result<u64, BridgeError> {
        text.parse::<u64>()
            .map_err(|_| BridgeError::InvalidTimeFormat(format!("'{input}': invalid {name}")))
    };

    let hours = component(parts[0], "hours")?;
    let minutes = component(parts[1], "minutes")?;
    let seconds = component(parts[2], "seconds")?;
    if minutes >= 60 || seconds >= 60 {
        return Err(BridgeError::InvalidTimeFormat(format!(
            "'{input}': minutes and seconds must be < 60"
        )));
    }

    let millis = match fraction {
        None => 0,
        Some(fraction) => parse_fraction_ms(fraction)
            .ok_or_else(|| BridgeError::InvalidTimeFormat(format!("'{input}': invalid fraction")))?,
    };

    hours
        .checked_mul(3600)
        .and_then(|h| h.checked_add(minutes * 60 + seconds))
        .and_then(|total| total.checked_mul(1000))
        .and_then(|total| total.checked_add(millis))
        .map(Some)
        .ok_or_else(|| BridgeError::InvalidTimeFormat(format!("'{input}': out of range")))
}

/// `F+` (decimal digits) or `F0/F1` (rational) fraction of a second.
fn parse_fraction_ms(fraction: &str) -> Option<u64> {
    if let Some((num, den)) = fraction.split_once('/') {
        let num: u64 = num.parse().ok()?;
        let den: u64 = den.parse().ok()?;
        if den == 0 || num >= den {
            return None;
        }
        // num < den, so the result is below 1000.
        return Some((u128::from(num) * 1000 / u128::from(den)) as u64);
    }

    if fraction.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits: String = fraction.chars().chain("000".chars()).take(3).collect();
    digits.parse().ok()
}
