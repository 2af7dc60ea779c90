//! Zone names and offsets used by date detection.

use crate::error::DateError;
use chrono::FixedOffset;

/// Common zone abbreviations and their UTC offsets in hours.
const ZONE_ABBREVIATIONS: &[(&str, i32)] = &[
    ("UTC", 0),
    ("UT", 0),
    ("GMT", 0),
    ("Z", 0),
    ("WET", 0),
    ("WEST", 1),
    ("CET", 1),
    ("CEST", 2),
    ("MET", 1),
    ("MEST", 2),
    ("EET", 2),
    ("EEST", 3),
    ("MSK", 3),
    ("IST", 5),
    ("JST", 9),
    ("AEST", 10),
    ("AEDT", 11),
    ("NZST", 12),
    ("NZDT", 13),
    ("AST", -4),
    ("ADT", -3),
    ("EST", -5),
    ("EDT", -4),
    ("CST", -6),
    ("CDT", -5),
    ("MST", -7),
    ("MDT", -6),
    ("PST", -8),
    ("PDT", -7),
    ("AKST", -9),
    ("AKDT", -8),
    ("HST", -10),
];

/// Offset of a zone abbreviation, case-insensitive.
pub fn zone_offset(name: &str) -> Option<FixedOffset> {
    let name = name.trim();
    ZONE_ABBREVIATIONS
        .iter()
        .find(|(abbr, _)| abbr.eq_ignore_ascii_case(name))
        .and_then(|(_, hours)| FixedOffset::east_opt(hours * 3600))
}

/// Parse `+hh`, `+hhmm`, `+hh:mm` (and `-`) into an offset.
pub fn parse_offset(text: &str) -> Option<FixedOffset> {
    let text = text.trim();
    let (sign, digits) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || digits.len() > 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().ok()?, 0),
        3 => (digits[..1].parse::<i32>().ok()?, digits[1..].parse::<i32>().ok()?),
        _ => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Parse a `%z`/`%Z` capture: numeric offset or known abbreviation.
pub fn parse_zone_token(text: &str) -> Option<FixedOffset> {
    parse_offset(text).or_else(|| zone_offset(text))
}

/// Parse a configured log time zone.
///
/// Accepts `UTC`, `UTC+hhmm`, `GMT-hh:mm`, a bare offset, or a known
/// abbreviation. `None` means the local zone.
pub fn parse_time_zone(text: &str) -> Result<Option<FixedOffset>, DateError> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("local") {
        return Ok(None);
    }
    let upper = trimmed.to_ascii_uppercase();
    for base in ["UTC", "GMT"] {
        match upper.strip_prefix(base) {
            Some(rest) if !rest.is_empty() => {
                return parse_offset(rest)
                    .map(Some)
                    .ok_or_else(|| DateError::InvalidTimeZone(text.to_string()));
            }
            _ => {}
        }
    }
    parse_zone_token(trimmed)
        .map(Some)
        .ok_or_else(|| DateError::InvalidTimeZone(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(tz: Option<FixedOffset>) -> Option<i32> {
        tz.map(|o| o.local_minus_utc())
    }

    #[test]
    fn test_parse_time_zone() {
        assert_eq!(secs(parse_time_zone("UTC").unwrap()), Some(0));
        assert_eq!(secs(parse_time_zone("UTC+0200").unwrap()), Some(7200));
        assert_eq!(secs(parse_time_zone("UTC-0400").unwrap()), Some(-14400));
        assert_eq!(secs(parse_time_zone("utc+02:30").unwrap()), Some(9000));
        assert_eq!(secs(parse_time_zone("-05").unwrap()), Some(-18000));
        assert_eq!(secs(parse_time_zone("CEST").unwrap()), Some(7200));
        assert_eq!(parse_time_zone("").unwrap(), None);
        assert!(parse_time_zone("not-a-time-zone").is_err());
        assert!(parse_time_zone("UTC+99").is_err());
    }

    #[test]
    fn test_zone_tokens() {
        assert_eq!(secs(parse_zone_token("+0100")), Some(3600));
        assert_eq!(secs(parse_zone_token("GMT")), Some(0));
        assert_eq!(secs(parse_zone_token("cet")), Some(3600));
        assert_eq!(parse_zone_token("XYZT"), None);
    }
}
