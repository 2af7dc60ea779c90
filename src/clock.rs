//! Wall clock used by every time-dependent decision.
//!
//! Log timestamps, the find-time window, anomaly checks and file recheck
//! intervals all compare against [`Clock::now`]. In production this is the
//! system time; tests pin it with [`Clock::fixed`] and move it explicitly.

use crate::error::FilterError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" as fractional Unix seconds.
///
/// Cloning shares the underlying state, so a fixed clock handed to several
/// components moves for all of them at once.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    fixed: Option<Arc<AtomicU64>>,
}

impl Clock {
    /// Clock following the system time.
    pub fn system() -> Self {
        Self { fixed: None }
    }

    /// Clock pinned at `now` until moved with [`Clock::set`] or [`Clock::advance`].
    pub fn fixed(now: f64) -> Self {
        Self {
            fixed: Some(Arc::new(AtomicU64::new(now.to_bits()))),
        }
    }

    /// Current time in Unix seconds.
    pub fn now(&self) -> f64 {
        match &self.fixed {
            Some(t) => f64::from_bits(t.load(Ordering::Acquire)),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        }
    }

    /// Whether this clock is pinned.
    pub fn is_fixed(&self) -> bool {
        self.fixed.is_some()
    }

    /// Move a pinned clock to `now`. No effect on a system clock.
    pub fn set(&self, now: f64) {
        if let Some(t) = &self.fixed {
            t.store(now.to_bits(), Ordering::Release);
        }
    }

    /// Move a pinned clock by `secs` (may be negative).
    pub fn advance(&self, secs: f64) {
        if let Some(t) = &self.fixed {
            let _ = t.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + secs).to_bits())
            });
        }
    }
}

/// Parse a duration such as `1h`, `10m`, `1h30m`, `2d`, `1w` or bare seconds.
pub fn parse_duration(text: &str) -> Result<f64, FilterError> {
    let invalid = || FilterError::InvalidDuration(text.to_string());
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = trimmed.parse::<f64>() {
        return if secs >= 0.0 { Ok(secs) } else { Err(invalid()) };
    }

    let mut total = 0.0;
    let mut number = String::new();
    for c in trimmed.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        if c.is_whitespace() {
            continue;
        }
        let unit = match c.to_ascii_lowercase() {
            's' => 1.0,
            'm' => 60.0,
            'h' => 3600.0,
            'd' => 86_400.0,
            'w' => 604_800.0,
            _ => return Err(invalid()),
        };
        let value: f64 = number.parse().map_err(|_| invalid())?;
        total += value * unit;
        number.clear();
    }
    if !number.is_empty() {
        return Err(invalid());
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("600").unwrap(), 600.0);
        assert_eq!(parse_duration("1h").unwrap(), 3600.0);
        assert_eq!(parse_duration("10m").unwrap(), 600.0);
        assert_eq!(parse_duration("1h30m").unwrap(), 5400.0);
        assert_eq!(parse_duration("1d").unwrap(), 86_400.0);
        assert_eq!(parse_duration("1w").unwrap(), 604_800.0);
        assert_eq!(parse_duration(" 30s ").unwrap(), 30.0);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("1h30").is_err());
        assert!(parse_duration("-5").is_err());
    }

    #[test]
    fn test_fixed_clock_is_shared() {
        let clock = Clock::fixed(1_124_013_600.0);
        let other = clock.clone();
        other.advance(60.0);
        assert_eq!(clock.now(), 1_124_013_660.0);
        clock.set(10.0);
        assert_eq!(other.now(), 10.0);
    }

    #[test]
    fn test_system_clock_ignores_set() {
        let clock = Clock::system();
        clock.set(0.0);
        assert!(clock.now() > 1_600_000_000.0);
        assert!(!clock.is_fixed());
    }
}
