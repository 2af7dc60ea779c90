//! Default value functions for configuration.

use super::types::DurationSetting;
use crate::source::BackendKind;

/// Returns `true` (for serde defaults).
pub fn default_true() -> bool {
    true
}

// =============================================================================
// Daemon Defaults
// =============================================================================

pub fn default_log_format() -> String {
    "text".to_string()
}

// =============================================================================
// DNS Defaults
// =============================================================================

pub fn default_dns_cache_max_count() -> usize {
    crate::addr::dns::DNS_CACHE_MAX_COUNT
}

pub fn default_dns_cache_max_time() -> DurationSetting {
    DurationSetting::Seconds(crate::addr::dns::DNS_CACHE_MAX_TIME.as_secs_f64())
}

pub fn default_dns_timeout() -> DurationSetting {
    DurationSetting::Seconds(crate::addr::dns::DNS_TIMEOUT.as_secs_f64())
}

// =============================================================================
// Jail Defaults
// =============================================================================

pub fn default_backend() -> BackendKind {
    BackendKind::Auto
}

pub fn default_use_dns() -> String {
    "warn".to_string()
}

pub fn default_max_lines() -> usize {
    crate::filter::buffer::DEFAULT_MAX_LINES
}

pub fn default_max_retry() -> usize {
    crate::failmanager::DEFAULT_MAX_RETRY
}

pub fn default_find_time() -> DurationSetting {
    DurationSetting::Seconds(crate::failmanager::DEFAULT_FIND_TIME)
}

pub fn default_log_encoding() -> String {
    "auto".to_string()
}

pub fn default_sleep_time() -> DurationSetting {
    DurationSetting::Seconds(crate::source::poll::DEFAULT_SLEEP_TIME.as_secs_f64())
}

pub fn default_ignore_command_timeout() -> DurationSetting {
    DurationSetting::Seconds(crate::filter::ignore::DEFAULT_COMMAND_TIMEOUT.as_secs_f64())
}
