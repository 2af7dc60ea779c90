//! Unified error handling for banwatch.
//!
//! One error enum per component. Configuration calls raise these
//! synchronously; per-line and per-file problems are logged where they
//! happen and never reach the jail. Every enum exposes `error_code()` for
//! metrics labeling.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Address Errors
// ============================================================================

/// Errors raised while parsing addresses for registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    #[error("invalid network mask in {0:?}: not a contiguous prefix")]
    InvalidMask(String),

    #[error("prefix length out of range in {0:?}")]
    InvalidPrefix(String),
}

impl AddrError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidMask(_) => "invalid_mask",
            Self::InvalidPrefix(_) => "invalid_prefix",
        }
    }
}

// ============================================================================
// DNS Errors
// ============================================================================

/// Resolution failures. Logged by the DNS service, never raised to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
}

impl DnsError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Lookup(_) => "dns_lookup",
            Self::Timeout(_) => "dns_timeout",
        }
    }
}

// ============================================================================
// Date Errors
// ============================================================================

/// Errors raised when configuring date detection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateError {
    #[error("invalid date pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid time zone {0:?}")]
    InvalidTimeZone(String),
}

impl DateError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidPattern { .. } => "invalid_date_pattern",
            Self::InvalidTimeZone(_) => "invalid_time_zone",
        }
    }
}

// ============================================================================
// Filter Errors (configuration mutation)
// ============================================================================

/// Errors raised synchronously by filter configuration calls.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid regular expression {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("regular expression {0:?} has no host, address or user group")]
    NoIdentityGroup(String),

    #[error("regular expression {pattern:?} refers to unknown group {group:?}")]
    UnknownBackReference { pattern: String, group: String },

    #[error("index {0} is not valid")]
    InvalidIndex(usize),

    #[error(transparent)]
    Date(#[from] DateError),

    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error("unknown log encoding {0:?}")]
    UnknownEncoding(String),

    #[error("invalid journal match {0:?}: expected FIELD=value")]
    InvalidJournalMatch(String),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("invalid ignore cache option {0:?}")]
    InvalidIgnoreCache(String),

    #[error("invalid use-dns mode {0:?}")]
    InvalidUseDns(String),
}

impl FilterError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRegex { .. } => "invalid_regex",
            Self::NoIdentityGroup(_) => "no_identity_group",
            Self::UnknownBackReference { .. } => "unknown_back_reference",
            Self::InvalidIndex(_) => "invalid_index",
            Self::Date(e) => e.error_code(),
            Self::Addr(e) => e.error_code(),
            Self::UnknownEncoding(_) => "unknown_encoding",
            Self::InvalidJournalMatch(_) => "invalid_journal_match",
            Self::InvalidDuration(_) => "invalid_duration",
            Self::InvalidIgnoreCache(_) => "invalid_ignore_cache",
            Self::InvalidUseDns(_) => "invalid_use_dns",
        }
    }
}

// ============================================================================
// FailManager Errors
// ============================================================================

/// FailManager conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailManagerError {
    /// No ticket is ready. Expected when polling, not a failure.
    #[error("no ticket ready")]
    Empty,
}

impl FailManagerError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
        }
    }
}

// ============================================================================
// Source Errors (log files and journal)
// ============================================================================

/// Errors from log sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unable to open {}: {source}", .path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error decoding line from {} with {encoding}", .path.display())]
    Decode { path: PathBuf, encoding: String },

    #[error("malformed journal record: {0}")]
    Journal(String),

    #[error("invalid log path pattern {0:?}")]
    Pattern(String),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("unknown backend {0:?}")]
    UnknownBackend(String),
}

impl SourceError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "source_unavailable",
            Self::Io { .. } => "io_error",
            Self::Decode { .. } => "decode_error",
            Self::Journal(_) => "journal_error",
            Self::Pattern(_) => "invalid_path_pattern",
            Self::Watch(_) => "watch_error",
            Self::UnknownBackend(_) => "unknown_backend",
        }
    }
}

// ============================================================================
// Command Errors (ignore-command)
// ============================================================================

/// Failures of an external ignore-command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to run {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command:?} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("{command} -- returned {}", .code.map_or_else(|| "by signal".to_string(), |c| c.to_string()))]
    Exit {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl CommandError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "command_spawn",
            Self::Timeout { .. } => "command_timeout",
            Self::Exit { .. } => "command_exit",
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Errors raised while loading the configuration or building a jail from it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate jail {0:?}")]
    DuplicateJail(String),

    #[error("jail {jail:?}: {source}")]
    Filter {
        jail: String,
        #[source]
        source: FilterError,
    },

    #[error("jail {jail:?}: {source}")]
    Source {
        jail: String,
        #[source]
        source: SourceError,
    },

    #[error("have not found any log file for jail {0:?}")]
    NoLogFile(String),
}

impl ConfigError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "config_io",
            Self::Parse(_) => "config_parse",
            Self::DuplicateJail(_) => "duplicate_jail",
            Self::Filter { source, .. } => source.error_code(),
            Self::Source { source, .. } => source.error_code(),
            Self::NoLogFile(_) => "no_log_file",
        }
    }
}
