//! Core configuration types.

use super::defaults::*;
use crate::addr::dns::{DnsUtils, HickoryResolver, UseDns};
use crate::clock::{Clock, parse_duration};
use crate::error::{ConfigError, FilterError, SourceError};
use crate::failmanager::FailManager;
use crate::filter::Filter;
use crate::filter::ignore::IgnoreCacheConfig;
use crate::source::{BackendKind, JournalSource, LogSource, SeekPolicy};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// `text` or `json` log output.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default, rename = "jail")]
    pub jails: Vec<JailConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration text. Jail names must be unique.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        let mut seen = HashSet::new();
        for jail in &config.jails {
            if !seen.insert(jail.name.as_str()) {
                return Err(ConfigError::DuplicateJail(jail.name.clone()));
            }
        }
        Ok(config)
    }

    pub fn enabled_jails(&self) -> impl Iterator<Item = &JailConfig> {
        self.jails.iter().filter(|j| j.enabled)
    }
}

/// A duration given as seconds (`600`) or as text (`"10m"`, `"1h30m"`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DurationSetting {
    Seconds(f64),
    Text(String),
}

impl DurationSetting {
    pub fn secs(&self) -> Result<f64, FilterError> {
        match self {
            Self::Seconds(s) if *s >= 0.0 && s.is_finite() => Ok(*s),
            Self::Seconds(s) => Err(FilterError::InvalidDuration(s.to_string())),
            Self::Text(t) => parse_duration(t),
        }
    }

    pub fn duration(&self) -> Result<Duration, FilterError> {
        self.secs().map(Duration::from_secs_f64)
    }
}

/// Shared DNS service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_cache_max_count")]
    pub cache_max_count: usize,
    #[serde(default = "default_dns_cache_max_time")]
    pub cache_max_time: DurationSetting,
    /// Bound on every single lookup.
    #[serde(default = "default_dns_timeout")]
    pub timeout: DurationSetting,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cache_max_count: default_dns_cache_max_count(),
            cache_max_time: default_dns_cache_max_time(),
            timeout: default_dns_timeout(),
        }
    }
}

impl DnsConfig {
    /// Build the DNS service over the system resolver.
    pub fn build(&self, clock: Clock) -> Result<DnsUtils, ConfigError> {
        let invalid = |source| ConfigError::Filter {
            jail: "dns".to_string(),
            source,
        };
        let max_time = self.cache_max_time.duration().map_err(invalid)?;
        let timeout = self.timeout.duration().map_err(invalid)?;
        Ok(DnsUtils::with_limits(
            Arc::new(HickoryResolver::new()),
            clock,
            self.cache_max_count,
            max_time,
            timeout,
        ))
    }
}

/// One jail: a filter, its fail manager and its log source.
#[derive(Debug, Clone, Deserialize)]
pub struct JailConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Log files; glob patterns are expanded.
    #[serde(default)]
    pub logpath: Vec<String>,
    /// Start at the end of the log files instead of their beginning.
    #[serde(default)]
    pub tail: bool,

    #[serde(default)]
    pub failregex: Vec<String>,
    #[serde(default)]
    pub ignoreregex: Vec<String>,
    #[serde(default)]
    pub ignoreip: Vec<String>,
    #[serde(default = "default_true")]
    pub ignoreself: bool,
    pub ignorecommand: Option<String>,
    #[serde(default = "default_ignore_command_timeout")]
    pub ignorecommand_timeout: DurationSetting,
    /// e.g. `key="<ip>", max-count=100, max-time=5m`
    pub ignorecache: Option<String>,

    #[serde(default = "default_use_dns")]
    pub usedns: String,
    #[serde(default = "default_max_lines")]
    pub maxlines: usize,
    #[serde(default = "default_max_retry")]
    pub maxretry: usize,
    #[serde(default = "default_find_time")]
    pub findtime: DurationSetting,
    pub maxmatches: Option<usize>,

    /// Date patterns; empty means the built-in table.
    #[serde(default)]
    pub datepattern: Vec<String>,
    pub logtimezone: Option<String>,
    #[serde(default = "default_log_encoding")]
    pub logencoding: String,

    #[serde(default)]
    pub journalmatch: Vec<String>,
    pub journal_cursor_file: Option<PathBuf>,
    #[serde(default = "default_sleep_time")]
    pub sleeptime: DurationSetting,
}

impl JailConfig {
    /// Build the filter and log source of this jail.
    ///
    /// Every setting goes through the same call a library user would make,
    /// so a bad value fails exactly like that call does.
    pub fn build(&self, dns: Arc<DnsUtils>, clock: Clock) -> Result<(Filter, LogSource), ConfigError> {
        let filter_err = |source| ConfigError::Filter {
            jail: self.name.clone(),
            source,
        };
        let mut filter = self.build_filter(dns, clock).map_err(filter_err)?;
        let sleep_time = self.sleeptime.duration().map_err(filter_err)?;
        let source = self.build_source(&mut filter, sleep_time)?;
        if source.kind() != BackendKind::Journal && source.log_paths().is_empty() {
            return Err(ConfigError::NoLogFile(self.name.clone()));
        }
        Ok((filter, source))
    }

    fn build_filter(&self, dns: Arc<DnsUtils>, clock: Clock) -> Result<Filter, FilterError> {
        let mut filter = Filter::new(&self.name, Arc::new(FailManager::new(clock)), dns);

        for pattern in &self.failregex {
            filter.add_fail_regex(pattern)?;
        }
        for pattern in &self.ignoreregex {
            filter.add_ignore_regex(pattern)?;
        }
        for entry in &self.ignoreip {
            filter.add_ignore_ip(entry)?;
        }
        filter.set_ignore_self(self.ignoreself);
        filter.set_ignore_command(self.ignorecommand.clone());
        filter.set_ignore_command_timeout(self.ignorecommand_timeout.duration()?);
        let cache = self
            .ignorecache
            .as_deref()
            .map(str::parse::<IgnoreCacheConfig>)
            .transpose()?;
        filter.set_ignore_cache(cache);

        filter.set_use_dns(self.usedns.parse::<UseDns>()?);
        filter.set_max_lines(self.maxlines);
        filter.set_max_retry(self.maxretry);
        filter.set_find_time(self.findtime.secs()?);
        filter.set_max_matches(self.maxmatches);

        let patterns: Vec<&str> = self.datepattern.iter().map(String::as_str).collect();
        filter.set_date_patterns(&patterns)?;
        filter.set_log_time_zone(self.logtimezone.as_deref())?;
        filter.set_log_encoding(&self.logencoding)?;
        Ok(filter)
    }

    fn build_source(&self, filter: &mut Filter, sleep_time: Duration) -> Result<LogSource, ConfigError> {
        let source_err = |source| ConfigError::Source {
            jail: self.name.clone(),
            source,
        };
        let seek = if self.tail { SeekPolicy::Tail } else { SeekPolicy::Head };

        let mut source = match self.backend {
            BackendKind::Journal => LogSource::Journal(JournalSource::new(self.journal_cursor_file.clone())),
            kind => LogSource::new(kind, sleep_time).map_err(source_err)?,
        };
        if let Some(journal) = source.journal_mut() {
            journal.set_seek(seek);
            for spec in &self.journalmatch {
                journal.add_match(spec).map_err(|source| ConfigError::Filter {
                    jail: self.name.clone(),
                    source,
                })?;
            }
        }

        for pattern in &self.logpath {
            for path in expand_log_path(pattern).map_err(source_err)? {
                match source.add_path(&path, seek, filter) {
                    Ok(_) => {}
                    Err(e @ SourceError::Unavailable { .. }) => {
                        warn!(jail = %self.name, error = %e, "Skipping log path");
                    }
                    Err(e) => return Err(source_err(e)),
                }
            }
        }
        info!(jail = %self.name, backend = %source.kind(), paths = source.log_paths().len(), "Jail configured");
        Ok(source)
    }
}

/// Expand a glob pattern. A pattern matching nothing is kept literally so
/// the caller reports the missing file.
fn expand_log_path(pattern: &str) -> Result<Vec<PathBuf>, SourceError> {
    let entries = glob::glob(pattern).map_err(|_| SourceError::Pattern(pattern.to_string()))?;
    let mut paths: Vec<PathBuf> = entries.filter_map(Result::ok).filter(|p| p.is_file()).collect();
    if paths.is_empty() {
        paths.push(PathBuf::from(pattern));
    }
    Ok(paths)
}
