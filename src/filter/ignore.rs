//! Ignore list: identities that must never be reported.
//!
//! Sources are checked in a fixed order and the first hit wins:
//! own addresses, listed addresses and networks, listed host names,
//! address files, then the external ignore command. The whole verdict can
//! be cached under a key built from the same placeholders the command uses.

use crate::addr::{DnsUtils, FileIpAddrSet, IpAddr};
use crate::cache::Cache;
use crate::clock::parse_duration;
use crate::error::{CommandError, FilterError};
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const IGNORE_CACHE_MAX_COUNT: usize = 100;
pub const IGNORE_CACHE_MAX_TIME: f64 = 300.0;

const FILE_PREFIX: &str = "file://";
const ENV_PREFIX: &str = "BW_";

/// Why an identity was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreSource {
    SelfRule,
    Ip,
    Dns,
    File,
    Command,
}

impl fmt::Display for IgnoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SelfRule => "ignoreself rule",
            Self::Ip => "ip",
            Self::Dns => "dns",
            Self::File => "file",
            Self::Command => "command",
        })
    }
}

/// Ignore-cache settings.
#[derive(Debug, Clone, PartialEq)]
pub struct IgnoreCacheConfig {
    /// Key template, e.g. `<ip>` or `<F-USER>`.
    pub key: String,
    pub max_count: usize,
    /// Seconds.
    pub max_time: f64,
}

impl IgnoreCacheConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            max_count: IGNORE_CACHE_MAX_COUNT,
            max_time: IGNORE_CACHE_MAX_TIME,
        }
    }
}

impl FromStr for IgnoreCacheConfig {
    type Err = FilterError;

    /// Parse `key="<ip>", max-count=100, max-time=5m`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FilterError::InvalidIgnoreCache(s.to_string());
        let mut key = None;
        let mut config = IgnoreCacheConfig::new("");
        for option in s.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (name, value) = option.split_once('=').ok_or_else(invalid)?;
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            match name.trim() {
                "key" => key = Some(value.to_string()),
                "max-count" | "max_count" => {
                    config.max_count = value.parse().map_err(|_| invalid())?;
                }
                "max-time" | "max_time" => config.max_time = parse_duration(value)?,
                _ => return Err(invalid()),
            }
        }
        config.key = key.filter(|k| !k.is_empty()).ok_or_else(invalid)?;
        Ok(config)
    }
}

struct IgnoreCache {
    config: IgnoreCacheConfig,
    verdicts: Cache<String, Option<IgnoreSource>>,
}

#[derive(Debug, Clone)]
enum IgnoreEntry {
    Addr(IpAddr),
    Name(String),
    File(Arc<FileIpAddrSet>),
}

/// Output of an external command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run `script` with `sh -c`, bounded by `timeout`. The child is killed if
/// the timeout fires.
pub async fn execute(
    script: &str,
    envs: &[(String, String)],
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(script)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        }),
        Ok(Err(source)) => Err(CommandError::Spawn {
            command: script.to_string(),
            source,
        }),
        Err(_) => Err(CommandError::Timeout {
            command: script.to_string(),
            timeout,
        }),
    }
}

/// Environment variable carrying the value of a placeholder tag.
fn env_name(tag: &str) -> String {
    let mut name = String::from(ENV_PREFIX);
    name.extend(tag.chars().map(|c| match c {
        '-' => '_',
        c => c.to_ascii_uppercase(),
    }));
    name
}

/// `<F-*>` tags used in a template.
fn capture_tags(template: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut rest = template;
    while let Some(pos) = rest.find("<F-") {
        let after = &rest[pos + 1..];
        match after.find('>') {
            Some(end)
                if after[..end]
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
            {
                let tag = after[..end].to_string();
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
                rest = &after[end + 1..];
            }
            _ => rest = after,
        }
    }
    tags
}

/// Configured ignore sources for one filter.
pub struct IgnoreList {
    entries: Vec<(String, IgnoreEntry)>,
    ignore_self: bool,
    command: Option<String>,
    command_timeout: Duration,
    cache: Option<IgnoreCache>,
}

impl Default for IgnoreList {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            ignore_self: true,
            command: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            cache: None,
        }
    }
}

impl fmt::Debug for IgnoreList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IgnoreList")
            .field("entries", &self.entries().collect::<Vec<_>>())
            .field("ignore_self", &self.ignore_self)
            .field("command", &self.command)
            .field("cache", &self.cache.as_ref().map(|c| &c.config))
            .finish()
    }
}

impl IgnoreList {
    /// Add one entry: an address or network, a host name, or `file://path`.
    pub fn add(&mut self, text: &str, dns: &DnsUtils) -> Result<(), FilterError> {
        let text = text.trim();
        let entry = match text.strip_prefix(FILE_PREFIX) {
            Some(path) => IgnoreEntry::File(dns.ips_from_file(std::path::Path::new(path))),
            None => match IpAddr::from_str(text)? {
                IpAddr::Raw(name) => IgnoreEntry::Name(name),
                ip => IgnoreEntry::Addr(ip),
            },
        };
        self.entries.push((text.to_string(), entry));
        self.clear_cache();
        Ok(())
    }

    /// Remove entries added as `text`. Returns whether any was removed.
    pub fn remove(&mut self, text: &str) -> bool {
        let text = text.trim();
        let before = self.entries.len();
        self.entries.retain(|(t, _)| t != text);
        self.clear_cache();
        self.entries.len() != before
    }

    /// Entries as added.
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(t, _)| t.as_str())
    }

    pub fn set_ignore_self(&mut self, value: bool) {
        self.ignore_self = value;
        self.clear_cache();
    }

    pub fn ignore_self(&self) -> bool {
        self.ignore_self
    }

    pub fn set_command(&mut self, command: Option<String>) {
        self.command = command.filter(|c| !c.trim().is_empty());
        self.clear_cache();
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.command_timeout = timeout;
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn set_cache(&mut self, config: Option<IgnoreCacheConfig>) {
        self.cache = config.map(|config| IgnoreCache {
            verdicts: Cache::new(config.max_count, Duration::from_secs_f64(config.max_time)),
            config,
        });
    }

    pub fn cache_config(&self) -> Option<&IgnoreCacheConfig> {
        self.cache.as_ref().map(|c| &c.config)
    }

    fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.verdicts.clear();
        }
    }

    /// First source that ignores `ip`, consulting the verdict cache first.
    pub async fn check(
        &self,
        ip: &IpAddr,
        data: &HashMap<String, String>,
        dns: &DnsUtils,
    ) -> Option<IgnoreSource> {
        let key = match &self.cache {
            Some(cache) => Some(substitute(&cache.config.key, ip, data, dns).await),
            None => None,
        };
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(verdict) = cache.verdicts.get(key) {
                debug!(key = %key, "Ignore verdict from cache");
                return verdict;
            }
        }

        let verdict = self.evaluate(ip, data, dns).await;
        if let (Some(cache), Some(key)) = (&self.cache, key) {
            cache.verdicts.set(key, verdict);
        }
        verdict
    }

    async fn evaluate(
        &self,
        ip: &IpAddr,
        data: &HashMap<String, String>,
        dns: &DnsUtils,
    ) -> Option<IgnoreSource> {
        if self.ignore_self && dns.self_ips().await.contains(ip) {
            return Some(IgnoreSource::SelfRule);
        }
        for (_, entry) in &self.entries {
            match entry {
                IgnoreEntry::Addr(net) if net.contains(ip) => return Some(IgnoreSource::Ip),
                IgnoreEntry::Name(name) if dns.dns_to_ip(name).await.contains(ip) => {
                    return Some(IgnoreSource::Dns);
                }
                _ => {}
            }
        }
        for (_, entry) in &self.entries {
            if let IgnoreEntry::File(set) = entry {
                if set.current().await.contains(ip) {
                    return Some(IgnoreSource::File);
                }
            }
        }
        match &self.command {
            Some(command) if self.run_command(command, ip, data, dns).await => {
                Some(IgnoreSource::Command)
            }
            _ => None,
        }
    }

    /// Run the ignore command; `true` means ignore.
    async fn run_command(
        &self,
        command: &str,
        ip: &IpAddr,
        data: &HashMap<String, String>,
        dns: &DnsUtils,
    ) -> bool {
        let mut envs = vec![(env_name("ip"), ip.to_string())];
        let mut script = command.replace("<ip>", "${BW_IP}");
        if script.contains("<ip-host>") {
            let host = dns.ip_to_name(ip).await.unwrap_or_default();
            envs.push((env_name("ip-host"), host));
            script = script.replace("<ip-host>", "${BW_IP_HOST}");
        }
        for tag in capture_tags(&script) {
            let var = env_name(&tag);
            script = script.replace(&format!("<{tag}>"), &format!("${{{var}}}"));
            envs.push((var, data.get(&tag).cloned().unwrap_or_default()));
        }

        match execute(&script, &envs, self.command_timeout).await {
            Ok(out) => match out.code {
                Some(code @ (0 | 1)) => {
                    info!(ip = %ip, "{} -- returned successfully {}", command, code);
                    code == 0
                }
                code => {
                    for line in out.stdout.lines() {
                        error!("{} -- stdout: {}", command, line);
                    }
                    for line in out.stderr.lines() {
                        error!("{} -- stderr: {}", command, line);
                    }
                    let err = CommandError::Exit {
                        command: command.to_string(),
                        code,
                        stdout: out.stdout,
                        stderr: out.stderr,
                    };
                    error!(code = err.error_code(), "{}", err);
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "Ignore command failed, not ignoring {}", ip);
                false
            }
        }
    }
}

/// Fill `<ip>`, `<ip-host>` and `<F-*>` placeholders with their values.
pub async fn substitute(
    template: &str,
    ip: &IpAddr,
    data: &HashMap<String, String>,
    dns: &DnsUtils,
) -> String {
    let mut out = template.replace("<ip>", &ip.to_string());
    if out.contains("<ip-host>") {
        let host = dns.ip_to_name(ip).await.unwrap_or_default();
        out = out.replace("<ip-host>", &host);
    }
    for tag in capture_tags(&out) {
        let value = data.get(&tag).map(String::as_str).unwrap_or("");
        out = out.replace(&format!("<{tag}>"), value);
    }
    out
}
