//! Cached DNS resolution and self-IP detection.
//!
//! One [`DnsUtils`] instance is shared (behind an `Arc`) by every filter of
//! the process. Its caches are bounded by count and age and are safe to use
//! from concurrent workers.
//!
//! # Concurrency
//!
//! Lookups of the same key are serialized: the first caller resolves while
//! the others wait on a per-key async mutex, then read the cached answer.
//! Different keys resolve in parallel. Every network resolution is bounded
//! by the service timeout.

use super::{FileIpAddrSet, IpAddr, IpAddrSet};
use crate::cache::Cache;
use crate::clock::Clock;
use crate::error::{DnsError, FilterError};
use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bound on a single resolution.
pub const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Default DNS cache bounds.
pub const DNS_CACHE_MAX_COUNT: usize = 1000;
pub const DNS_CACHE_MAX_TIME: Duration = Duration::from_secs(5 * 60);

const SELF_KEY: &str = "self";

/// How captured host names are turned into identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UseDns {
    /// Resolve names.
    Yes,
    /// Resolve names and warn about it.
    #[default]
    Warn,
    /// Never resolve; a non-IP token yields no identity.
    No,
    /// Never resolve; use the token itself as a raw identity.
    Raw,
}

impl FromStr for UseDns {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" | "on" | "1" => Ok(UseDns::Yes),
            "warn" => Ok(UseDns::Warn),
            "no" | "false" | "off" | "0" => Ok(UseDns::No),
            "raw" => Ok(UseDns::Raw),
            _ => Err(FilterError::InvalidUseDns(s.to_string())),
        }
    }
}

// ============================================================================
// Resolvers
// ============================================================================

/// Name resolution backend.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Forward lookup of a host name.
    async fn lookup_ip(&self, name: &str) -> Result<Vec<std::net::IpAddr>, DnsError>;

    /// Reverse lookup; `Ok(None)` when the address has no name.
    async fn reverse(&self, ip: std::net::IpAddr) -> Result<Option<String>, DnsError>;
}

/// System resolver via hickory.
pub struct HickoryResolver {
    inner: TokioResolver,
}

impl HickoryResolver {
    /// Build from the system configuration, falling back to defaults.
    pub fn new() -> Self {
        let inner = TokioResolver::builder_tokio()
            .map(|b| b.build())
            .unwrap_or_else(|e| {
                warn!(error = %e, "System resolver configuration unavailable, using defaults");
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            });
        Self { inner }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolve for HickoryResolver {
    async fn lookup_ip(&self, name: &str) -> Result<Vec<std::net::IpAddr>, DnsError> {
        self.inner
            .lookup_ip(name)
            .await
            .map(|lookup| lookup.iter().collect())
            .map_err(|e| DnsError::Lookup(e.to_string()))
    }

    async fn reverse(&self, ip: std::net::IpAddr) -> Result<Option<String>, DnsError> {
        self.inner
            .reverse_lookup(ip)
            .await
            .map(|lookup| {
                lookup
                    .iter()
                    .next()
                    .map(|ptr| ptr.to_string().trim_end_matches('.').to_string())
            })
            .map_err(|e| DnsError::Lookup(e.to_string()))
    }
}

/// Fixed host table, for offline setups and tests.
///
/// Counts forward lookups so callers can observe caching.
#[derive(Debug, Default)]
pub struct StaticResolver {
    names: HashMap<String, Vec<std::net::IpAddr>>,
    hosts: HashMap<std::net::IpAddr, String>,
    delay: Duration,
    lookups: AtomicUsize,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `name` to `ips`; each address also maps back to `name`.
    pub fn with_host(mut self, name: &str, ips: &[&str]) -> Self {
        let parsed: Vec<std::net::IpAddr> = ips.iter().filter_map(|s| s.parse().ok()).collect();
        for ip in &parsed {
            self.hosts.entry(*ip).or_insert_with(|| name.to_string());
        }
        self.names.insert(name.to_ascii_lowercase(), parsed);
        self
    }

    /// Delay every answer, to simulate a slow server.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn lookup_ip(&self, name: &str) -> Result<Vec<std::net::IpAddr>, DnsError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.names
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| DnsError::Lookup(format!("{name}: no such host")))
    }

    async fn reverse(&self, ip: std::net::IpAddr) -> Result<Option<String>, DnsError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.hosts.get(&ip).cloned())
    }
}

// ============================================================================
// DnsUtils
// ============================================================================

/// Cached resolution service shared by all filters.
pub struct DnsUtils {
    resolver: Arc<dyn Resolve>,
    clock: Clock,
    timeout: Duration,
    names: Cache<String, Arc<Vec<IpAddr>>>,
    hosts: Cache<IpAddr, Option<String>>,
    self_ips: Cache<&'static str, Arc<IpAddrSet>>,
    file_sets: DashMap<PathBuf, Arc<FileIpAddrSet>>,
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl DnsUtils {
    pub fn new(resolver: Arc<dyn Resolve>, clock: Clock) -> Self {
        Self::with_limits(resolver, clock, DNS_CACHE_MAX_COUNT, DNS_CACHE_MAX_TIME, DNS_TIMEOUT)
    }

    pub fn with_limits(
        resolver: Arc<dyn Resolve>,
        clock: Clock,
        max_count: usize,
        max_time: Duration,
        timeout: Duration,
    ) -> Self {
        debug!(
            max_count = max_count,
            max_time_secs = max_time.as_secs(),
            timeout_ms = timeout.as_millis() as u64,
            "DNS service initialized"
        );
        Self {
            resolver,
            clock,
            timeout,
            names: Cache::new(max_count, max_time),
            hosts: Cache::new(max_count, max_time),
            self_ips: Cache::new(1, max_time),
            file_sets: DashMap::new(),
            key_locks: DashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            &self
                .key_locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Give back a lock from [`Self::key_lock`], removing the map entry
    /// once no caller holds or waits on it.
    fn release_key_lock(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Resolve a host name to its addresses. Failures yield an empty list.
    pub async fn dns_to_ip(&self, name: &str) -> Arc<Vec<IpAddr>> {
        let key = name.trim().to_ascii_lowercase();
        if let Some(hit) = self.names.get(&key) {
            return hit;
        }
        if key.is_empty() {
            warn!("Unable to find a corresponding IP address for {:?}", name);
            return Arc::new(Vec::new());
        }

        let lock_key = format!("name:{key}");
        let lock = self.key_lock(&lock_key);
        let result = {
            let _guard = lock.lock().await;
            match self.names.get(&key) {
                Some(hit) => hit,
                None => {
                    let ips = match tokio::time::timeout(self.timeout, self.resolver.lookup_ip(&key)).await {
                        Ok(Ok(ips)) => ips.into_iter().map(IpAddr::from).collect::<Vec<_>>(),
                        Ok(Err(e)) => {
                            warn!(error = %e, "Unable to find a corresponding IP address for {}", name);
                            Vec::new()
                        }
                        Err(_) => {
                            let e = DnsError::Timeout(self.timeout);
                            warn!(error = %e, "Unable to find a corresponding IP address for {}", name);
                            Vec::new()
                        }
                    };
                    if ips.is_empty() {
                        debug!(name = %key, "Caching negative DNS answer");
                    }
                    let ips = Arc::new(ips);
                    self.names.set(key.clone(), Arc::clone(&ips));
                    ips
                }
            }
        };
        self.release_key_lock(&lock_key, lock);
        result
    }

    /// Reverse-resolve a single address.
    pub async fn ip_to_name(&self, ip: &IpAddr) -> Option<String> {
        let std_ip = match ip.to_std() {
            Some(std_ip) if ip.is_single() => std_ip,
            _ => return None,
        };
        if let Some(hit) = self.hosts.get(ip) {
            return hit;
        }

        let lock_key = format!("addr:{ip}");
        let lock = self.key_lock(&lock_key);
        let result = {
            let _guard = lock.lock().await;
            match self.hosts.get(ip) {
                Some(hit) => hit,
                None => {
                    let name = match tokio::time::timeout(self.timeout, self.resolver.reverse(std_ip)).await {
                        Ok(Ok(name)) => name,
                        Ok(Err(e)) => {
                            debug!(ip = %ip, error = %e, "Reverse lookup failed");
                            None
                        }
                        Err(_) => {
                            let e = DnsError::Timeout(self.timeout);
                            debug!(ip = %ip, error = %e, "Reverse lookup failed");
                            None
                        }
                    };
                    self.hosts.set(ip.clone(), name.clone());
                    name
                }
            }
        };
        self.release_key_lock(&lock_key, lock);
        result
    }

    /// Turn a captured token into identities according to `use_dns`.
    pub async fn text_to_ip(&self, text: &str, use_dns: UseDns) -> Vec<IpAddr> {
        let ip = IpAddr::parse(text);
        if ip.is_valid() {
            return vec![ip];
        }
        match use_dns {
            UseDns::No => {
                debug!(token = %text, "Not resolving host name (usedns = no)");
                Vec::new()
            }
            UseDns::Raw => vec![IpAddr::raw(text.trim())],
            UseDns::Yes | UseDns::Warn => {
                let ips = self.dns_to_ip(text).await;
                if use_dns == UseDns::Warn && !ips.is_empty() {
                    let list: Vec<String> = ips.iter().map(|i| i.to_string()).collect();
                    warn!(
                        "Determined IP using DNS Lookup: {} = {}",
                        text.trim(),
                        list.join(", ")
                    );
                }
                ips.to_vec()
            }
        }
    }

    /// Addresses of this host: loopbacks, interface addresses and the
    /// addresses the host name resolves to.
    pub async fn self_ips(&self) -> Arc<IpAddrSet> {
        if let Some(hit) = self.self_ips.get(SELF_KEY) {
            return hit;
        }
        let mut set = IpAddrSet::new();
        set.insert(IpAddr::from(Ipv4Addr::LOCALHOST));
        set.insert(IpAddr::from(Ipv6Addr::LOCALHOST));

        match nix::ifaddrs::getifaddrs() {
            Ok(ifaddrs) => {
                for ifa in ifaddrs {
                    let Some(addr) = ifa.address else { continue };
                    if let Some(sin) = addr.as_sockaddr_in() {
                        set.insert(IpAddr::from(*SocketAddrV4::from(*sin).ip()));
                    } else if let Some(sin6) = addr.as_sockaddr_in6() {
                        set.insert(IpAddr::from(*SocketAddrV6::from(*sin6).ip()));
                    }
                }
            }
            Err(e) => warn!(error = %e, "Unable to list network interfaces"),
        }

        if let Ok(hostname) = nix::unistd::gethostname() {
            let hostname = hostname.to_string_lossy().into_owned();
            if !hostname.is_empty() {
                for ip in self.dns_to_ip(&hostname).await.iter() {
                    set.insert(ip.clone());
                }
            }
        }

        info!(count = set.len(), "Detected own addresses");
        let set = Arc::new(set);
        self.self_ips.set(SELF_KEY, Arc::clone(&set));
        set
    }

    /// File-backed set for `path`, shared by every caller naming that path.
    pub fn ips_from_file(&self, path: &Path) -> Arc<FileIpAddrSet> {
        Arc::clone(
            &self
                .file_sets
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(FileIpAddrSet::new(path, self.clock.clone()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(resolver: StaticResolver) -> (Arc<StaticResolver>, DnsUtils) {
        let resolver = Arc::new(resolver);
        let dns = DnsUtils::new(resolver.clone(), Clock::fixed(1_000_000.0));
        (resolver, dns)
    }

    #[test]
    fn test_use_dns_parse() {
        assert_eq!("yes".parse::<UseDns>().unwrap(), UseDns::Yes);
        assert_eq!("WARN".parse::<UseDns>().unwrap(), UseDns::Warn);
        assert_eq!("no".parse::<UseDns>().unwrap(), UseDns::No);
        assert_eq!("raw".parse::<UseDns>().unwrap(), UseDns::Raw);
        assert!("maybe".parse::<UseDns>().is_err());
        assert_eq!(UseDns::default(), UseDns::Warn);
    }

    #[tokio::test]
    async fn test_dns_to_ip_cached() {
        let (resolver, dns) = service(
            StaticResolver::new()
                .with_host("fail2ban.org", &["51.159.55.100", "2001:bc8:1200:6:208:a2ff:fe0c:61f8"]),
        );
        let ips = dns.dns_to_ip("fail2ban.org").await;
        assert_eq!(ips.len(), 2);
        assert!(ips.contains(&IpAddr::parse("51.159.55.100")));
        let again = dns.dns_to_ip("FAIL2BAN.org").await;
        assert_eq!(again, ips);
        assert_eq!(resolver.lookups(), 1);
    }

    #[tokio::test]
    async fn test_dns_failure_is_empty_and_cached() {
        let (resolver, dns) = service(StaticResolver::new());
        assert!(dns.dns_to_ip("abcdef.abcdef").await.is_empty());
        assert!(dns.dns_to_ip("abcdef.abcdef").await.is_empty());
        assert_eq!(resolver.lookups(), 1);
        assert!(dns.dns_to_ip("").await.is_empty());
        assert_eq!(resolver.lookups(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_resolve_once() {
        let resolver = Arc::new(
            StaticResolver::new()
                .with_host("slow.example", &["192.0.2.9"])
                .with_delay(Duration::from_millis(50)),
        );
        let dns = Arc::new(DnsUtils::new(resolver.clone(), Clock::system()));
        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let dns = Arc::clone(&dns);
                tokio::spawn(async move { dns.dns_to_ip("slow.example").await })
            })
            .collect();
        for t in tasks {
            assert_eq!(t.await.unwrap().len(), 1);
        }
        assert_eq!(resolver.lookups(), 1);
        assert!(dns.key_locks.is_empty());
    }

    #[test]
    fn test_key_lock_kept_while_waited_on() {
        let dns = DnsUtils::new(Arc::new(StaticResolver::new()), Clock::system());
        let first = dns.key_lock("name:a.example");
        let waiting = dns.key_lock("name:a.example");
        dns.release_key_lock("name:a.example", first);

        // a later caller queues on the same lock as the waiting one
        let later = dns.key_lock("name:a.example");
        assert!(Arc::ptr_eq(&waiting, &later));

        dns.release_key_lock("name:a.example", waiting);
        assert!(dns.key_locks.contains_key("name:a.example"));
        dns.release_key_lock("name:a.example", later);
        assert!(dns.key_locks.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_timeout() {
        let resolver = Arc::new(
            StaticResolver::new()
                .with_host("stalled.example", &["192.0.2.9"])
                .with_delay(Duration::from_secs(10)),
        );
        let dns = DnsUtils::with_limits(
            resolver,
            Clock::system(),
            10,
            Duration::from_secs(60),
            Duration::from_millis(20),
        );
        assert!(dns.dns_to_ip("stalled.example").await.is_empty());
    }

    #[tokio::test]
    async fn test_text_to_ip_modes() {
        let (_, dns) = service(StaticResolver::new().with_host("host.example", &["192.0.2.7"]));
        assert_eq!(
            dns.text_to_ip("192.0.2.1", UseDns::No).await,
            vec![IpAddr::parse("192.0.2.1")]
        );
        assert!(dns.text_to_ip("host.example", UseDns::No).await.is_empty());
        assert_eq!(
            dns.text_to_ip("host.example", UseDns::Yes).await,
            vec![IpAddr::parse("192.0.2.7")]
        );
        assert_eq!(
            dns.text_to_ip("host.example", UseDns::Raw).await,
            vec![IpAddr::raw("host.example")]
        );
    }

    #[tokio::test]
    async fn test_ip_to_name() {
        let (_, dns) = service(StaticResolver::new().with_host("test-host", &["192.0.2.5"]));
        assert_eq!(
            dns.ip_to_name(&IpAddr::parse("192.0.2.5")).await.as_deref(),
            Some("test-host")
        );
        assert_eq!(dns.ip_to_name(&IpAddr::parse("192.0.2.6")).await, None);
        assert_eq!(dns.ip_to_name(&IpAddr::parse("192.0.2.0/24")).await, None);
    }

    #[tokio::test]
    async fn test_self_ips_include_loopback() {
        let (_, dns) = service(StaticResolver::new());
        let own = dns.self_ips().await;
        assert!(own.contains(&IpAddr::parse("127.0.0.1")));
        assert!(own.contains(&IpAddr::parse("::1")));
    }

    #[test]
    fn test_file_sets_are_shared() {
        let (_, dns) = service(StaticResolver::new());
        let a = dns.ips_from_file(Path::new("/tmp/banwatch-a.lst"));
        let b = dns.ips_from_file(Path::new("/tmp/banwatch-a.lst"));
        assert!(Arc::ptr_eq(&a, &b));
    }
}
