//! Unified IPv4/IPv6/CIDR address model.
//!
//! # Architecture
//!
//! - **IpAddr**: a single address or a network, or a raw token that is not
//!   an address at all (user names, ids, unresolvable host names)
//! - **IpAddrSet**: ordered collection with CIDR-aware membership
//! - **FileIpAddrSet**: an `IpAddrSet` loaded from a file and reloaded when
//!   the file changes
//! - **DnsUtils**: cached forward/reverse resolution and self-IP detection
//!
//! Networks are always stored truncated to their prefix, so two spellings of
//! the same network compare equal. A raw token never equals a parsed
//! address, even when the text is identical.

pub mod dns;
mod set;

pub use dns::{DnsUtils, HickoryResolver, Resolve, StaticResolver, UseDns};
pub use set::{FILE_RECHECK_INTERVAL, FileIpAddrSet, IpAddrSet};

use crate::error::AddrError;
use ipnet::{Ipv4Net, Ipv6Net};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address family of an [`IpAddr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
    Raw,
}

/// An address, a network, or a raw identity token.
///
/// Variant order gives the sort order: IPv4 < IPv6 < Raw.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpAddr {
    V4(Ipv4Net),
    V6(Ipv6Net),
    Raw(String),
}

impl IpAddr {
    /// Parse leniently: anything that is not a valid address becomes `Raw`.
    pub fn parse(text: &str) -> Self {
        text.parse()
            .unwrap_or_else(|_| IpAddr::Raw(text.trim().to_string()))
    }

    /// A raw identity token, never interpreted as an address.
    pub fn raw(text: impl Into<String>) -> Self {
        IpAddr::Raw(text.into())
    }

    pub fn family(&self) -> Family {
        match self {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
            IpAddr::Raw(_) => Family::Raw,
        }
    }

    /// True for parsed IPv4/IPv6 values.
    pub fn is_valid(&self) -> bool {
        !matches!(self, IpAddr::Raw(_))
    }

    /// True for a single host address (full-length prefix).
    pub fn is_single(&self) -> bool {
        match self {
            IpAddr::V4(n) => n.prefix_len() == 32,
            IpAddr::V6(n) => n.prefix_len() == 128,
            IpAddr::Raw(_) => false,
        }
    }

    pub fn prefix_len(&self) -> Option<u8> {
        match self {
            IpAddr::V4(n) => Some(n.prefix_len()),
            IpAddr::V6(n) => Some(n.prefix_len()),
            IpAddr::Raw(_) => None,
        }
    }

    /// Numeric value of the (network) address.
    pub fn value(&self) -> Option<u128> {
        match self {
            IpAddr::V4(n) => Some(u32::from(n.addr()) as u128),
            IpAddr::V6(n) => Some(u128::from(n.addr())),
            IpAddr::Raw(_) => None,
        }
    }

    /// The standard library address, for parsed values.
    pub fn to_std(&self) -> Option<std::net::IpAddr> {
        match self {
            IpAddr::V4(n) => Some(std::net::IpAddr::V4(n.addr())),
            IpAddr::V6(n) => Some(std::net::IpAddr::V6(n.addr())),
            IpAddr::Raw(_) => None,
        }
    }

    /// True iff same family and `self` lies within `net`.
    pub fn is_in_net(&self, net: &IpAddr) -> bool {
        match (self, net) {
            (IpAddr::V4(a), IpAddr::V4(n)) => n.contains(a),
            (IpAddr::V6(a), IpAddr::V6(n)) => n.contains(a),
            _ => false,
        }
    }

    /// True iff `other` lies within this network.
    pub fn contains(&self, other: &IpAddr) -> bool {
        other.is_in_net(self)
    }

    /// Reverse-DNS name, e.g. `1.2.0.192.in-addr.arpa.`.
    pub fn ptr(&self) -> Option<String> {
        match self {
            IpAddr::V4(n) => {
                let o = n.addr().octets();
                Some(format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0]))
            }
            IpAddr::V6(n) => {
                let value = u128::from(n.addr());
                let mut name = String::with_capacity(73);
                for i in 0..32 {
                    let nibble = (value >> (i * 4)) & 0xf;
                    name.push_str(&format!("{:x}.", nibble));
                }
                name.push_str("ip6.arpa.");
                Some(name)
            }
            IpAddr::Raw(_) => None,
        }
    }
}

impl From<std::net::IpAddr> for IpAddr {
    fn from(ip: std::net::IpAddr) -> Self {
        match ip {
            std::net::IpAddr::V4(a) => IpAddr::from(a),
            std::net::IpAddr::V6(a) => match a.to_ipv4_mapped() {
                Some(v4) => IpAddr::from(v4),
                None => IpAddr::from(a),
            },
        }
    }
}

impl From<Ipv4Addr> for IpAddr {
    fn from(a: Ipv4Addr) -> Self {
        IpAddr::V4(Ipv4Net::from(a))
    }
}

impl From<Ipv6Addr> for IpAddr {
    fn from(a: Ipv6Addr) -> Self {
        IpAddr::V6(Ipv6Net::from(a))
    }
}

fn parse_host(text: &str) -> Option<std::net::IpAddr> {
    let text = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .unwrap_or(text);
    text.parse().ok()
}

impl FromStr for IpAddr {
    type Err = AddrError;

    /// Parse `addr`, `addr/prefixlen` or `addr/netmask`.
    ///
    /// Only a bad prefix or netmask is an error; text that is not an address
    /// at all yields `Raw`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let raw = || Ok(IpAddr::Raw(text.to_string()));

        let mut parts = text.split('/');
        let host = parts.next().unwrap_or_default();
        let suffix = parts.next();
        if parts.next().is_some() {
            return raw();
        }
        let Some(addr) = parse_host(host) else {
            return raw();
        };
        let Some(suffix) = suffix else {
            return Ok(IpAddr::from(addr));
        };

        let prefix = if let Ok(plen) = suffix.parse::<u8>() {
            plen
        } else {
            match (addr, suffix.parse::<std::net::IpAddr>()) {
                (std::net::IpAddr::V4(_), Ok(std::net::IpAddr::V4(mask))) => {
                    ipnet::ipv4_mask_to_prefix(mask)
                        .map_err(|_| AddrError::InvalidMask(text.to_string()))?
                }
                (std::net::IpAddr::V6(_), Ok(std::net::IpAddr::V6(mask))) => {
                    ipnet::ipv6_mask_to_prefix(mask)
                        .map_err(|_| AddrError::InvalidMask(text.to_string()))?
                }
                (_, Ok(_)) => return Err(AddrError::InvalidMask(text.to_string())),
                (_, Err(_)) => return raw(),
            }
        };

        match addr {
            std::net::IpAddr::V4(a) => Ipv4Net::new(a, prefix)
                .map(|n| IpAddr::V4(n.trunc()))
                .map_err(|_| AddrError::InvalidPrefix(text.to_string())),
            std::net::IpAddr::V6(a) => Ipv6Net::new(a, prefix)
                .map(|n| IpAddr::V6(n.trunc()))
                .map_err(|_| AddrError::InvalidPrefix(text.to_string())),
        }
    }
}

impl fmt::Display for IpAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddr::V4(n) if n.prefix_len() == 32 => write!(f, "{}", n.addr()),
            IpAddr::V6(n) if n.prefix_len() == 128 => write!(f, "{}", n.addr()),
            IpAddr::V4(n) => write!(f, "{}", n),
            IpAddr::V6(n) => write!(f, "{}", n),
            IpAddr::Raw(s) => f.write_str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let ip = IpAddr::parse("10.0.0.0");
        assert!(ip.is_valid());
        assert!(ip.is_single());
        assert_eq!(ip.family(), Family::V4);
        assert_eq!(ip.value(), Some(167_772_160));
        assert_eq!(ip.to_string(), "10.0.0.0");
    }

    #[test]
    fn test_canonical_forms() {
        for (input, expected) in [
            ("93.184.0.1/24", "93.184.0.0/24"),
            ("93.184.0.1/32", "93.184.0.1"),
            ("93.184.0.1/255.255.255.0", "93.184.0.0/24"),
            ("10.0.0.1/31", "10.0.0.0/31"),
            ("2606:2800:220:1:248:1893:25c8:1946/32", "2606:2800::/32"),
            ("2606:28ff:80ab:fb06:1ff::1/ffff:ff80::", "2606:2880::/25"),
            ("::1/32", "::/32"),
            ("[2001:db8::1]", "2001:db8::1"),
            ("2001:DB8:0:0:0:0:0:1", "2001:db8::1"),
            ("::ffff:141.3.81.106", "141.3.81.106"),
        ] {
            assert_eq!(IpAddr::parse(input).to_string(), expected, "{input}");
        }
    }

    #[test]
    fn test_round_trip() {
        for text in ["192.0.2.1", "2001:db8::1", "::", "10.0.0.0/8", "2001:db8::/48"] {
            let ip = IpAddr::parse(text);
            assert_eq!(IpAddr::parse(&ip.to_string()), ip);
        }
        assert_eq!(IpAddr::parse("::"), IpAddr::parse("0:0:0:0:0:0:0:0"));
    }

    #[test]
    fn test_raw_values() {
        for text in ["some/path/as/id", "1.2.3.4/5/6", "192.168.0.", "abcdef.abcdef", "999.999.999.999", "1.2.3.4/path"] {
            let ip = IpAddr::parse(text);
            assert!(!ip.is_valid(), "{text}");
            assert_eq!(ip.to_string(), text);
        }
        let raw = IpAddr::raw("192.0.2.1");
        assert!(!raw.is_single());
        assert_ne!(raw, IpAddr::parse("192.0.2.1"));
        assert_eq!(raw, IpAddr::raw("192.0.2.1"));
    }

    #[test]
    fn test_invalid_mask() {
        assert!(matches!(
            "192.168.1.0/255.255.0.128".parse::<IpAddr>(),
            Err(AddrError::InvalidMask(_))
        ));
        assert!(matches!(
            "192.168.1.0/33".parse::<IpAddr>(),
            Err(AddrError::InvalidPrefix(_))
        ));
        // lenient parsing degrades to raw
        assert!(!IpAddr::parse("192.168.1.0/255.255.0.128").is_valid());
    }

    #[test]
    fn test_ordering() {
        let mut v = vec![
            IpAddr::raw("abc"),
            IpAddr::parse("2001:db8::1"),
            IpAddr::parse("192.0.2.2"),
            IpAddr::parse("192.0.2.1"),
        ];
        v.sort();
        let s: Vec<String> = v.iter().map(|i| i.to_string()).collect();
        assert_eq!(s, ["192.0.2.1", "192.0.2.2", "2001:db8::1", "abc"]);
    }

    #[test]
    fn test_is_in_net() {
        let net = IpAddr::parse("192.168.1.0/25");
        assert!(IpAddr::parse("192.168.1.0").is_in_net(&net));
        assert!(IpAddr::parse("192.168.1.127").is_in_net(&net));
        assert!(!IpAddr::parse("192.168.1.128").is_in_net(&net));
        assert!(net.is_in_net(&net));
        let wider = IpAddr::parse("192.168.0.0/16");
        assert!(net.is_in_net(&wider));
        assert!(IpAddr::parse("192.168.1.5").is_in_net(&wider));
        assert!(!wider.is_in_net(&net));
        assert!(!IpAddr::parse("::1").is_in_net(&net));
        assert!(IpAddr::parse("::1").is_in_net(&IpAddr::parse("::/32")));
        assert!(!IpAddr::raw("192.168.1.1").is_in_net(&net));
        assert!(wider.contains(&IpAddr::parse("192.168.200.1")));
    }

    #[test]
    fn test_ptr() {
        assert_eq!(
            IpAddr::parse("192.0.2.1").ptr().as_deref(),
            Some("1.2.0.192.in-addr.arpa.")
        );
        assert_eq!(
            IpAddr::parse("2606:2800:220:1:248:1893:25c8:1946").ptr().as_deref(),
            Some("6.4.9.1.8.c.5.2.3.9.8.1.8.4.2.0.1.0.0.0.0.2.2.0.0.0.8.2.6.0.6.2.ip6.arpa.")
        );
        assert_eq!(IpAddr::raw("x").ptr(), None);
    }
}
