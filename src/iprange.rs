//! IP range syntax used by security lists and rate limit exemptions
//!
//! Three forms are accepted: an exact address (`10.0.0.1`), CIDR notation
//! (`10.0.0.0/24`, `2001:db8::/32`) and an inclusive dash range
//! (`10.0.0.1-10.0.0.50`). Parsing happens when a rule is written; matching
//! works on the parsed form only.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRange {
    Exact(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
    Span { start: IpAddr, end: IpAddr },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid IP range '{input}': {reason}")]
pub struct IpRangeError {
    input: String,
    reason: &'static str,
}

impl IpRangeError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

impl FromStr for IpRange {
    type Err = IpRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input.is_empty() {
            return Err(IpRangeError::new(s, "empty"));
        }

        if let Some((addr, prefix)) = input.split_once('/') {
            let network: IpAddr = addr
                .trim()
                .parse()
                .map_err(|_| IpRangeError::new(s, "bad network address"))?;
            let prefix: u8 = prefix
                .trim()
                .parse()
                .map_err(|_| IpRangeError::new(s, "bad prefix length"))?;
            let max = match network {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max {
                return Err(IpRangeError::new(s, "prefix length out of range"));
            }
            // mapped networks are stored as IPv4 so they match canonical clients
            if let (IpAddr::V6(_), IpAddr::V4(v4)) = (network, canonical(&network)) {
                if prefix < 96 {
                    return Err(IpRangeError::new(
                        s,
                        "IPv4-mapped network needs a prefix of at least 96",
                    ));
                }
                return Ok(IpRange::Cidr {
                    network: IpAddr::V4(v4),
                    prefix: prefix - 96,
                });
            }
            return Ok(IpRange::Cidr { network, prefix });
        }

        if let Some((start, end)) = input.split_once('-') {
            let start: IpAddr = start
                .trim()
                .parse()
                .map_err(|_| IpRangeError::new(s, "bad start address"))?;
            let end: IpAddr = end
                .trim()
                .parse()
                .map_err(|_| IpRangeError::new(s, "bad end address"))?;
            let (start, end) = (canonical(&start), canonical(&end));
            if start.is_ipv4() != end.is_ipv4() {
                return Err(IpRangeError::new(s, "mixed address families"));
            }
            if to_bits(&start) > to_bits(&end) {
                return Err(IpRangeError::new(s, "start is after end"));
            }
            return Ok(IpRange::Span { start, end });
        }

        input
            .parse()
            .map(|addr| IpRange::Exact(canonical(&addr)))
            .map_err(|_| IpRangeError::new(s, "not an IP address"))
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpRange::Exact(addr) => write!(f, "{}", addr),
            IpRange::Cidr { network, prefix } => write!(f, "{}/{}", network, prefix),
            IpRange::Span { start, end } => write!(f, "{}-{}", start, end),
        }
    }
}

impl IpRange {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = canonical(ip);
        match self {
            IpRange::Exact(addr) => canonical(addr) == ip,
            IpRange::Cidr { network, prefix } => match (network, &ip) {
                (IpAddr::V4(net), IpAddr::V4(addr)) => {
                    let mask = mask_v4(*prefix);
                    (u32::from(*net) & mask) == (u32::from(*addr) & mask)
                }
                (IpAddr::V6(net), IpAddr::V6(addr)) => {
                    let mask = mask_v6(*prefix);
                    (u128::from(*net) & mask) == (u128::from(*addr) & mask)
                }
                _ => false,
            },
            IpRange::Span { start, end } => {
                if start.is_ipv4() != ip.is_ipv4() {
                    return false;
                }
                let value = to_bits(&ip);
                value >= to_bits(start) && value <= to_bits(end)
            }
        }
    }
}

/// Any of the ranges contains the address
pub fn any_contains(ranges: &[IpRange], ip: &IpAddr) -> bool {
    ranges.iter().any(|r| r.contains(ip))
}

/// Parse a list of range strings, failing on the first malformed entry
pub fn parse_all<S: AsRef<str>>(ranges: &[S]) -> Result<Vec<IpRange>, IpRangeError> {
    ranges.iter().map(|r| r.as_ref().parse()).collect()
}

/// Treat IPv4-mapped IPv6 clients (dual-stack sockets) as plain IPv4
pub fn canonical(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => *ip,
        },
        IpAddr::V4(_) => *ip,
    }
}

fn to_bits(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(*v4) as u128,
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

fn mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_exact_match() {
        let range: IpRange = "192.168.1.10".parse().unwrap();
        assert!(range.contains(&ip("192.168.1.10")));
        assert!(!range.contains(&ip("192.168.1.11")));
    }

    #[test]
    fn test_cidr_match() {
        let range: IpRange = "10.0.0.0/24".parse().unwrap();
        assert!(range.contains(&ip("10.0.0.5")));
        assert!(range.contains(&ip("10.0.0.255")));
        assert!(!range.contains(&ip("10.0.1.5")));
        assert!(!range.contains(&ip("::1")));

        let everything: IpRange = "0.0.0.0/0".parse().unwrap();
        assert!(everything.contains(&ip("203.0.113.9")));
    }

    #[test]
    fn test_cidr_v6() {
        let range: IpRange = "2001:db8::/32".parse().unwrap();
        assert!(range.contains(&ip("2001:db8:1::1")));
        assert!(!range.contains(&ip("2001:db9::1")));
    }

    #[test]
    fn test_dash_range() {
        let range: IpRange = "10.0.0.10 - 10.0.0.20".parse().unwrap();
        assert!(range.contains(&ip("10.0.0.10")));
        assert!(range.contains(&ip("10.0.0.15")));
        assert!(range.contains(&ip("10.0.0.20")));
        assert!(!range.contains(&ip("10.0.0.21")));
        assert!(!range.contains(&ip("::a")));
    }

    #[test]
    fn test_ipv4_mapped_client() {
        let range: IpRange = "10.0.0.0/8".parse().unwrap();
        assert!(range.contains(&ip("::ffff:10.1.2.3")));
    }

    #[test]
    fn test_mapped_ranges_match_ipv4_clients() {
        let cidr: IpRange = "::ffff:10.0.0.0/104".parse().unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.0/8");
        assert!(cidr.contains(&ip("10.9.8.7")));
        assert!(cidr.contains(&ip("::ffff:10.9.8.7")));
        assert!(!cidr.contains(&ip("11.0.0.1")));

        let span: IpRange = "::ffff:192.0.2.1-::ffff:192.0.2.9".parse().unwrap();
        assert!(span.contains(&ip("192.0.2.5")));
        assert!(!span.contains(&ip("192.0.2.10")));

        // a mapped start with a plain IPv4 end is one family after folding
        assert!("::ffff:192.0.2.1-192.0.2.9".parse::<IpRange>().is_ok());

        let exact: IpRange = "::ffff:198.51.100.7".parse().unwrap();
        assert_eq!(exact, IpRange::Exact(ip("198.51.100.7")));

        assert!("::ffff:0.0.0.0/64".parse::<IpRange>().is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("".parse::<IpRange>().is_err());
        assert!("10.0.0".parse::<IpRange>().is_err());
        assert!("10.0.0.0/33".parse::<IpRange>().is_err());
        assert!("10.0.0.0/abc".parse::<IpRange>().is_err());
        assert!("10.0.0.9-10.0.0.1".parse::<IpRange>().is_err());
        assert!("10.0.0.1-::1".parse::<IpRange>().is_err());
        assert!("hello".parse::<IpRange>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for input in ["10.0.0.1", "10.0.0.0/8", "1.1.1.1-1.1.1.9"] {
            let range: IpRange = input.parse().unwrap();
            assert_eq!(range.to_string(), input);
        }
    }

    #[test]
    fn test_parse_all_fails_on_first_bad() {
        assert!(parse_all(&["10.0.0.1", "bad"]).is_err());
        assert_eq!(parse_all(&["10.0.0.1", "10.0.0.2"]).unwrap().len(), 2);
    }
}
