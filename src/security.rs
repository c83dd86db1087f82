//! IP admission policy
//!
//! A [`SecurityPolicy`] is an immutable snapshot built from the enabled
//! security list entries when a listener's pipeline is built. Checking a
//! request against it only reads parsed ranges.

use std::net::IpAddr;
use tracing::warn;

use crate::iprange::{any_contains, IpRange};
use crate::model::SecurityListEntry;

/// Name of the blacklist group that abnormal IP promotion writes to
pub const AUTO_BLACKLIST_NAME: &str = "auto-blocked-abnormal-ips";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Whitelist mode is active and the client matched nothing
    NotWhitelisted,
    Blacklisted,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    whitelist_active: bool,
    whitelist: Vec<IpRange>,
    blacklist: Vec<IpRange>,
}

impl SecurityPolicy {
    /// Policy that admits everyone
    pub fn open() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[SecurityListEntry]) -> Self {
        let mut policy = Self::default();
        for entry in entries.iter().filter(|e| e.enabled) {
            if !entry.is_blacklist {
                policy.whitelist_active = true;
            }
            for raw in &entry.ranges {
                match raw.parse::<IpRange>() {
                    Ok(range) if entry.is_blacklist => policy.blacklist.push(range),
                    Ok(range) => policy.whitelist.push(range),
                    Err(e) => {
                        warn!(list = entry.name, error = %e, "Skipping unparseable security range");
                    }
                }
            }
        }
        policy
    }

    /// Any enabled whitelist entry switches the policy to whitelist-only
    pub fn whitelist_mode(&self) -> bool {
        self.whitelist_active
    }

    pub fn check(&self, ip: &IpAddr) -> Admission {
        if self.whitelist_active {
            if any_contains(&self.whitelist, ip) {
                Admission::Allowed
            } else {
                Admission::NotWhitelisted
            }
        } else if any_contains(&self.blacklist, ip) {
            Admission::Blacklisted
        } else {
            Admission::Allowed
        }
    }

    pub fn rule_count(&self) -> usize {
        self.whitelist.len() + self.blacklist.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_open_policy_allows_all() {
        let policy = SecurityPolicy::open();
        assert_eq!(policy.check(&ip("1.2.3.4")), Admission::Allowed);
        assert!(!policy.whitelist_mode());
    }

    #[test]
    fn test_blacklist_blocks() {
        let policy = SecurityPolicy::from_entries(&[SecurityListEntry::blacklist(
            "bad",
            &["10.0.0.0/24", "192.168.1.1-192.168.1.9"],
        )]);
        assert_eq!(policy.check(&ip("10.0.0.7")), Admission::Blacklisted);
        assert_eq!(policy.check(&ip("192.168.1.5")), Admission::Blacklisted);
        assert_eq!(policy.check(&ip("192.168.1.10")), Admission::Allowed);
    }

    #[test]
    fn test_whitelist_suppresses_blacklist() {
        let policy = SecurityPolicy::from_entries(&[
            SecurityListEntry::whitelist("office", &["10.0.0.0/24"]),
            SecurityListEntry::blacklist("bad", &["10.0.0.5"]),
        ]);
        assert!(policy.whitelist_mode());
        // whitelisted and blacklisted: the blacklist is not consulted
        assert_eq!(policy.check(&ip("10.0.0.5")), Admission::Allowed);
        assert_eq!(policy.check(&ip("10.0.1.1")), Admission::NotWhitelisted);
    }

    #[test]
    fn test_disabled_entries_ignored() {
        let mut whitelist = SecurityListEntry::whitelist("office", &["10.0.0.0/24"]);
        whitelist.enabled = false;
        let mut blacklist = SecurityListEntry::blacklist("bad", &["10.0.0.5"]);
        blacklist.enabled = false;

        let policy = SecurityPolicy::from_entries(&[whitelist, blacklist]);
        assert!(!policy.whitelist_mode());
        assert_eq!(policy.check(&ip("10.0.0.5")), Admission::Allowed);
        assert_eq!(policy.check(&ip("8.8.8.8")), Admission::Allowed);
    }

    #[test]
    fn test_ipv4_mapped_client_blacklisted() {
        let policy =
            SecurityPolicy::from_entries(&[SecurityListEntry::blacklist("bad", &["10.9.9.9"])]);
        assert_eq!(policy.check(&ip("::ffff:10.9.9.9")), Admission::Blacklisted);
    }
}
