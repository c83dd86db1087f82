//! Fixed-window request throttling
//!
//! Counters are keyed by `(rule, client ip, endpoint key)`. A rule whose
//! endpoint is the catch-all `*` counts every request from an IP together;
//! any other rule counts per `method:path`. Windows are aligned to the epoch,
//! so a `1m` rule resets at the top of every minute.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::iprange::{any_contains, canonical, IpRange};
use crate::model::{parse_period, RateLimitRule};
use crate::monitor::{Clock, SystemClock};

/// Counters are pruned of expired windows once every this many checks
const PRUNE_EVERY: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

/// `*` or `<method>:<path>`; method may be `*`, path may end with `*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPattern {
    method: Option<String>,
    path: String,
    prefix: bool,
}

impl EndpointPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern == "*" {
            return Self {
                method: None,
                path: String::new(),
                prefix: true,
            };
        }
        let (method, path) = match pattern.split_once(':') {
            Some((method, path)) => (method.trim(), path.trim()),
            None => ("*", pattern),
        };
        let method = if method == "*" {
            None
        } else {
            Some(method.to_ascii_uppercase())
        };
        let (path, prefix) = match path.strip_suffix('*') {
            Some(stem) => (stem.to_ascii_lowercase(), true),
            None => (path.to_ascii_lowercase(), false),
        };
        Self {
            method,
            path,
            prefix,
        }
    }

    pub fn is_catch_all(&self) -> bool {
        self.method.is_none() && self.prefix && self.path.is_empty()
    }

    pub fn matches(&self, method: &str, path: &str) -> bool {
        if let Some(expected) = &self.method {
            if !expected.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        let path = path.to_ascii_lowercase();
        if self.prefix {
            path.starts_with(&self.path)
        } else {
            path == self.path
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    endpoint: EndpointPattern,
    period_secs: u64,
    limit: u64,
    ip_whitelist: Vec<IpRange>,
    endpoint_whitelist: Vec<EndpointPattern>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: u64,
    count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    rule: usize,
    ip: IpAddr,
    endpoint: String,
}

pub struct RateLimiter {
    rules: Vec<CompiledRule>,
    counters: DashMap<CounterKey, Window>,
    checks: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(rules: &[RateLimitRule]) -> Self {
        Self::with_clock(rules, Arc::new(SystemClock))
    }

    pub fn with_clock(rules: &[RateLimitRule], clock: Arc<dyn Clock>) -> Self {
        let compiled = rules
            .iter()
            .filter(|r| r.enabled)
            .filter_map(|rule| {
                let Some(period) = parse_period(&rule.period) else {
                    warn!(endpoint = rule.endpoint, period = rule.period, "Skipping rate limit with bad period");
                    return None;
                };
                let ip_whitelist = rule
                    .ip_whitelist
                    .iter()
                    .filter_map(|r| r.parse::<IpRange>().ok())
                    .collect();
                Some(CompiledRule {
                    endpoint: EndpointPattern::parse(&rule.endpoint),
                    period_secs: period.as_secs().max(1),
                    limit: rule.limit,
                    ip_whitelist,
                    endpoint_whitelist: rule
                        .endpoint_whitelist
                        .iter()
                        .map(|p| EndpointPattern::parse(p))
                        .collect(),
                })
            })
            .collect();

        Self {
            rules: compiled,
            counters: DashMap::new(),
            checks: AtomicU64::new(0),
            clock,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Count the request against every matching rule
    pub fn check(&self, ip: &IpAddr, method: &str, path: &str) -> RateDecision {
        if self.rules.is_empty() {
            return RateDecision::Allowed;
        }
        let now = self.clock.now_secs();
        let ip = canonical(ip);

        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune(now);
        }

        let mut decision = RateDecision::Allowed;
        for (index, rule) in self.rules.iter().enumerate() {
            if !rule.endpoint.matches(method, path) {
                continue;
            }
            if any_contains(&rule.ip_whitelist, &ip) {
                continue;
            }
            if rule.endpoint_whitelist.iter().any(|p| p.matches(method, path)) {
                continue;
            }

            let endpoint = if rule.endpoint.is_catch_all() {
                "*".to_string()
            } else {
                format!("{}:{}", method.to_ascii_uppercase(), path.to_ascii_lowercase())
            };
            let key = CounterKey {
                rule: index,
                ip,
                endpoint,
            };
            let window_start = now - now % rule.period_secs;

            let mut window = self.counters.entry(key).or_insert(Window {
                started: window_start,
                count: 0,
            });
            if window.started != window_start {
                window.started = window_start;
                window.count = 0;
            }
            window.count += 1;

            if window.count > rule.limit {
                let retry_after_secs = (window_start + rule.period_secs - now).max(1);
                debug!(ip = %ip, method, path, limit = rule.limit, "Rate limit exceeded");
                decision = match decision {
                    RateDecision::Limited { retry_after_secs: prev } => RateDecision::Limited {
                        retry_after_secs: prev.max(retry_after_secs),
                    },
                    RateDecision::Allowed => RateDecision::Limited { retry_after_secs },
                };
            }
        }
        decision
    }

    fn prune(&self, now: u64) {
        self.counters.retain(|key, window| {
            let period = self.rules.get(key.rule).map(|r| r.period_secs).unwrap_or(1);
            window.started + period > now
        });
    }

    #[cfg(test)]
    fn counter_count(&self) -> usize {
        self.counters.len()
    }
}
