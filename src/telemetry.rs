//! Process-wide request counters shared by every listener

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Request counters with an explicit enable/disable/reset lifecycle
///
/// One instance is created by the gateway and handed to each listener. While
/// disabled every `record_*` call is a single relaxed load.
#[derive(Debug, Default)]
pub struct GatewayStats {
    enabled: AtomicBool,
    total_requests: AtomicU64,
    blocked: AtomicU64,
    rate_limited: AtomicU64,
    upstream_failures: AtomicU64,
    /// `{second, count}` packed the same way as the monitor buckets
    current_second: AtomicU64,
    last_qps: AtomicU64,
}

/// Point-in-time view of [`GatewayStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enabled: bool,
    pub total_requests: u64,
    pub blocked: u64,
    pub rate_limited: u64,
    pub upstream_failures: u64,
    pub qps: u64,
}

const SECOND_SHIFT: u32 = 24;
const COUNT_MASK: u64 = (1 << SECOND_SHIFT) - 1;

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.blocked.store(0, Ordering::Relaxed);
        self.rate_limited.store(0, Ordering::Relaxed);
        self.upstream_failures.store(0, Ordering::Relaxed);
        self.current_second.store(0, Ordering::Relaxed);
        self.last_qps.store(0, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        if !self.is_enabled() {
            return;
        }
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.tick(unix_secs());
    }

    pub fn record_blocked(&self) {
        if self.is_enabled() {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rate_limited(&self) {
        if self.is_enabled() {
            self.rate_limited.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_upstream_failure(&self) {
        if self.is_enabled() {
            self.upstream_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn tick(&self, now: u64) {
        let mut current = self.current_second.load(Ordering::Relaxed);
        loop {
            let second = current >> SECOND_SHIFT;
            let next = if second == now {
                current + 1
            } else {
                (now << SECOND_SHIFT) | 1
            };
            match self.current_second.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if second != now && second + 1 == now {
                        self.last_qps.store(current & COUNT_MASK, Ordering::Relaxed);
                    } else if second != now {
                        self.last_qps.store(0, Ordering::Relaxed);
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Requests completed in the last full second
    pub fn qps(&self) -> u64 {
        self.qps_at(unix_secs())
    }

    fn qps_at(&self, now: u64) -> u64 {
        let current = self.current_second.load(Ordering::Relaxed);
        let second = current >> SECOND_SHIFT;
        if second == now {
            self.last_qps.load(Ordering::Relaxed)
        } else if second + 1 == now {
            current & COUNT_MASK
        } else {
            0
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enabled: self.is_enabled(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            qps: self.qps(),
        }
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_records_nothing() {
        let stats = GatewayStats::new();
        stats.record_request();
        stats.record_blocked();
        let snap = stats.snapshot();
        assert!(!snap.enabled);
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.blocked, 0);
    }

    #[test]
    fn test_counters_and_reset() {
        let stats = GatewayStats::new();
        stats.enable();
        stats.record_request();
        stats.record_request();
        stats.record_blocked();
        stats.record_rate_limited();
        stats.record_upstream_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.blocked, 1);
        assert_eq!(snap.rate_limited, 1);
        assert_eq!(snap.upstream_failures, 1);

        stats.reset();
        let snap = stats.snapshot();
        assert!(snap.enabled);
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.blocked, 0);
    }

    #[test]
    fn test_qps_uses_previous_second() {
        let stats = GatewayStats::new();
        stats.tick(100);
        stats.tick(100);
        stats.tick(100);
        assert_eq!(stats.qps_at(100), 0);
        assert_eq!(stats.qps_at(101), 3);

        stats.tick(101);
        assert_eq!(stats.qps_at(101), 3);
        assert_eq!(stats.qps_at(105), 0);
    }
}
