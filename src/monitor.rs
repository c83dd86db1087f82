//! Abnormal IP detection
//!
//! Every error response a listener produces or relays is recorded against the
//! client IP. Each IP owns a ring of twelve 5-second buckets, so the windowed
//! count always covers the last 60 seconds. A bucket is one `AtomicU64` holding
//! `{bucket_key, count}`; writing to a bucket whose key is stale swaps in the
//! current key with a count of one.
//!
//! Recording only loads and compare-and-swaps atomics. Entries live in a fixed
//! open-addressed table of `ArcSwapOption` slots; a new IP claims an empty
//! slot by CAS, and each entry's error descriptions go into twenty slots
//! claimed the same way.
//!
//! Reads go through [`AbnormalIpMonitor::snapshot`], which is best-effort: it
//! may miss increments racing with it, and it is where idle entries get evicted.
//! Eviction copies live entries into a fresh table and swaps it in; an error
//! recorded for a brand new IP during that copy can be lost.

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::{DefaultHasher, RandomState};
use std::hash::{BuildHasher, Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::iprange::canonical;

const BUCKET_COUNT: usize = 12;
const BUCKET_SECS: u64 = 5;
const KEY_SHIFT: u32 = 24;
const COUNT_MASK: u64 = (1 << KEY_SHIFT) - 1;
const MAX_DISTINCT_ERRORS: usize = 20;

/// Source of "now" in whole seconds since the epoch
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start_secs: u64) -> Self {
        Self(AtomicU64::new(start_secs))
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_secs(), Ordering::SeqCst);
    }

    pub fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Detection thresholds
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub threshold: u64,
    pub retention: Duration,
    pub eviction: Duration,
    pub max_tracked_ips: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            threshold: config.threshold,
            retention: config.retention(),
            eviction: config.eviction(),
            max_tracked_ips: config.max_tracked_ips,
        }
    }
}

/// One error response as seen by a listener
#[derive(Debug, Clone)]
pub struct ErrorEvent<'a> {
    pub service_id: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub status: u16,
}

impl ErrorEvent<'_> {
    fn description(&self) -> String {
        let reason = hyper::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Error");
        format!("{} {}", self.status, reason)
    }
}

/// Metadata of the most recent error recorded for an IP
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastError {
    pub service_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub at: DateTime<Utc>,
}

/// One row of an entry's error frequency table
#[derive(Debug, Default)]
struct ErrorSlot {
    /// Hash of the description; zero while the slot is free
    hash: AtomicU64,
    count: AtomicU64,
    description: OnceLock<String>,
}

#[derive(Debug)]
struct IpEntry {
    ip: IpAddr,
    buckets: [AtomicU64; BUCKET_COUNT],
    total_errors: AtomicU64,
    first_seen: AtomicU64,
    last_seen: AtomicU64,
    /// Zero until the window first crosses the threshold
    last_abnormal_at: AtomicU64,
    errors: [ErrorSlot; MAX_DISTINCT_ERRORS],
    last_error: Mutex<Option<LastError>>,
}

impl IpEntry {
    fn new(ip: IpAddr, now: u64) -> Self {
        Self {
            ip,
            buckets: Default::default(),
            total_errors: AtomicU64::new(0),
            first_seen: AtomicU64::new(now),
            last_seen: AtomicU64::new(now),
            last_abnormal_at: AtomicU64::new(0),
            errors: Default::default(),
            last_error: Mutex::new(None),
        }
    }

    fn bump_bucket(&self, now: u64) {
        let key = now / BUCKET_SECS;
        let slot = &self.buckets[(key % BUCKET_COUNT as u64) as usize];
        let mut current = slot.load(Ordering::Relaxed);
        loop {
            let next = if current >> KEY_SHIFT == key {
                if current & COUNT_MASK == COUNT_MASK {
                    return;
                }
                current + 1
            } else {
                (key << KEY_SHIFT) | 1
            };
            match slot.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn window_count(&self, now: u64) -> u64 {
        let current_key = now / BUCKET_SECS;
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .filter(|packed| {
                let key = packed >> KEY_SHIFT;
                key <= current_key && key + (BUCKET_COUNT as u64) > current_key
            })
            .map(|packed| packed & COUNT_MASK)
            .sum()
    }

    /// Count one occurrence; descriptions past the twentieth are dropped
    fn count_error(&self, description: String) {
        let hash = description_hash(&description);
        for slot in &self.errors {
            let current = slot.hash.load(Ordering::Acquire);
            if current == hash {
                slot.count.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if current != 0 {
                continue;
            }
            match slot
                .hash
                .compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // only the CAS winner initializes the cell, so this never waits
                    let _ = slot.description.set(description);
                    slot.count.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(actual) if actual == hash => {
                    slot.count.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(_) => {}
            }
        }
    }

    fn top_errors(&self) -> Vec<(String, u64)> {
        let mut errors: Vec<(String, u64)> = self
            .errors
            .iter()
            .filter_map(|slot| {
                let description = slot.description.get()?;
                Some((description.clone(), slot.count.load(Ordering::Relaxed)))
            })
            .collect();
        errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        errors
    }

    fn idle(&self, now: u64, eviction: u64) -> bool {
        now.saturating_sub(self.last_seen.load(Ordering::Relaxed)) > eviction
    }
}

fn description_hash(description: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    description.hash(&mut hasher);
    hasher.finish().max(1)
}

/// Fixed-size open-addressed map from IP to entry
///
/// Slots go from empty to occupied exactly once, so a probe for an IP can
/// stop at the first empty slot. Removal happens by building a new table.
struct IpTable {
    slots: Box<[ArcSwapOption<IpEntry>]>,
    hasher: RandomState,
    len: AtomicUsize,
    capacity: usize,
    full_warned: AtomicBool,
}

impl IpTable {
    fn new(capacity: usize, hasher: RandomState) -> Self {
        let capacity = capacity.max(1);
        // at most half full keeps probes short
        let size = (capacity * 2).next_power_of_two().max(16);
        Self {
            slots: (0..size).map(|_| ArcSwapOption::empty()).collect(),
            hasher,
            len: AtomicUsize::new(0),
            capacity,
            full_warned: AtomicBool::new(false),
        }
    }

    fn probe(&self, ip: &IpAddr) -> impl Iterator<Item = &ArcSwapOption<IpEntry>> {
        let mask = self.slots.len() - 1;
        let start = self.hasher.hash_one(ip) as usize & mask;
        (0..self.slots.len()).map(move |i| &self.slots[(start + i) & mask])
    }

    fn get(&self, ip: &IpAddr) -> Option<Arc<IpEntry>> {
        for slot in self.probe(ip) {
            match slot.load_full() {
                Some(entry) if entry.ip == *ip => return Some(entry),
                Some(_) => continue,
                None => return None,
            }
        }
        None
    }

    /// Entry for `ip`, claiming an empty slot for `make()` if there is none
    ///
    /// Returns `None` when the table is at capacity.
    fn get_or_insert_with<F>(&self, ip: IpAddr, make: F) -> Option<Arc<IpEntry>>
    where
        F: FnOnce() -> Arc<IpEntry>,
    {
        let mut make = Some(make);
        let mut candidate: Option<Arc<IpEntry>> = None;
        for slot in self.probe(&ip) {
            let occupant = match slot.load_full() {
                Some(entry) => entry,
                None => {
                    if self.len.load(Ordering::Relaxed) >= self.capacity {
                        return None;
                    }
                    let entry = match (candidate.take(), make.take()) {
                        (Some(entry), _) => entry,
                        (None, Some(make)) => make(),
                        (None, None) => return None,
                    };
                    let empty: Option<Arc<IpEntry>> = None;
                    let previous = slot.compare_and_swap(&empty, Some(Arc::clone(&entry)));
                    match &*previous {
                        None => {
                            self.len.fetch_add(1, Ordering::Relaxed);
                            return Some(entry);
                        }
                        Some(winner) => {
                            candidate = Some(entry);
                            Arc::clone(winner)
                        }
                    }
                }
            };
            if occupant.ip == ip {
                return Some(occupant);
            }
        }
        None
    }

    fn entries(&self) -> impl Iterator<Item = Arc<IpEntry>> + '_ {
        self.slots.iter().filter_map(|slot| slot.load_full())
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

/// Serializable view of one tracked IP
#[derive(Debug, Clone, Serialize)]
pub struct AbnormalIpStats {
    pub ip: IpAddr,
    pub window_count: u64,
    pub total_errors: u64,
    pub abnormal: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_abnormal_at: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
    pub top_errors: Vec<(String, u64)>,
}

/// One page of abnormal IPs
#[derive(Debug, Clone, Serialize)]
pub struct AbnormalIpPage {
    pub items: Vec<AbnormalIpStats>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

pub struct AbnormalIpMonitor {
    table: ArcSwap<IpTable>,
    /// Serializes eviction passes; `record` never takes it
    evicting: Mutex<()>,
    settings: MonitorSettings,
    clock: Arc<dyn Clock>,
}

impl AbnormalIpMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: MonitorSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            table: ArcSwap::from_pointee(IpTable::new(
                settings.max_tracked_ips,
                RandomState::new(),
            )),
            evicting: Mutex::new(()),
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Record one error response for `ip`
    pub fn record(&self, ip: IpAddr, event: &ErrorEvent<'_>) {
        let ip = canonical(&ip);
        let now = self.clock.now_secs();

        let table = self.table.load();
        let Some(entry) = table.get_or_insert_with(ip, || Arc::new(IpEntry::new(ip, now))) else {
            if !table.full_warned.swap(true, Ordering::Relaxed) {
                warn!(
                    capacity = table.capacity,
                    "Abnormal IP table full; new addresses are not tracked until idle ones are evicted"
                );
            }
            return;
        };

        entry.bump_bucket(now);
        entry.total_errors.fetch_add(1, Ordering::Relaxed);
        entry.last_seen.fetch_max(now, Ordering::Relaxed);
        entry.count_error(event.description());

        if let Some(mut last) = entry.last_error.try_lock() {
            *last = Some(LastError {
                service_id: event.service_id.to_string(),
                method: event.method.to_string(),
                path: event.path.to_string(),
                status: event.status,
                at: to_datetime(now),
            });
        }

        if entry.window_count(now) >= self.settings.threshold {
            let previous = entry.last_abnormal_at.swap(now, Ordering::Relaxed);
            if previous == 0 || now.saturating_sub(previous) > self.settings.retention.as_secs() {
                info!(ip = %ip, threshold = self.settings.threshold, "IP crossed abnormal error threshold");
            }
        }
    }

    /// Stats for one IP regardless of whether it is currently abnormal
    pub fn get(&self, ip: &IpAddr) -> Option<AbnormalIpStats> {
        let ip = canonical(ip);
        let now = self.clock.now_secs();
        let entry = self.table.load().get(&ip)?;
        Some(self.stats_for(ip, &entry, now))
    }

    /// Currently abnormal IPs, most active first
    pub fn snapshot(&self) -> Vec<AbnormalIpStats> {
        let now = self.clock.now_secs();
        self.evict_idle(now);

        let retention = self.settings.retention.as_secs();
        let mut result: Vec<AbnormalIpStats> = self
            .table
            .load()
            .entries()
            .filter_map(|entry| {
                let window = entry.window_count(now);
                let abnormal_at = entry.last_abnormal_at.load(Ordering::Relaxed);
                let retained = abnormal_at != 0 && now.saturating_sub(abnormal_at) <= retention;
                if window >= self.settings.threshold || retained {
                    Some(self.stats_for(entry.ip, &entry, now))
                } else {
                    None
                }
            })
            .collect();

        result.sort_by(|a, b| {
            b.window_count
                .cmp(&a.window_count)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        result
    }

    /// One page of [`Self::snapshot`], pages start at 1
    pub fn page(&self, page: usize, page_size: usize) -> AbnormalIpPage {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 500);
        let all = self.snapshot();
        let total = all.len();
        let items = all
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();
        AbnormalIpPage {
            items,
            total,
            page,
            page_size,
        }
    }

    /// Number of tracked IPs, abnormal or not
    pub fn tracked(&self) -> usize {
        self.table.load().len()
    }

    fn evict_idle(&self, now: u64) {
        let eviction = self.settings.eviction.as_secs();
        if !self.table.load().entries().any(|e| e.idle(now, eviction)) {
            return;
        }

        let _pass = self.evicting.lock();
        let old = self.table.load_full();
        let fresh = Arc::new(IpTable::new(old.capacity, old.hasher.clone()));
        let mut evicted = 0usize;
        for entry in old.entries() {
            if entry.idle(now, eviction) {
                debug!(ip = %entry.ip, "Evicted idle abnormal IP entry");
                evicted += 1;
            } else {
                fresh.get_or_insert_with(entry.ip, || entry);
            }
        }
        self.table.store(Arc::clone(&fresh));

        // entries that landed in the old table while it was being copied
        for entry in old.entries() {
            if !entry.idle(now, eviction) {
                fresh.get_or_insert_with(entry.ip, || entry);
            }
        }
        if evicted > 0 {
            debug!(evicted, remaining = fresh.len(), "Abnormal IP table compacted");
        }
    }

    fn stats_for(&self, ip: IpAddr, entry: &IpEntry, now: u64) -> AbnormalIpStats {
        let window_count = entry.window_count(now);
        let abnormal_at = entry.last_abnormal_at.load(Ordering::Relaxed);
        AbnormalIpStats {
            ip,
            window_count,
            total_errors: entry.total_errors.load(Ordering::Relaxed),
            abnormal: window_count >= self.settings.threshold,
            first_seen: to_datetime(entry.first_seen.load(Ordering::Relaxed)),
            last_seen: to_datetime(entry.last_seen.load(Ordering::Relaxed)),
            last_abnormal_at: (abnormal_at != 0).then(|| to_datetime(abnormal_at)),
            last_error: entry.last_error.lock().clone(),
            top_errors: entry.top_errors(),
        }
    }
}

fn to_datetime(secs: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}
