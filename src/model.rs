//! Persisted configuration entities
//!
//! These records are what the store loads and saves. Every write path calls the
//! matching `validate` function first so nothing malformed ever reaches the
//! database or a running listener.

use crate::error::GatewayError;
use crate::iprange::IpRange;
use chrono::{DateTime, Utc};
use hyper::Uri;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// One gateway endpoint bound to a port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub listen_port: u16,
    #[serde(default)]
    pub is_https: bool,
    /// Persisted for the admin layer; listeners serve HTTP/1.1 and HTTP/2
    #[serde(default)]
    pub enable_http3: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Upstream request timeout (falls back to the proxy default)
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(name: &str, listen_port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            listen_port,
            is_https: false,
            enable_http3: false,
            enabled: true,
            request_timeout_secs: None,
            locations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_location(mut self, mut location: Location) -> Self {
        location.service_id = self.id.clone();
        self.locations.push(location);
        self
    }

    pub fn request_timeout(&self, default: Duration) -> Duration {
        self.request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

/// One path-matched rule within a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    #[serde(default)]
    pub service_id: String,
    pub path: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    pub kind: LocationKind,
}

impl Location {
    pub fn new(path: &str, kind: LocationKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service_id: String::new(),
            path: path.to_string(),
            hosts: Vec::new(),
            kind,
        }
    }

    pub fn single(path: &str, target: &str) -> Self {
        Self::new(
            path,
            LocationKind::SingleUpstream {
                proxy_target: target.to_string(),
                host_override: None,
            },
        )
    }

    pub fn with_hosts(mut self, hosts: &[&str]) -> Self {
        self.hosts = hosts.iter().map(|h| h.to_string()).collect();
        self
    }
}

/// What a location does with a matched request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocationKind {
    SingleUpstream {
        proxy_target: String,
        #[serde(default)]
        host_override: Option<String>,
    },
    LoadBalanced {
        upstreams: Vec<UpStream>,
        #[serde(default)]
        algorithm: LoadBalanceAlgorithm,
    },
    StaticFiles {
        root_dir: String,
        #[serde(default)]
        try_files: Vec<String>,
    },
}

/// One weighted destination in a load-balanced cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpStream {
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl UpStream {
    pub fn new(address: &str, weight: u32) -> Self {
        Self {
            address: address.to_string(),
            weight,
        }
    }
}

/// Upstream selection algorithm for load-balanced locations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceAlgorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    IpHash,
    Random,
    LeastRequests,
}

/// Renewal state of a certificate record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewStatus {
    #[default]
    NotRenewed,
    Success,
    Failed,
}

/// Where a certificate's material lives on disk
///
/// With a password the file is a sealed bundle (see [`crate::bundle`]);
/// without one it is a PEM file holding the chain followed by the key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertificateFile {
    pub path: String,
    #[serde(default)]
    pub password: Option<String>,
}

/// One domain's TLS material
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: String,
    pub domain: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub files: Option<CertificateFile>,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub renewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub renew_status: RenewStatus,
    #[serde(default)]
    pub expired: bool,
    #[serde(default)]
    pub auto_renew: bool,
}

impl Certificate {
    pub fn new(domain: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            domain: domain.to_lowercase(),
            email: None,
            files: None,
            not_after: None,
            renewed_at: None,
            renew_status: RenewStatus::NotRenewed,
            expired: false,
            auto_renew: false,
        }
    }

    /// Whether the record should be served from the certificate store
    pub fn is_servable(&self, now: DateTime<Utc>) -> bool {
        if self.expired || self.files.is_none() {
            return false;
        }
        self.not_after.map(|na| na > now).unwrap_or(true)
    }
}

/// One blacklist or whitelist rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityListEntry {
    pub id: String,
    pub name: String,
    pub is_blacklist: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub ranges: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Created by abnormal IP promotion rather than an operator
    #[serde(default)]
    pub auto_generated: bool,
}

impl SecurityListEntry {
    pub fn blacklist(name: &str, ranges: &[&str]) -> Self {
        Self::new(name, true, ranges)
    }

    pub fn whitelist(name: &str, ranges: &[&str]) -> Self {
        Self::new(name, false, ranges)
    }

    fn new(name: &str, is_blacklist: bool, ranges: &[&str]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            is_blacklist,
            enabled: true,
            ranges: ranges.iter().map(|r| r.to_string()).collect(),
            description: None,
            auto_generated: false,
        }
    }
}

/// One throttling rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub id: String,
    /// `*` or `<method>:<path>`, method may be `*`, path may end with `*`
    pub endpoint: String,
    /// `<n>s`, `<n>m`, `<n>h` or `<n>d`
    pub period: String,
    pub limit: u64,
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    #[serde(default)]
    pub endpoint_whitelist: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RateLimitRule {
    pub fn new(endpoint: &str, period: &str, limit: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            endpoint: endpoint.to_string(),
            period: period.to_string(),
            limit,
            ip_whitelist: Vec::new(),
            endpoint_whitelist: Vec::new(),
            enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

/// Parse a rate limit period such as `1s`, `15m`, `12h` or `7d`
pub fn parse_period(period: &str) -> Option<Duration> {
    let period = period.trim();
    if period.len() < 2 {
        return None;
    }
    let (value, unit) = period.split_at(period.len() - 1);
    let value: u64 = value.parse().ok()?;
    if value == 0 {
        return None;
    }
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 60 * 60,
        "d" => value * 24 * 60 * 60,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

fn is_proxy_url(target: &str) -> bool {
    match target.parse::<Uri>() {
        Ok(uri) => {
            matches!(uri.scheme_str(), Some("http") | Some("https")) && uri.authority().is_some()
        }
        Err(_) => false,
    }
}

/// Validate a service and its locations before it is persisted
pub fn validate_service(service: &ServiceInstance) -> Result<(), GatewayError> {
    if service.name.trim().is_empty() {
        return Err(GatewayError::validation("service name must not be empty"));
    }
    if service.listen_port == 0 {
        return Err(GatewayError::validation(format!(
            "service '{}': listen port must be greater than 0",
            service.name
        )));
    }

    let mut seen = HashSet::new();
    for location in &service.locations {
        if !seen.insert(location.id.as_str()) {
            return Err(GatewayError::validation(format!(
                "service '{}': duplicate location id '{}'",
                service.name, location.id
            )));
        }
        validate_location(location)?;
    }
    Ok(())
}

fn validate_location(location: &Location) -> Result<(), GatewayError> {
    if location.path.trim().is_empty() {
        return Err(GatewayError::validation(format!(
            "location '{}': path is required",
            location.id
        )));
    }
    if !location.path.starts_with('/') {
        return Err(GatewayError::validation(format!(
            "location '{}': path '{}' must start with '/'",
            location.id, location.path
        )));
    }

    match &location.kind {
        LocationKind::SingleUpstream { proxy_target, .. } => {
            if !is_proxy_url(proxy_target) {
                return Err(GatewayError::validation(format!(
                    "location '{}': proxy target '{}' is not an http(s) URL",
                    location.id, proxy_target
                )));
            }
        }
        LocationKind::LoadBalanced { upstreams, .. } => {
            let mut usable = 0;
            for upstream in upstreams {
                if upstream.address.trim().is_empty() {
                    continue;
                }
                if !is_proxy_url(&upstream.address) {
                    return Err(GatewayError::validation(format!(
                        "location '{}': upstream '{}' is not an http(s) URL",
                        location.id, upstream.address
                    )));
                }
                if upstream.weight == 0 {
                    return Err(GatewayError::validation(format!(
                        "location '{}': upstream '{}' has weight 0",
                        location.id, upstream.address
                    )));
                }
                usable += 1;
            }
            if usable == 0 {
                return Err(GatewayError::validation(format!(
                    "location '{}': at least one upstream is required",
                    location.id
                )));
            }
        }
        LocationKind::StaticFiles { root_dir, .. } => {
            if root_dir.trim().is_empty() {
                return Err(GatewayError::validation(format!(
                    "location '{}': root directory is required",
                    location.id
                )));
            }
        }
    }
    Ok(())
}

pub fn validate_certificate(cert: &Certificate) -> Result<(), GatewayError> {
    if cert.domain.trim().is_empty() {
        return Err(GatewayError::validation("certificate domain must not be empty"));
    }
    if let Some(files) = &cert.files {
        if files.path.trim().is_empty() {
            return Err(GatewayError::validation(format!(
                "certificate '{}': file path must not be empty",
                cert.domain
            )));
        }
    }
    Ok(())
}

pub fn validate_security_entry(entry: &SecurityListEntry) -> Result<(), GatewayError> {
    if entry.name.trim().is_empty() {
        return Err(GatewayError::validation("security list name must not be empty"));
    }
    for range in &entry.ranges {
        range.parse::<IpRange>().map_err(|e| {
            GatewayError::validation(format!("security list '{}': {}", entry.name, e))
        })?;
    }
    Ok(())
}

pub fn validate_rate_limit(rule: &RateLimitRule) -> Result<(), GatewayError> {
    if rule.endpoint.trim().is_empty() {
        return Err(GatewayError::validation("rate limit endpoint must not be empty"));
    }
    if parse_period(&rule.period).is_none() {
        return Err(GatewayError::validation(format!(
            "rate limit '{}': invalid period '{}'",
            rule.endpoint, rule.period
        )));
    }
    if rule.limit == 0 {
        return Err(GatewayError::validation(format!(
            "rate limit '{}': limit must be greater than 0",
            rule.endpoint
        )));
    }
    for range in &rule.ip_whitelist {
        range.parse::<IpRange>().map_err(|e| {
            GatewayError::validation(format!("rate limit '{}': {}", rule.endpoint, e))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period("1s"), Some(Duration::from_secs(1)));
        assert_eq!(parse_period("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_period("12h"), Some(Duration::from_secs(43200)));
        assert_eq!(parse_period("7d"), Some(Duration::from_secs(604800)));
        assert_eq!(parse_period("0s"), None);
        assert_eq!(parse_period("10x"), None);
        assert_eq!(parse_period("s"), None);
        assert_eq!(parse_period(""), None);
    }

    #[test]
    fn test_validate_service_ok() {
        let service = ServiceInstance::new("api", 8080)
            .with_location(Location::single("/api", "http://127.0.0.1:3000"));
        assert!(validate_service(&service).is_ok());
    }

    #[test]
    fn test_validate_service_rejects_empty_name() {
        let service = ServiceInstance::new("  ", 8080);
        assert!(matches!(
            validate_service(&service),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_service_rejects_missing_path() {
        let service =
            ServiceInstance::new("api", 8080).with_location(Location::single("", "http://a"));
        let err = validate_service(&service).unwrap_err();
        assert!(err.to_string().contains("path is required"));
    }

    #[test]
    fn test_validate_service_rejects_bad_target() {
        let service =
            ServiceInstance::new("api", 8080).with_location(Location::single("/", "not a url"));
        assert!(validate_service(&service).is_err());
    }

    #[test]
    fn test_validate_load_balanced_requires_upstream() {
        let location = Location::new(
            "/",
            LocationKind::LoadBalanced {
                upstreams: vec![UpStream::new("", 1)],
                algorithm: LoadBalanceAlgorithm::RoundRobin,
            },
        );
        let service = ServiceInstance::new("lb", 8080).with_location(location);
        let err = validate_service(&service).unwrap_err();
        assert!(err.to_string().contains("at least one upstream"));
    }

    #[test]
    fn test_validate_security_entry_rejects_bad_range() {
        let entry = SecurityListEntry::blacklist("bad", &["10.0.0.0/33"]);
        assert!(validate_security_entry(&entry).is_err());

        let entry = SecurityListEntry::blacklist("good", &["10.0.0.1", "10.0.0.0/8", "1.1.1.1-1.1.1.9"]);
        assert!(validate_security_entry(&entry).is_ok());
    }

    #[test]
    fn test_validate_rate_limit() {
        assert!(validate_rate_limit(&RateLimitRule::new("*", "1m", 100)).is_ok());
        assert!(validate_rate_limit(&RateLimitRule::new("*", "1y", 100)).is_err());
        assert!(validate_rate_limit(&RateLimitRule::new("*", "1m", 0)).is_err());
        assert!(validate_rate_limit(&RateLimitRule::new("", "1m", 5)).is_err());
    }

    #[test]
    fn test_location_kind_serde_tag() {
        let location = Location::new(
            "/static",
            LocationKind::StaticFiles {
                root_dir: "/srv/www".to_string(),
                try_files: vec!["index.html".to_string()],
            },
        );
        let json = serde_json::to_string(&location).unwrap();
        assert!(json.contains("\"type\":\"static_files\""));
        let back: Location = serde_json::from_str(&json).unwrap();
        assert_eq!(back, location);
    }

    #[test]
    fn test_certificate_servable() {
        let now = Utc::now();
        let mut cert = Certificate::new("Example.com");
        assert_eq!(cert.domain, "example.com");
        assert!(!cert.is_servable(now));

        cert.files = Some(CertificateFile {
            path: "/tmp/example.pem".to_string(),
            password: None,
        });
        assert!(cert.is_servable(now));

        cert.not_after = Some(now - chrono::Duration::days(1));
        assert!(!cert.is_servable(now));

        cert.not_after = Some(now + chrono::Duration::days(30));
        cert.expired = true;
        assert!(!cert.is_servable(now));
    }
}
