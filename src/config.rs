use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Process-level configuration for the gateway
///
/// Services, certificates and security rules live in the store; this file only
/// carries how the gateway process itself runs.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub acme: AcmeConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for service listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API, always bound to loopback (default: 9090)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// SQLite database holding services, certificates and security rules
    #[serde(default = "default_database_path")]
    pub database: String,

    /// Directory where issued certificate bundles are written
    #[serde(default = "default_certificate_dir")]
    pub certificate_dir: String,

    /// PEM certificate served when no configured certificate matches the SNI name
    pub default_cert: Option<String>,

    /// PEM key for `default_cert`
    pub default_key: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn has_default_cert_files(&self) -> bool {
        self.default_cert.is_some() && self.default_key.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            database: default_database_path(),
            certificate_dir: default_certificate_dir(),
            default_cert: None,
            default_key: None,
            pid_file: None,
        }
    }
}

/// ACME (Let's Encrypt) issuance settings
#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub directory_url: Option<String>,

    /// Seconds between challenge status polls (default: 5)
    #[serde(default = "default_acme_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum challenge status polls before giving up (default: 12)
    #[serde(default = "default_acme_poll_attempts")]
    pub poll_attempts: u32,

    /// Lifetime of a published HTTP-01 token in seconds (default: 1200)
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl_secs: u64,

    /// Hours between renewal sweeps, 0 disables the sweep (default: 12)
    #[serde(default = "default_renewal_interval")]
    pub renewal_interval_hours: u64,

    /// Renew certificates expiring within this many days (default: 30)
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: i64,

    /// Port whose plaintext listener answers HTTP-01 challenges (default: 80)
    #[serde(default = "default_challenge_port")]
    pub challenge_port: u16,
}

impl AcmeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }

    pub fn renewal_interval(&self) -> Option<Duration> {
        if self.renewal_interval_hours == 0 {
            None
        } else {
            Some(Duration::from_secs(self.renewal_interval_hours * 60 * 60))
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: None,
            poll_interval_secs: default_acme_poll_interval(),
            poll_attempts: default_acme_poll_attempts(),
            challenge_ttl_secs: default_challenge_ttl(),
            renewal_interval_hours: default_renewal_interval(),
            renew_before_days: default_renew_before_days(),
            challenge_port: default_challenge_port(),
        }
    }
}

/// Service lifecycle settings
#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Registry polls after a start before reporting "not yet online" (default: 5)
    #[serde(default = "default_start_poll_attempts")]
    pub start_poll_attempts: u32,

    /// Milliseconds between registry polls (default: 1000)
    #[serde(default = "default_start_poll_interval")]
    pub start_poll_interval_ms: u64,

    /// Seconds to wait for a listener task to finish after stop (default: 5)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Reload running services when the security policy changes (default: false)
    #[serde(default)]
    pub reload_on_policy_change: bool,
}

impl OrchestratorConfig {
    pub fn start_poll_interval(&self) -> Duration {
        Duration::from_millis(self.start_poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            start_poll_attempts: default_start_poll_attempts(),
            start_poll_interval_ms: default_start_poll_interval(),
            stop_timeout_secs: default_stop_timeout(),
            reload_on_policy_change: false,
        }
    }
}

/// Abnormal IP detection thresholds
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Errors within the 60 second window that mark an IP abnormal (default: 20)
    #[serde(default = "default_abnormal_threshold")]
    pub threshold: u64,

    /// Minutes an IP stays listed after dropping below the threshold (default: 30)
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u64,

    /// Hours of inactivity before an entry is evicted (default: 24)
    #[serde(default = "default_eviction_hours")]
    pub eviction_hours: u64,

    /// Distinct IPs tracked at once; new IPs are ignored while full (default: 65536)
    #[serde(default = "default_max_tracked_ips")]
    pub max_tracked_ips: usize,
}

impl MonitorConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_minutes * 60)
    }

    pub fn eviction(&self) -> Duration {
        Duration::from_secs(self.eviction_hours * 60 * 60)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            threshold: default_abnormal_threshold(),
            retention_minutes: default_retention_minutes(),
            eviction_hours: default_eviction_hours(),
            max_tracked_ips: default_max_tracked_ips(),
        }
    }
}

/// Upstream connection settings shared by every listener
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Maximum idle connections per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Default upstream request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9090
}

fn default_database_path() -> String {
    "./data/portgate.db".to_string()
}

fn default_certificate_dir() -> String {
    "./data/certs".to_string()
}

fn default_acme_poll_interval() -> u64 {
    5
}

fn default_acme_poll_attempts() -> u32 {
    12
}

fn default_challenge_ttl() -> u64 {
    20 * 60
}

fn default_renewal_interval() -> u64 {
    12
}

fn default_renew_before_days() -> i64 {
    30
}

fn default_challenge_port() -> u16 {
    80
}

fn default_start_poll_attempts() -> u32 {
    5
}

fn default_start_poll_interval() -> u64 {
    1000
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_abnormal_threshold() -> u64 {
    20
}

fn default_retention_minutes() -> u64 {
    30
}

fn default_eviction_hours() -> u64 {
    24
}

fn default_max_tracked_ips() -> usize {
    65_536
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.default_cert.is_some() != self.server.default_key.is_some() {
            errors.push("server.default_cert and server.default_key must be set together".to_string());
        }
        if self.acme.poll_attempts == 0 {
            errors.push("acme.poll_attempts must be greater than 0".to_string());
        }
        if self.monitor.threshold == 0 {
            errors.push("monitor.threshold must be greater than 0".to_string());
        }
        if self.orchestrator.start_poll_interval_ms == 0 {
            errors.push("orchestrator.start_poll_interval_ms must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.admin_port, 9090);
        assert!(config.server.admin_token.is_none());
        assert_eq!(config.acme.poll_attempts, 12);
        assert_eq!(config.acme.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.acme.challenge_ttl(), Duration::from_secs(1200));
        assert_eq!(config.orchestrator.start_poll_attempts, 5);
        assert_eq!(config.monitor.threshold, 20);
        assert_eq!(config.monitor.retention(), Duration::from_secs(1800));
        assert_eq!(config.monitor.eviction(), Duration::from_secs(86400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
admin_port = 7000
admin_token = "secret"
database = "/var/lib/portgate/db.sqlite"
default_cert = "/etc/portgate/default.pem"
default_key = "/etc/portgate/default.key"

[acme]
directory_url = "https://acme-staging-v02.api.letsencrypt.org/directory"
poll_interval_secs = 2
poll_attempts = 30
renewal_interval_hours = 0

[orchestrator]
start_poll_attempts = 3
start_poll_interval_ms = 250
reload_on_policy_change = true

[monitor]
threshold = 50

[proxy]
request_timeout_secs = 10
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.admin_port, 7000);
        assert_eq!(config.server.admin_token.as_deref(), Some("secret"));
        assert!(config.server.has_default_cert_files());
        assert_eq!(config.acme.poll_attempts, 30);
        assert!(config.acme.renewal_interval().is_none());
        assert_eq!(
            config.orchestrator.start_poll_interval(),
            Duration::from_millis(250)
        );
        assert!(config.orchestrator.reload_on_policy_change);
        assert_eq!(config.monitor.threshold, 50);
        assert_eq!(config.monitor.retention_minutes, 30);
        assert_eq!(config.proxy.request_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_half_default_cert() {
        let toml = r#"
[server]
default_cert = "/etc/portgate/default.pem"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default_key"));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let toml = r#"
[monitor]
threshold = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
