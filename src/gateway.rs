//! Management facade over the orchestrator, store and ACME lifecycle
//!
//! [`Gateway`] is what the admin API (or an embedding program) drives. Every
//! write is validated before anything is mutated, then persisted, then the
//! affected runtime cache is invalidated: certificate writes refresh the
//! certificate store, security list and rate limit writes bump the policy
//! watch channel.

use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::acme::{AcmeClient, AcmeLifecycle, Http01Challenges, InstantAcmeClient};
use crate::certs::{load_pem_pair, CertificateStore};
use crate::config::Config;
use crate::error::GatewayError;
use crate::iprange::canonical;
use crate::model::{
    validate_certificate, validate_rate_limit, validate_security_entry, Certificate, RateLimitRule,
    SecurityListEntry, ServiceInstance,
};
use crate::monitor::{AbnormalIpMonitor, AbnormalIpPage, AbnormalIpStats, MonitorSettings};
use crate::orchestrator::{Orchestrator, ServiceStatus, SharedComponents};
use crate::security::AUTO_BLACKLIST_NAME;
use crate::store::Store;
use crate::telemetry::{GatewayStats, StatsSnapshot};
use crate::upstream::{PoolConfig, UpstreamPool};

pub struct Gateway {
    config: Config,
    store: Arc<Store>,
    certs: Arc<CertificateStore>,
    orchestrator: Arc<Orchestrator>,
    acme: Arc<AcmeLifecycle>,
    monitor: Arc<AbnormalIpMonitor>,
    stats: Arc<GatewayStats>,
    policy_tx: watch::Sender<u64>,
}

impl Gateway {
    /// Open the configured database and build every component
    pub fn open(config: Config) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(Store::open(&config.server.database)?);

        let certs = match (&config.server.default_cert, &config.server.default_key) {
            (Some(cert), Some(key)) => {
                info!(cert, "Loading default certificate");
                Arc::new(CertificateStore::new(load_pem_pair(cert, key)?))
            }
            _ => {
                info!("No default certificate configured, generating a self-signed one");
                Arc::new(CertificateStore::with_self_signed_default()?)
            }
        };

        let client = Arc::new(InstantAcmeClient::new(config.acme.directory_url.as_deref()));
        Self::new(config, store, certs, client)
    }

    pub fn new(
        config: Config,
        store: Arc<Store>,
        certs: Arc<CertificateStore>,
        acme_client: Arc<dyn AcmeClient>,
    ) -> anyhow::Result<Arc<Self>> {
        let monitor = Arc::new(AbnormalIpMonitor::new(MonitorSettings::from(&config.monitor)));
        let stats = Arc::new(GatewayStats::new());
        let challenges = Http01Challenges::new(config.acme.challenge_ttl());

        let orchestrator = Orchestrator::new(
            SharedComponents {
                store: Arc::clone(&store),
                certs: Arc::clone(&certs),
                pool: Arc::new(UpstreamPool::new(PoolConfig::from(&config.proxy))),
                challenges: challenges.clone(),
                monitor: Arc::clone(&monitor),
                stats: Arc::clone(&stats),
            },
            &config,
        )?;

        let acme = Arc::new(AcmeLifecycle::new(
            Arc::clone(&store),
            Arc::clone(&certs),
            challenges,
            Arc::clone(&orchestrator) as Arc<dyn crate::acme::ChallengeListener>,
            acme_client,
            config.acme.clone(),
            config.server.certificate_dir.clone(),
        ));

        certs.reload(&store.snapshot().certificates);
        let (policy_tx, _) = watch::channel(0);

        Ok(Arc::new(Self {
            config,
            store,
            certs,
            orchestrator,
            acme,
            monitor,
            stats,
            policy_tx,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn certs(&self) -> &Arc<CertificateStore> {
        &self.certs
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn acme(&self) -> &Arc<AcmeLifecycle> {
        &self.acme
    }

    pub fn monitor(&self) -> &Arc<AbnormalIpMonitor> {
        &self.monitor
    }

    pub fn stats(&self) -> &Arc<GatewayStats> {
        &self.stats
    }

    // ==================== Services ====================

    /// Reload certificates and (re)launch every enabled service
    pub async fn load_all(&self) -> Result<Vec<ServiceStatus>, GatewayError> {
        let statuses = self.orchestrator.load_all().await?;
        self.certs.reload(&self.store.snapshot().certificates);
        Ok(statuses)
    }

    pub fn services(&self) -> Vec<ServiceInstance> {
        self.store.snapshot().services.clone()
    }

    pub fn service(&self, id: &str) -> Result<ServiceInstance, GatewayError> {
        self.store
            .snapshot()
            .service(id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("service {}", id)))
    }

    pub async fn create_service(&self, service: ServiceInstance) -> Result<ServiceStatus, GatewayError> {
        self.orchestrator.create_service(service).await
    }

    pub async fn update_service(&self, service: ServiceInstance) -> Result<ServiceStatus, GatewayError> {
        self.orchestrator.update_service(service).await
    }

    pub async fn delete_service(&self, id: &str) -> Result<(), GatewayError> {
        self.orchestrator.delete_service(id).await
    }

    pub async fn start_or_stop(&self, id: &str, enabled: bool) -> Result<ServiceStatus, GatewayError> {
        self.orchestrator.start_or_stop(id, enabled).await
    }

    pub async fn restart(&self, id: &str) -> Result<ServiceStatus, GatewayError> {
        self.orchestrator.restart(id).await
    }

    pub async fn reload(&self, id: &str) -> Result<ServiceStatus, GatewayError> {
        self.orchestrator.reload(id).await
    }

    pub fn check_online(&self, id: &str) -> bool {
        self.orchestrator.is_online(id)
    }

    pub fn batch_stats(&self, ids: &[String]) -> Vec<ServiceStatus> {
        self.orchestrator.batch_stats(ids)
    }

    // ==================== Certificates ====================

    pub fn certificates(&self) -> Vec<Certificate> {
        self.store.snapshot().certificates.clone()
    }

    fn ensure_unique_domain(&self, cert: &Certificate) -> Result<(), GatewayError> {
        let snapshot = self.store.snapshot();
        if snapshot
            .certificates
            .iter()
            .any(|c| c.id != cert.id && c.domain.eq_ignore_ascii_case(&cert.domain))
        {
            return Err(GatewayError::Conflict(format!(
                "a certificate for {} already exists",
                cert.domain
            )));
        }
        Ok(())
    }

    pub fn create_certificate(&self, mut cert: Certificate) -> Result<Certificate, GatewayError> {
        validate_certificate(&cert)?;
        cert.domain = cert.domain.trim().to_ascii_lowercase();
        if self.store.snapshot().certificate(&cert.id).is_some() {
            return Err(GatewayError::Conflict(format!("certificate {} already exists", cert.id)));
        }
        self.ensure_unique_domain(&cert)?;

        self.store.save_certificate(&cert)?;
        self.certs.refresh(&cert);
        info!(domain = cert.domain, "Certificate created");
        Ok(cert)
    }

    pub fn update_certificate(&self, mut cert: Certificate) -> Result<Certificate, GatewayError> {
        validate_certificate(&cert)?;
        cert.domain = cert.domain.trim().to_ascii_lowercase();
        let existing = self
            .store
            .snapshot()
            .certificate(&cert.id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("certificate {}", cert.id)))?;
        self.ensure_unique_domain(&cert)?;

        self.store.save_certificate(&cert)?;
        if existing.domain != cert.domain {
            self.certs.remove(&existing.domain);
        }
        self.certs.refresh(&cert);
        info!(domain = cert.domain, "Certificate updated");
        Ok(cert)
    }

    pub fn delete_certificate(&self, id: &str) -> Result<(), GatewayError> {
        let existing = self
            .store
            .snapshot()
            .certificate(id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("certificate {}", id)))?;
        self.store.delete_certificate(id)?;
        self.certs.remove(&existing.domain);
        info!(domain = existing.domain, "Certificate deleted");
        Ok(())
    }

    /// Issue a certificate through ACME on a background task
    pub async fn apply_certificate(&self, cert_id: &str) -> Result<Certificate, GatewayError> {
        self.acme.apply_in_background(cert_id).await
    }

    // ==================== Security Lists ====================

    pub fn security_lists(&self) -> Vec<SecurityListEntry> {
        self.store.snapshot().security_lists.clone()
    }

    fn ensure_unique_list_name(&self, entry: &SecurityListEntry) -> Result<(), GatewayError> {
        if !entry.auto_generated && entry.name == AUTO_BLACKLIST_NAME {
            return Err(GatewayError::validation(format!(
                "security list name '{}' is reserved",
                AUTO_BLACKLIST_NAME
            )));
        }
        let snapshot = self.store.snapshot();
        if snapshot
            .security_lists
            .iter()
            .any(|e| e.id != entry.id && e.name == entry.name)
        {
            return Err(GatewayError::Conflict(format!(
                "security list '{}' already exists",
                entry.name
            )));
        }
        Ok(())
    }

    pub fn create_security_entry(&self, entry: SecurityListEntry) -> Result<SecurityListEntry, GatewayError> {
        validate_security_entry(&entry)?;
        if self.store.snapshot().security_list(&entry.id).is_some() {
            return Err(GatewayError::Conflict(format!("security list {} already exists", entry.id)));
        }
        self.ensure_unique_list_name(&entry)?;
        self.store.save_security_entry(&entry)?;
        info!(name = entry.name, blacklist = entry.is_blacklist, "Security list created");
        self.notify_policy_change();
        Ok(entry)
    }

    pub fn update_security_entry(&self, entry: SecurityListEntry) -> Result<SecurityListEntry, GatewayError> {
        validate_security_entry(&entry)?;
        if self.store.snapshot().security_list(&entry.id).is_none() {
            return Err(GatewayError::not_found(format!("security list {}", entry.id)));
        }
        self.ensure_unique_list_name(&entry)?;
        self.store.save_security_entry(&entry)?;
        info!(name = entry.name, "Security list updated");
        self.notify_policy_change();
        Ok(entry)
    }

    pub fn delete_security_entry(&self, id: &str) -> Result<(), GatewayError> {
        if !self.store.delete_security_entry(id)? {
            return Err(GatewayError::not_found(format!("security list {}", id)));
        }
        info!(id, "Security list deleted");
        self.notify_policy_change();
        Ok(())
    }

    // ==================== Rate Limits ====================

    pub fn rate_limits(&self) -> Vec<RateLimitRule> {
        self.store.snapshot().rate_limits.clone()
    }

    pub fn create_rate_limit(&self, rule: RateLimitRule) -> Result<RateLimitRule, GatewayError> {
        validate_rate_limit(&rule)?;
        if self.store.snapshot().rate_limit(&rule.id).is_some() {
            return Err(GatewayError::Conflict(format!("rate limit {} already exists", rule.id)));
        }
        self.store.save_rate_limit(&rule)?;
        info!(endpoint = rule.endpoint, period = rule.period, limit = rule.limit, "Rate limit created");
        self.notify_policy_change();
        Ok(rule)
    }

    pub fn update_rate_limit(&self, rule: RateLimitRule) -> Result<RateLimitRule, GatewayError> {
        validate_rate_limit(&rule)?;
        if self.store.snapshot().rate_limit(&rule.id).is_none() {
            return Err(GatewayError::not_found(format!("rate limit {}", rule.id)));
        }
        self.store.save_rate_limit(&rule)?;
        self.notify_policy_change();
        Ok(rule)
    }

    pub fn delete_rate_limit(&self, id: &str) -> Result<(), GatewayError> {
        if !self.store.delete_rate_limit(id)? {
            return Err(GatewayError::not_found(format!("rate limit {}", id)));
        }
        self.notify_policy_change();
        Ok(())
    }

    // ==================== Abnormal IPs ====================

    pub fn abnormal_ips(&self, page: usize, page_size: usize) -> AbnormalIpPage {
        self.monitor.page(page, page_size)
    }

    pub fn abnormal_ip(&self, ip: &IpAddr) -> Option<AbnormalIpStats> {
        self.monitor.get(&canonical(ip))
    }

    /// Add `ip` to the auto-generated blacklist
    ///
    /// Adding an address that is already listed changes nothing and sends no
    /// signal.
    pub fn promote_to_blacklist(&self, ip: IpAddr) -> Result<SecurityListEntry, GatewayError> {
        let ip = canonical(&ip).to_string();
        let (entry, changed) = self.store.modify_security_entry_by_name(
            AUTO_BLACKLIST_NAME,
            |current| match current {
                Some(existing) if existing.ranges.contains(&ip) => (existing, false),
                Some(mut existing) => {
                    existing.ranges.push(ip.clone());
                    (existing, true)
                }
                None => {
                    let mut entry = SecurityListEntry::blacklist(AUTO_BLACKLIST_NAME, &[ip.as_str()]);
                    entry.auto_generated = true;
                    entry.description =
                        Some("Addresses promoted from the abnormal IP monitor".to_string());
                    (entry, true)
                }
            },
        )?;

        if changed {
            warn!(ip, "Address promoted to blacklist");
            self.notify_policy_change();
        }
        Ok(entry)
    }

    // ==================== Policy Changes ====================

    fn notify_policy_change(&self) {
        self.policy_tx.send_modify(|generation| *generation += 1);
    }

    /// Receiver bumped after every security list or rate limit change
    pub fn subscribe_policy_changes(&self) -> watch::Receiver<u64> {
        self.policy_tx.subscribe()
    }

    /// Reload running services whenever policies change
    pub async fn run_policy_reloader(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        if !self.config.orchestrator.reload_on_policy_change {
            return;
        }
        let mut changes = self.subscribe_policy_changes();

        loop {
            tokio::select! {
                result = changes.changed() => {
                    if result.is_err() {
                        break;
                    }
                    info!(generation = *changes.borrow_and_update(), "Policies changed, reloading running services");
                    self.orchestrator.reload_running().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // ==================== Telemetry ====================

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn shutdown(&self) {
        self.orchestrator.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::testing::{MockAcme, MockClient};
    use crate::model::Location;
    use crate::orchestrator::tests::{free_port, test_config};

    fn gateway() -> Arc<Gateway> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let certs = Arc::new(CertificateStore::with_self_signed_default().unwrap());
        Gateway::new(
            test_config(),
            store,
            certs,
            Arc::new(MockClient(MockAcme::with_polls(vec![]))),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_certificate_crud_invalidates_store() {
        let gw = gateway();
        let cert = gw.create_certificate(Certificate::new("Example.COM")).unwrap();
        assert_eq!(cert.domain, "example.com");
        // no files yet, so nothing to serve
        assert!(!gw.certs().contains("example.com"));

        assert!(matches!(
            gw.create_certificate(Certificate::new("example.com")),
            Err(GatewayError::Conflict(_))
        ));
        assert!(matches!(
            gw.create_certificate(Certificate::new("  ")),
            Err(GatewayError::Validation(_))
        ));

        gw.delete_certificate(&cert.id).unwrap();
        assert!(gw.certificates().is_empty());
        assert!(matches!(
            gw.delete_certificate(&cert.id),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_security_list_validation_and_signal() {
        let gw = gateway();
        let mut changes = gw.subscribe_policy_changes();

        let bad = SecurityListEntry::blacklist("bad", &["10.0.0.300"]);
        assert!(matches!(
            gw.create_security_entry(bad),
            Err(GatewayError::Validation(_))
        ));
        assert!(!changes.has_changed().unwrap());

        gw.create_security_entry(SecurityListEntry::blacklist("office", &["10.0.0.0/8"]))
            .unwrap();
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();

        assert!(matches!(
            gw.create_security_entry(SecurityListEntry::whitelist("office", &[])),
            Err(GatewayError::Conflict(_))
        ));
        assert!(matches!(
            gw.create_security_entry(SecurityListEntry::blacklist(AUTO_BLACKLIST_NAME, &[])),
            Err(GatewayError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_promote_to_blacklist_is_idempotent() {
        let gw = gateway();
        let mut changes = gw.subscribe_policy_changes();
        let ip: IpAddr = "198.51.100.23".parse().unwrap();

        let entry = gw.promote_to_blacklist(ip).unwrap();
        assert!(entry.auto_generated);
        assert!(entry.is_blacklist);
        assert_eq!(entry.ranges, vec!["198.51.100.23"]);
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();

        let again = gw.promote_to_blacklist(ip).unwrap();
        assert_eq!(again, entry);
        assert!(!changes.has_changed().unwrap());

        // mapped IPv6 lands in the same entry as IPv4
        let mapped: IpAddr = "::ffff:198.51.100.24".parse().unwrap();
        let entry = gw.promote_to_blacklist(mapped).unwrap();
        assert_eq!(entry.ranges, vec!["198.51.100.23", "198.51.100.24"]);
        assert_eq!(
            gw.security_lists()
                .iter()
                .filter(|e| e.name == AUTO_BLACKLIST_NAME)
                .count(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_promotions_share_one_list() {
        let gw = gateway();
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let gw = Arc::clone(&gw);
                tokio::task::spawn_blocking(move || {
                    let ip: IpAddr = format!("192.0.2.{}", i + 1).parse().unwrap();
                    gw.promote_to_blacklist(ip)
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let auto: Vec<_> = gw
            .security_lists()
            .into_iter()
            .filter(|e| e.name == AUTO_BLACKLIST_NAME)
            .collect();
        assert_eq!(auto.len(), 1);
        assert_eq!(auto[0].ranges.len(), 16);
        assert!(auto[0].auto_generated);
    }

    #[tokio::test]
    async fn test_rate_limit_crud() {
        let gw = gateway();
        assert!(matches!(
            gw.create_rate_limit(RateLimitRule::new("*", "5x", 10)),
            Err(GatewayError::Validation(_))
        ));
        let rule = gw.create_rate_limit(RateLimitRule::new("GET:/api/*", "1m", 10)).unwrap();
        assert_eq!(gw.rate_limits().len(), 1);

        let mut changed = rule.clone();
        changed.limit = 20;
        gw.update_rate_limit(changed).unwrap();
        assert_eq!(gw.rate_limits()[0].limit, 20);

        gw.delete_rate_limit(&rule.id).unwrap();
        assert!(gw.rate_limits().is_empty());
    }

    #[tokio::test]
    async fn test_policy_reloader_reloads_running_services() {
        let mut config = test_config();
        config.orchestrator.reload_on_policy_change = true;
        let gw = Gateway::new(
            config,
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(CertificateStore::with_self_signed_default().unwrap()),
            Arc::new(MockClient(MockAcme::with_polls(vec![]))),
        )
        .unwrap();

        let svc = ServiceInstance::new("web", free_port()).with_location(Location::single("/", "http://127.0.0.1:9"));
        assert!(gw.create_service(svc.clone()).await.unwrap().online);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reloader = tokio::spawn(Arc::clone(&gw).run_policy_reloader(shutdown_rx));

        // reload swaps the pipeline; the service must stay online throughout
        gw.promote_to_blacklist("203.0.113.1".parse().unwrap()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(gw.check_online(&svc.id));

        shutdown_tx.send(true).unwrap();
        reloader.await.unwrap();
        gw.shutdown().await;
    }
}
