//! ACME (Let's Encrypt) certificate issuance and renewal
//!
//! Issuance uses the HTTP-01 challenge only. The key authorization is
//! published in [`Http01Challenges`], which every listener consults for
//! `/.well-known/acme-challenge/{token}` before any other stage runs, so a
//! plaintext listener on the challenge port must be online first.
//!
//! The protocol itself sits behind [`AcmeClient`]; [`InstantAcmeClient`]
//! talks to a real directory. On success the chain and the new private key are
//! sealed into a bundle under the certificate directory and the record is
//! updated. On failure the record is left exactly as it was.

use chrono::{Duration as ChronoDuration, Months, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bundle;
use crate::certs::{not_after_from_pem, CertificateStore};
use crate::config::AcmeConfig;
use crate::error::GatewayError;
use crate::model::{Certificate, CertificateFile, RenewStatus};
use crate::store::Store;

pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 key authorizations shared by every listener
#[derive(Clone)]
pub struct Http01Challenges {
    inner: Arc<DashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl Http01Challenges {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn set(&self, token: String, key_authorization: String) {
        self.inner
            .insert(token, (key_authorization, Instant::now() + self.ttl));
    }

    pub fn get(&self, token: &str) -> Option<String> {
        let expired = {
            let entry = self.inner.get(token)?;
            let (key_auth, expires) = entry.value();
            if Instant::now() < *expires {
                return Some(key_auth.clone());
            }
            true
        };
        if expired {
            self.inner.remove(token);
        }
        None
    }

    pub fn remove(&self, token: &str) {
        self.inner.remove(token);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// An HTTP-01 challenge ready to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http01Challenge {
    pub token: String,
    pub key_authorization: String,
    pub url: String,
}

/// Validation state reported by the ACME server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeState {
    Pending,
    Valid,
    Invalid(String),
}

/// Account and order creation against an ACME directory
pub trait AcmeClient: Send + Sync {
    /// Register an account and return its serialized credentials
    fn create_account<'a>(&'a self, email: &'a str) -> BoxFuture<'a, anyhow::Result<String>>;

    /// Open a single-domain order with previously created credentials
    fn new_order<'a>(
        &'a self,
        credentials: &'a str,
        domain: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Box<dyn AcmeOrder>>>;
}

/// One in-flight certificate order
pub trait AcmeOrder: Send {
    fn http_challenge(&mut self) -> BoxFuture<'_, anyhow::Result<Http01Challenge>>;

    /// Tell the server the challenge response is being served
    fn set_ready<'a>(&'a mut self, challenge: &'a Http01Challenge) -> BoxFuture<'a, anyhow::Result<()>>;

    fn poll(&mut self) -> BoxFuture<'_, anyhow::Result<ChallengeState>>;

    /// Submit the CSR and return the signed PEM chain
    fn finalize(&mut self, csr_der: Vec<u8>) -> BoxFuture<'_, anyhow::Result<String>>;
}

/// [`AcmeClient`] backed by `instant-acme`
pub struct InstantAcmeClient {
    directory_url: String,
}

impl InstantAcmeClient {
    pub fn new(directory_url: Option<&str>) -> Self {
        Self {
            directory_url: directory_url
                .unwrap_or(LetsEncrypt::Production.url())
                .to_string(),
        }
    }
}

impl AcmeClient for InstantAcmeClient {
    fn create_account<'a>(&'a self, email: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            info!(email, directory = %self.directory_url, "Creating new ACME account");
            let (_account, credentials) = Account::create(
                &NewAccount {
                    contact: &[&format!("mailto:{}", email)],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                &self.directory_url,
                None,
            )
            .await?;
            Ok(serde_json::to_string(&credentials)?)
        })
    }

    fn new_order<'a>(
        &'a self,
        credentials: &'a str,
        domain: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Box<dyn AcmeOrder>>> {
        Box::pin(async move {
            let credentials: AccountCredentials = serde_json::from_str(credentials)?;
            let account = Account::from_credentials(credentials).await?;
            let order = account
                .new_order(&NewOrder {
                    identifiers: &[Identifier::Dns(domain.to_string())],
                })
                .await?;
            info!(domain, "ACME order created");
            Ok(Box::new(InstantAcmeOrder {
                order,
                token: None,
            }) as Box<dyn AcmeOrder>)
        })
    }
}

struct InstantAcmeOrder {
    order: Order,
    token: Option<String>,
}

impl AcmeOrder for InstantAcmeOrder {
    fn http_challenge(&mut self) -> BoxFuture<'_, anyhow::Result<Http01Challenge>> {
        Box::pin(async move {
            let authorizations = self.order.authorizations().await?;
            let authz = authorizations
                .first()
                .ok_or_else(|| anyhow::anyhow!("order has no authorizations"))?;
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("HTTP-01 challenge not offered"))?;

            let key_authorization = self.order.key_authorization(challenge).as_str().to_string();
            self.token = Some(challenge.token.clone());
            Ok(Http01Challenge {
                token: challenge.token.clone(),
                key_authorization,
                url: challenge.url.clone(),
            })
        })
    }

    fn set_ready<'a>(&'a mut self, challenge: &'a Http01Challenge) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.order.set_challenge_ready(&challenge.url).await?;
            Ok(())
        })
    }

    fn poll(&mut self) -> BoxFuture<'_, anyhow::Result<ChallengeState>> {
        Box::pin(async move {
            self.order.refresh().await?;
            let authorizations = self.order.authorizations().await?;
            let authz = authorizations
                .first()
                .ok_or_else(|| anyhow::anyhow!("order has no authorizations"))?;

            let detail = authz
                .challenges
                .iter()
                .filter(|c| Some(&c.token) == self.token.as_ref())
                .find_map(|c| c.error.as_ref())
                .and_then(|problem| problem.detail.clone());

            Ok(match authz.status {
                AuthorizationStatus::Valid => ChallengeState::Valid,
                AuthorizationStatus::Pending => ChallengeState::Pending,
                ref other => ChallengeState::Invalid(
                    detail.unwrap_or_else(|| format!("authorization {:?}", other)),
                ),
            })
        })
    }

    fn finalize(&mut self, csr_der: Vec<u8>) -> BoxFuture<'_, anyhow::Result<String>> {
        Box::pin(async move {
            // Wait for order to be ready
            let mut attempts = 0;
            loop {
                match self.order.state().status {
                    OrderStatus::Ready | OrderStatus::Valid => break,
                    OrderStatus::Invalid => anyhow::bail!("Order invalid"),
                    OrderStatus::Pending | OrderStatus::Processing => {
                        attempts += 1;
                        if attempts > 30 {
                            anyhow::bail!("Order timeout");
                        }
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        self.order.refresh().await?;
                    }
                }
            }

            self.order.finalize(&csr_der).await?;

            let mut attempts = 0;
            loop {
                self.order.refresh().await?;
                match self.order.state().status {
                    OrderStatus::Valid => {
                        if let Some(chain) = self.order.certificate().await? {
                            return Ok(chain);
                        }
                        anyhow::bail!("Order valid but no certificate returned");
                    }
                    OrderStatus::Processing | OrderStatus::Ready => {
                        attempts += 1;
                        if attempts > 30 {
                            anyhow::bail!("Certificate timeout");
                        }
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    ref status => anyhow::bail!("Unexpected order status: {:?}", status),
                }
            }
        })
    }
}

/// Reports whether a plaintext listener can answer challenges
pub trait ChallengeListener: Send + Sync {
    fn plain_listener_online(&self, port: u16) -> bool;
}

/// Issues and renews certificates for stored records
pub struct AcmeLifecycle {
    store: Arc<Store>,
    certs: Arc<CertificateStore>,
    challenges: Http01Challenges,
    listeners: Arc<dyn ChallengeListener>,
    client: Arc<dyn AcmeClient>,
    config: AcmeConfig,
    certificate_dir: PathBuf,
    in_progress: DashMap<String, ()>,
}

impl AcmeLifecycle {
    pub fn new(
        store: Arc<Store>,
        certs: Arc<CertificateStore>,
        challenges: Http01Challenges,
        listeners: Arc<dyn ChallengeListener>,
        client: Arc<dyn AcmeClient>,
        config: AcmeConfig,
        certificate_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            certs,
            challenges,
            listeners,
            client,
            config,
            certificate_dir: certificate_dir.into(),
            in_progress: DashMap::new(),
        }
    }

    pub fn challenges(&self) -> &Http01Challenges {
        &self.challenges
    }

    /// Run [`Self::apply_certificate`] on its own task and wait for it
    pub async fn apply_in_background(self: &Arc<Self>, cert_id: &str) -> Result<Certificate, GatewayError> {
        let lifecycle = Arc::clone(self);
        let cert_id = cert_id.to_string();
        tokio::spawn(async move { lifecycle.apply_certificate(&cert_id).await })
            .await
            .map_err(|e| GatewayError::Acme(format!("issuance task failed: {}", e)))?
    }

    /// Obtain a certificate for the record `cert_id`
    pub async fn apply_certificate(&self, cert_id: &str) -> Result<Certificate, GatewayError> {
        let record = self
            .store
            .snapshot()
            .certificate(cert_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("certificate {}", cert_id)))?;

        let port = self.config.challenge_port;
        if !self.listeners.plain_listener_online(port) {
            return Err(GatewayError::Acme(format!(
                "no plaintext listener is online on port {}; HTTP-01 validation for {} cannot be answered",
                port, record.domain
            )));
        }

        let email = record
            .email
            .clone()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::validation(format!("certificate {} has no ACME email", record.domain))
            })?;

        if self.in_progress.insert(cert_id.to_string(), ()).is_some() {
            return Err(GatewayError::Conflict(format!(
                "issuance for {} already in progress",
                record.domain
            )));
        }
        let result = self.issue(record, &email).await;
        self.in_progress.remove(cert_id);

        match &result {
            Ok(cert) => info!(domain = cert.domain, not_after = ?cert.not_after, "Certificate issued"),
            Err(e) => error!(cert_id, error = %e, "Certificate issuance failed"),
        }
        result
    }

    async fn issue(&self, record: Certificate, email: &str) -> Result<Certificate, GatewayError> {
        let acme_err = |e: anyhow::Error| GatewayError::Acme(e.to_string());

        let credentials = match self.store.acme_account(email)? {
            Some(credentials) => {
                debug!(email, "Using stored ACME account");
                credentials
            }
            None => {
                let credentials = self.client.create_account(email).await.map_err(acme_err)?;
                self.store.save_acme_account(email, &credentials)?;
                info!(email, "ACME account credentials saved");
                // another task may have won the insert
                self.store.acme_account(email)?.unwrap_or(credentials)
            }
        };

        let mut order = self
            .client
            .new_order(&credentials, &record.domain)
            .await
            .map_err(acme_err)?;
        let challenge = order.http_challenge().await.map_err(acme_err)?;

        debug!(domain = record.domain, token = challenge.token, "Publishing HTTP-01 challenge");
        self.challenges
            .set(challenge.token.clone(), challenge.key_authorization.clone());

        let outcome = self.validate_and_finalize(order.as_mut(), &challenge, &record.domain).await;
        self.challenges.remove(&challenge.token);
        let (chain, key_pem) = outcome?;

        let password = record
            .files
            .as_ref()
            .and_then(|f| f.password.clone())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(bundle::generate_password);
        let path = self
            .certificate_dir
            .join(format!("{}.bundle", record.domain.replace('*', "_wildcard")));
        bundle::write_bundle(&path, &format!("{}{}", chain, key_pem), &password)?;

        let now = Utc::now();
        let not_after = not_after_from_pem(chain.as_bytes())
            .or_else(|| now.checked_add_months(Months::new(3)));
        let files = CertificateFile {
            path: path.to_string_lossy().to_string(),
            password: Some(password),
        };

        // only the issuance fields are written onto whatever is stored now
        let mut domain_changed = false;
        let updated = self.store.update_certificate(&record.id, |current| {
            if current.domain != record.domain {
                domain_changed = true;
                return;
            }
            current.not_after = not_after;
            current.renewed_at = Some(now);
            current.renew_status = RenewStatus::Success;
            current.expired = false;
            current.files = Some(files);
        })?;

        let record = match updated {
            Some(current) if !domain_changed => current,
            Some(_) => {
                return Err(GatewayError::Conflict(format!(
                    "certificate {} changed domain during issuance",
                    record.domain
                )));
            }
            None => {
                return Err(GatewayError::not_found(format!(
                    "certificate {} was deleted during issuance",
                    record.id
                )));
            }
        };

        self.certs.refresh(&record);
        // a delete that landed after the update must not leave a served entry
        if self.store.snapshot().certificate(&record.id).is_none() {
            self.certs.remove(&record.domain);
        }
        Ok(record)
    }

    async fn validate_and_finalize(
        &self,
        order: &mut dyn AcmeOrder,
        challenge: &Http01Challenge,
        domain: &str,
    ) -> Result<(String, String), GatewayError> {
        let acme_err = |e: anyhow::Error| GatewayError::Acme(e.to_string());

        order.set_ready(challenge).await.map_err(acme_err)?;

        let mut state = ChallengeState::Pending;
        for attempt in 1..=self.config.poll_attempts {
            tokio::time::sleep(self.config.poll_interval()).await;
            state = order.poll().await.map_err(acme_err)?;
            match &state {
                ChallengeState::Valid => {
                    info!(domain, "Authorization valid");
                    break;
                }
                ChallengeState::Invalid(detail) => {
                    return Err(GatewayError::Acme(format!(
                        "challenge for {} failed: {}",
                        domain, detail
                    )));
                }
                ChallengeState::Pending => {
                    debug!(domain, attempt, "Waiting for authorization");
                }
            }
        }
        if state != ChallengeState::Valid {
            return Err(GatewayError::Acme(format!(
                "challenge for {} still pending after {} attempts",
                domain, self.config.poll_attempts
            )));
        }

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| GatewayError::Acme(format!("key generation failed: {}", e)))?;
        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| GatewayError::Acme(format!("invalid domain for CSR: {}", e)))?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domain.to_string());
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| GatewayError::Acme(format!("CSR generation failed: {}", e)))?;

        let chain = order
            .finalize(csr.der().to_vec())
            .await
            .map_err(acme_err)?;
        Ok((chain, key_pair.serialize_pem()))
    }

    /// Mark expired records and renew those inside the renewal window
    pub async fn renewal_sweep(&self) {
        let now = Utc::now();
        let snapshot = self.store.snapshot();
        let window = ChronoDuration::days(self.config.renew_before_days);

        let mut marked_expired = false;
        for cert in &snapshot.certificates {
            if let Some(not_after) = cert.not_after {
                if not_after <= now && !cert.expired {
                    let marked = self.store.update_certificate(&cert.id, |current| {
                        if current.not_after.map(|na| na <= now).unwrap_or(false) {
                            current.expired = true;
                        }
                    });
                    match marked {
                        Ok(Some(current)) if current.expired => {
                            warn!(domain = cert.domain, %not_after, "Certificate expired");
                            marked_expired = true;
                        }
                        Ok(_) => {}
                        Err(e) => error!(domain = cert.domain, error = %e, "Failed to mark certificate expired"),
                    }
                }
            }
        }
        if marked_expired {
            self.certs.reload(&self.store.snapshot().certificates);
        }

        for cert in snapshot.certificates.iter().filter(|c| c.auto_renew) {
            let due = cert.not_after.map(|na| na - now <= window).unwrap_or(true);
            if !due {
                continue;
            }
            info!(domain = cert.domain, "Certificate renewal needed");
            if let Err(e) = self.apply_certificate(&cert.id).await {
                warn!(domain = cert.domain, error = %e, "Failed to renew certificate");
            }
        }
    }

    /// Periodic renewal until shutdown
    pub async fn run_renewal(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let Some(interval) = self.config.renewal_interval() else {
            info!("Certificate renewal loop disabled");
            return;
        };

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.renewal_sweep().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Certificate renewal loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted ACME client for lifecycle tests

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MockAcme {
        pub accounts_created: AtomicUsize,
        pub polls: Mutex<VecDeque<ChallengeState>>,
        /// Key authorization observed in the shared cache while polling
        pub seen_while_polling: Mutex<Option<Option<String>>>,
        pub challenges: Mutex<Option<Http01Challenges>>,
        /// Runs once, on the first poll
        pub on_poll: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl MockAcme {
        pub fn with_polls(states: Vec<ChallengeState>) -> Arc<Self> {
            Arc::new(Self {
                polls: Mutex::new(states.into()),
                ..Default::default()
            })
        }
    }

    struct MockOrder {
        acme: Arc<MockAcme>,
        domain: String,
    }

    pub struct MockClient(pub Arc<MockAcme>);

    impl AcmeClient for MockClient {
        fn create_account<'a>(&'a self, email: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
            Box::pin(async move {
                self.0.accounts_created.fetch_add(1, Ordering::SeqCst);
                Ok(format!("{{\"email\":\"{}\"}}", email))
            })
        }

        fn new_order<'a>(
            &'a self,
            _credentials: &'a str,
            domain: &'a str,
        ) -> BoxFuture<'a, anyhow::Result<Box<dyn AcmeOrder>>> {
            Box::pin(async move {
                Ok(Box::new(MockOrder {
                    acme: Arc::clone(&self.0),
                    domain: domain.to_string(),
                }) as Box<dyn AcmeOrder>)
            })
        }
    }

    impl AcmeOrder for MockOrder {
        fn http_challenge(&mut self) -> BoxFuture<'_, anyhow::Result<Http01Challenge>> {
            Box::pin(async move {
                Ok(Http01Challenge {
                    token: "mock-token".to_string(),
                    key_authorization: "mock-token.thumbprint".to_string(),
                    url: "https://acme.test/chall/1".to_string(),
                })
            })
        }

        fn set_ready<'a>(&'a mut self, _challenge: &'a Http01Challenge) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move { Ok(()) })
        }

        fn poll(&mut self) -> BoxFuture<'_, anyhow::Result<ChallengeState>> {
            Box::pin(async move {
                if let Some(challenges) = self.acme.challenges.lock().as_ref() {
                    *self.acme.seen_while_polling.lock() = Some(challenges.get("mock-token"));
                }
                let hook = self.acme.on_poll.lock().take();
                if let Some(hook) = hook {
                    hook();
                }
                Ok(self
                    .acme
                    .polls
                    .lock()
                    .pop_front()
                    .unwrap_or(ChallengeState::Pending))
            })
        }

        fn finalize(&mut self, _csr_der: Vec<u8>) -> BoxFuture<'_, anyhow::Result<String>> {
            Box::pin(async move {
                let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
                let cert = CertificateParams::new(vec![self.domain.clone()])?.self_signed(&key)?;
                Ok(cert.pem())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{MockAcme, MockClient};
    use super::*;

    struct Listeners(bool);

    impl ChallengeListener for Listeners {
        fn plain_listener_online(&self, _port: u16) -> bool {
            self.0
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        certs: Arc<CertificateStore>,
        lifecycle: Arc<AcmeLifecycle>,
        acme: Arc<MockAcme>,
        cert_id: String,
    }

    fn fixture(polls: Vec<ChallengeState>, listener_online: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let certs = Arc::new(CertificateStore::with_self_signed_default().unwrap());
        let challenges = Http01Challenges::new(Duration::from_secs(1200));
        let acme = MockAcme::with_polls(polls);
        *acme.challenges.lock() = Some(challenges.clone());

        let mut cert = Certificate::new("shop.example.com");
        cert.email = Some("ops@example.com".to_string());
        store.save_certificate(&cert).unwrap();

        let config = AcmeConfig {
            poll_interval_secs: 0,
            poll_attempts: 3,
            ..AcmeConfig::default()
        };
        let lifecycle = Arc::new(AcmeLifecycle::new(
            Arc::clone(&store),
            Arc::clone(&certs),
            challenges,
            Arc::new(Listeners(listener_online)),
            Arc::new(MockClient(Arc::clone(&acme))),
            config,
            dir.path().join("certs"),
        ));
        Fixture {
            _dir: dir,
            store,
            certs,
            lifecycle,
            acme,
            cert_id: cert.id,
        }
    }

    #[test]
    fn test_http01_challenges() {
        let challenges = Http01Challenges::new(Duration::from_secs(60));
        challenges.set("token123".to_string(), "key_auth_123".to_string());

        assert_eq!(challenges.get("token123"), Some("key_auth_123".to_string()));
        assert_eq!(challenges.get("nonexistent"), None);

        challenges.remove("token123");
        assert_eq!(challenges.get("token123"), None);
    }

    #[test]
    fn test_http01_challenge_expires() {
        let challenges = Http01Challenges::new(Duration::ZERO);
        challenges.set("token".to_string(), "auth".to_string());
        assert_eq!(challenges.get("token"), None);
        assert!(challenges.is_empty());
    }

    #[tokio::test]
    async fn test_apply_success_updates_record() {
        let f = fixture(vec![ChallengeState::Pending, ChallengeState::Valid], true);

        let cert = f.lifecycle.apply_in_background(&f.cert_id).await.unwrap();
        assert_eq!(cert.renew_status, RenewStatus::Success);
        assert!(!cert.expired);
        assert!(cert.renewed_at.is_some());
        assert!(cert.not_after.unwrap() > Utc::now());

        let files = cert.files.clone().unwrap();
        assert!(std::path::Path::new(&files.path).exists());
        assert!(files.password.is_some());

        // persisted, served, and the token was visible during validation then removed
        assert_eq!(f.store.snapshot().certificate(&f.cert_id).unwrap(), &cert);
        assert!(f.certs.contains("shop.example.com"));
        assert_eq!(
            *f.acme.seen_while_polling.lock(),
            Some(Some("mock-token.thumbprint".to_string()))
        );
        assert!(f.lifecycle.challenges().is_empty());
        assert_eq!(f.acme.accounts_created.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_during_validation_is_not_undone() {
        let f = fixture(vec![ChallengeState::Valid], true);
        let store = Arc::clone(&f.store);
        let id = f.cert_id.clone();
        *f.acme.on_poll.lock() = Some(Box::new(move || {
            store.delete_certificate(&id).unwrap();
        }));

        let err = f.lifecycle.apply_certificate(&f.cert_id).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert!(f.store.snapshot().certificate(&f.cert_id).is_none());
        assert!(f.store.snapshot().certificates.is_empty());
        assert!(!f.certs.contains("shop.example.com"));
    }

    #[tokio::test]
    async fn test_edit_during_validation_is_kept() {
        let f = fixture(vec![ChallengeState::Valid], true);
        let store = Arc::clone(&f.store);
        let id = f.cert_id.clone();
        *f.acme.on_poll.lock() = Some(Box::new(move || {
            let mut cert = store.snapshot().certificate(&id).cloned().unwrap();
            cert.auto_renew = true;
            cert.email = Some("security@example.com".to_string());
            store.save_certificate(&cert).unwrap();
        }));

        let cert = f.lifecycle.apply_certificate(&f.cert_id).await.unwrap();
        assert!(cert.auto_renew);
        assert_eq!(cert.email.as_deref(), Some("security@example.com"));
        assert_eq!(cert.renew_status, RenewStatus::Success);
        assert!(cert.files.is_some());
        assert_eq!(f.store.snapshot().certificate(&f.cert_id).unwrap(), &cert);
        assert!(f.certs.contains("shop.example.com"));
    }

    #[tokio::test]
    async fn test_domain_change_during_validation_is_rejected() {
        let f = fixture(vec![ChallengeState::Valid], true);
        let store = Arc::clone(&f.store);
        let id = f.cert_id.clone();
        *f.acme.on_poll.lock() = Some(Box::new(move || {
            let mut cert = store.snapshot().certificate(&id).cloned().unwrap();
            cert.domain = "other.example.com".to_string();
            store.save_certificate(&cert).unwrap();
        }));

        let err = f.lifecycle.apply_certificate(&f.cert_id).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
        let stored = f.store.snapshot().certificate(&f.cert_id).cloned().unwrap();
        assert_eq!(stored.domain, "other.example.com");
        assert!(stored.files.is_none());
    }

    #[tokio::test]
    async fn test_account_created_once() {
        let f = fixture(vec![ChallengeState::Valid, ChallengeState::Valid], true);
        f.lifecycle.apply_certificate(&f.cert_id).await.unwrap();
        f.lifecycle.apply_certificate(&f.cert_id).await.unwrap();
        assert_eq!(f.acme.accounts_created.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_challenge_leaves_record_untouched() {
        let f = fixture(
            vec![ChallengeState::Invalid("connection refused".to_string())],
            true,
        );
        let before = f.store.snapshot().certificate(&f.cert_id).cloned().unwrap();

        let err = f.lifecycle.apply_certificate(&f.cert_id).await.unwrap_err();
        assert!(matches!(err, GatewayError::Acme(_)));
        assert!(err.to_string().contains("connection refused"));

        let after = f.store.snapshot().certificate(&f.cert_id).cloned().unwrap();
        assert_eq!(before, after);
        assert_eq!(after.renew_status, RenewStatus::NotRenewed);
        assert!(!f.certs.contains("shop.example.com"));
        assert!(f.lifecycle.challenges().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_polls_fail() {
        let f = fixture(vec![], true);
        let err = f.lifecycle.apply_certificate(&f.cert_id).await.unwrap_err();
        assert!(err.to_string().contains("still pending after 3 attempts"));
        assert!(f.lifecycle.challenges().is_empty());
    }

    #[tokio::test]
    async fn test_requires_plain_listener() {
        let f = fixture(vec![ChallengeState::Valid], false);
        let err = f.lifecycle.apply_certificate(&f.cert_id).await.unwrap_err();
        assert!(err.to_string().contains("port 80"));
        assert_eq!(f.acme.accounts_created.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_certificate() {
        let f = fixture(vec![], true);
        assert!(matches!(
            f.lifecycle.apply_certificate("missing").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_renewal_sweep_marks_expired() {
        let f = fixture(vec![], true);
        let mut cert = f.store.snapshot().certificate(&f.cert_id).cloned().unwrap();
        cert.not_after = Some(Utc::now() - ChronoDuration::days(1));
        f.store.save_certificate(&cert).unwrap();

        f.lifecycle.renewal_sweep().await;
        assert!(f.store.snapshot().certificate(&f.cert_id).unwrap().expired);
    }

    #[tokio::test]
    async fn test_renewal_sweep_renews_auto_renew() {
        let f = fixture(vec![ChallengeState::Valid], true);
        let mut cert = f.store.snapshot().certificate(&f.cert_id).cloned().unwrap();
        cert.auto_renew = true;
        cert.not_after = Some(Utc::now() + ChronoDuration::days(10));
        f.store.save_certificate(&cert).unwrap();

        f.lifecycle.renewal_sweep().await;
        let renewed = f.store.snapshot().certificate(&f.cert_id).cloned().unwrap();
        assert_eq!(renewed.renew_status, RenewStatus::Success);
        assert!(renewed.not_after.unwrap() > Utc::now() + ChronoDuration::days(30));
    }
}
