//! TLS certificate store and SNI resolution
//!
//! Certificates are parsed once when installed and kept as ready-to-use
//! `CertifiedKey`s keyed by lowercased domain. A handshake only does a map
//! lookup: exact name, then the `*.parent` wildcard, then the default
//! certificate. The store is never refreshed by time; callers invalidate it
//! explicitly when a certificate record changes.

use anyhow::Context;
use arc_swap::ArcSwap;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::HashSet;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bundle;
use crate::model::{Certificate, CertificateFile};

pub struct CertificateStore {
    entries: DashMap<String, Arc<CertifiedKey>>,
    default_cert: ArcSwap<CertifiedKey>,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("domains", &self.entries.len())
            .finish()
    }
}

impl CertificateStore {
    pub fn new(default_cert: Arc<CertifiedKey>) -> Self {
        Self {
            entries: DashMap::new(),
            default_cert: ArcSwap::new(default_cert),
        }
    }

    /// Store whose fallback is a freshly generated self-signed certificate
    pub fn with_self_signed_default() -> anyhow::Result<Self> {
        Ok(Self::new(self_signed(&["localhost", "127.0.0.1"])?))
    }

    pub fn set_default(&self, cert: Arc<CertifiedKey>) {
        self.default_cert.store(cert);
    }

    pub fn default_cert(&self) -> Arc<CertifiedKey> {
        self.default_cert.load_full()
    }

    /// Rebuild from every servable record
    ///
    /// Entries are swapped in before stale domains are dropped, so a
    /// concurrent handshake never observes an empty store.
    pub fn reload(&self, records: &[Certificate]) {
        let now = Utc::now();
        let mut loaded = HashSet::new();
        for record in records.iter().filter(|r| r.is_servable(now)) {
            match load_record(record) {
                Ok(key) => {
                    let domain = record.domain.to_ascii_lowercase();
                    self.entries.insert(domain.clone(), key);
                    loaded.insert(domain);
                }
                Err(e) => {
                    warn!(domain = record.domain, error = %e, "Skipping certificate that failed to load");
                }
            }
        }
        self.entries.retain(|domain, _| loaded.contains(domain));
        info!(count = loaded.len(), "Certificate store reloaded");
    }

    /// Re-install a single record after it changed
    pub fn refresh(&self, record: &Certificate) {
        if !record.is_servable(Utc::now()) {
            self.remove(&record.domain);
            return;
        }
        match load_record(record) {
            Ok(key) => {
                self.insert(&record.domain, key);
                debug!(domain = record.domain, "Certificate store entry refreshed");
            }
            Err(e) => {
                warn!(domain = record.domain, error = %e, "Certificate failed to load, entry dropped");
                self.remove(&record.domain);
            }
        }
    }

    pub fn remove(&self, domain: &str) {
        if self.entries.remove(&domain.to_ascii_lowercase()).is_some() {
            debug!(domain, "Certificate store entry removed");
        }
    }

    pub fn insert(&self, domain: &str, key: Arc<CertifiedKey>) {
        self.entries.insert(domain.to_ascii_lowercase(), key);
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.entries.contains_key(&domain.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Certificate for an SNI name; always returns something
    pub fn lookup(&self, server_name: Option<&str>) -> Arc<CertifiedKey> {
        if let Some(name) = server_name {
            let name = name.to_ascii_lowercase();
            if let Some(key) = self.entries.get(&name) {
                return Arc::clone(key.value());
            }
            if let Some((_, parent)) = name.split_once('.') {
                if let Some(key) = self.entries.get(&format!("*.{}", parent)) {
                    return Arc::clone(key.value());
                }
            }
        }
        self.default_cert.load_full()
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.lookup(client_hello.server_name()))
    }
}

/// rustls server config resolving through `store`
pub fn server_config(store: Arc<CertificateStore>) -> anyhow::Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?
    .with_no_client_auth()
    .with_cert_resolver(store);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

fn load_record(record: &Certificate) -> anyhow::Result<Arc<CertifiedKey>> {
    let files = record
        .files
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("certificate has no files"))?;
    load_certificate_file(files)
}

/// Load a sealed bundle (with password) or a combined PEM file (without)
pub fn load_certificate_file(files: &CertificateFile) -> anyhow::Result<Arc<CertifiedKey>> {
    let path = Path::new(&files.path);
    let pem = match files.password.as_deref() {
        Some(password) if !password.is_empty() => bundle::read_bundle(path, password)?,
        _ => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read certificate file {}", path.display()))?,
    };
    certified_key_from_pem(pem.as_bytes())
}

/// Load a separate PEM certificate chain and PEM key
pub fn load_pem_pair(cert_path: &str, key_path: &str) -> anyhow::Result<Arc<CertifiedKey>> {
    let certs = std::fs::read(cert_path)
        .with_context(|| format!("Failed to open certificate file {}", cert_path))?;
    let key = std::fs::read(key_path)
        .with_context(|| format!("Failed to open key file {}", key_path))?;
    let chain = parse_certs(&certs)?;
    let key = parse_key(&key).ok_or_else(|| anyhow::anyhow!("No private key found in {}", key_path))?;
    certified_key(chain, key)
}

/// Build a `CertifiedKey` from PEM holding the chain and the private key
pub fn certified_key_from_pem(pem: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    let chain = parse_certs(pem)?;
    let key = parse_key(pem).ok_or_else(|| anyhow::anyhow!("No private key found in PEM"))?;
    certified_key(chain, key)
}

fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<Arc<CertifiedKey>> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

fn parse_certs(pem: &[u8]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates: {}", e))?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in PEM");
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Expiry of the leaf certificate in a PEM chain
pub fn not_after_from_pem(pem: &[u8]) -> Option<DateTime<Utc>> {
    use x509_parser::prelude::*;

    let certs = parse_certs(pem).ok()?;
    let leaf = certs.first()?;
    let (_, parsed) = X509Certificate::from_der(leaf.as_ref()).ok()?;
    Utc.timestamp_opt(parsed.validity().not_after.timestamp(), 0)
        .single()
}

/// Self-signed certificate for `names`, used as the handshake fallback
pub fn self_signed(names: &[&str]) -> anyhow::Result<Arc<CertifiedKey>> {
    let rcgen::CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;
    certified_key(vec![cert_der], key_der)
}

/// PEM chain plus key for a self-signed certificate
pub fn self_signed_pem(names: &[&str]) -> anyhow::Result<String> {
    let rcgen::CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;
    Ok(format!("{}{}", cert.pem(), key_pair.serialize_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_of(key: &CertifiedKey) -> Vec<u8> {
        key.cert[0].as_ref().to_vec()
    }

    fn write_pem(dir: &Path, domain: &str) -> CertificateFile {
        let path = dir.join(format!("{}.pem", domain.replace('*', "_")));
        std::fs::write(&path, self_signed_pem(&[domain]).unwrap()).unwrap();
        CertificateFile {
            path: path.to_string_lossy().to_string(),
            password: None,
        }
    }

    fn record(dir: &Path, domain: &str) -> Certificate {
        let mut cert = Certificate::new(domain);
        cert.files = Some(write_pem(dir, domain));
        cert
    }

    #[test]
    fn test_lookup_falls_back_to_default() {
        let store = CertificateStore::with_self_signed_default().unwrap();
        let default = leaf_of(&store.default_cert());

        // an unknown name, or no SNI at all, resolves to the default
        assert_eq!(leaf_of(&store.lookup(Some("unknown.example"))), default);
        assert_eq!(leaf_of(&store.lookup(None)), default);
    }

    #[test]
    fn test_reload_and_exact_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::with_self_signed_default().unwrap();
        store.reload(&[record(dir.path(), "a.example.com")]);

        assert!(store.contains("a.example.com"));
        let found = store.lookup(Some("A.Example.com"));
        assert_ne!(leaf_of(&found), leaf_of(&store.default_cert()));
    }

    #[test]
    fn test_wildcard_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::with_self_signed_default().unwrap();
        store.reload(&[record(dir.path(), "*.example.com")]);

        let wildcard = leaf_of(&store.lookup(Some("api.example.com")));
        assert_ne!(wildcard, leaf_of(&store.default_cert()));
        // only one label deep
        assert_eq!(
            leaf_of(&store.lookup(Some("a.b.example.com"))),
            leaf_of(&store.default_cert())
        );
    }

    #[test]
    fn test_reload_skips_broken_and_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::with_self_signed_default().unwrap();

        let mut broken = Certificate::new("broken.example.com");
        broken.files = Some(CertificateFile {
            path: dir.path().join("missing.pem").to_string_lossy().to_string(),
            password: None,
        });
        let mut expired = record(dir.path(), "old.example.com");
        expired.expired = true;
        let good = record(dir.path(), "good.example.com");

        store.reload(&[broken, expired, good]);
        assert_eq!(store.len(), 1);
        assert!(store.contains("good.example.com"));
    }

    #[test]
    fn test_reload_drops_removed_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::with_self_signed_default().unwrap();
        store.reload(&[record(dir.path(), "a.example.com"), record(dir.path(), "b.example.com")]);
        assert_eq!(store.len(), 2);

        store.reload(&[record(dir.path(), "b.example.com")]);
        assert_eq!(store.len(), 1);
        assert!(!store.contains("a.example.com"));
    }

    #[test]
    fn test_refresh_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::with_self_signed_default().unwrap();
        let mut cert = record(dir.path(), "a.example.com");
        store.refresh(&cert);
        assert!(store.contains("a.example.com"));

        cert.expired = true;
        store.refresh(&cert);
        assert!(!store.contains("a.example.com"));
    }

    #[test]
    fn test_mixed_case_records_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::with_self_signed_default().unwrap();
        let default = leaf_of(&store.default_cert());

        // records written before domains were normalized keep their case
        let mixed = |domain: &str| {
            let mut cert = record(dir.path(), domain);
            cert.domain = domain.to_string();
            cert
        };

        store.reload(&[mixed("Mixed.Example.COM")]);
        assert_ne!(leaf_of(&store.lookup(Some("mixed.example.com"))), default);
        // a second reload keeps the entry instead of dropping it as stale
        store.reload(&[mixed("Mixed.Example.COM")]);
        assert_eq!(store.len(), 1);

        store.refresh(&mixed("*.Upper.Example.com"));
        assert_ne!(leaf_of(&store.lookup(Some("api.upper.example.com"))), default);

        let mut gone = mixed("*.Upper.Example.com");
        gone.expired = true;
        store.refresh(&gone);
        assert_eq!(leaf_of(&store.lookup(Some("api.upper.example.com"))), default);
    }

    #[test]
    fn test_sealed_bundle_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.bundle");
        let pem = self_signed_pem(&["site.example.com"]).unwrap();
        bundle::write_bundle(&path, &pem, "pw").unwrap();

        let files = CertificateFile {
            path: path.to_string_lossy().to_string(),
            password: Some("pw".to_string()),
        };
        assert!(load_certificate_file(&files).is_ok());

        let wrong = CertificateFile {
            password: Some("nope".to_string()),
            ..files
        };
        assert!(load_certificate_file(&wrong).is_err());
    }

    #[test]
    fn test_not_after_from_pem() {
        let pem = self_signed_pem(&["x.example.com"]).unwrap();
        let not_after = not_after_from_pem(pem.as_bytes()).unwrap();
        assert!(not_after > Utc::now());
    }

    #[test]
    fn test_server_config_builds() {
        let store = Arc::new(CertificateStore::with_self_signed_default().unwrap());
        let config = server_config(store).unwrap();
        assert_eq!(config.alpn_protocols.len(), 2);
    }
}
