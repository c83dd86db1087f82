//! Service lifecycle: launching, stopping and reconfiguring listeners
//!
//! The registry maps a service id to its running listener. Mutations of one
//! service are serialized through a per-id async mutex; different services
//! proceed independently.
//!
//! Launch is asynchronous. [`Orchestrator::start`] marks the service as
//! starting, binds and serves on a spawned task, then polls registry membership
//! a bounded number of times. A service that is not yet online when polling
//! ends is reported offline, which is not an error. Bind failures are logged
//! and leave the service out of the registry; nothing retries automatically.

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::acme::{ChallengeListener, Http01Challenges};
use crate::certs::{server_config, CertificateStore};
use crate::config::{Config, OrchestratorConfig};
use crate::error::GatewayError;
use crate::listener::{Listener, ListenerContext, Pipeline};
use crate::model::{validate_service, ServiceInstance};
use crate::monitor::AbnormalIpMonitor;
use crate::store::Store;
use crate::telemetry::GatewayStats;
use crate::upstream::UpstreamPool;

/// Runtime state of a service as seen by callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub id: String,
    pub online: bool,
}

/// A listener owned by the registry
struct ListenerHandle {
    port: u16,
    is_https: bool,
    local_addr: Option<SocketAddr>,
    pipeline: Arc<ArcSwap<Pipeline>>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Components every listener shares
pub struct SharedComponents {
    pub store: Arc<Store>,
    pub certs: Arc<CertificateStore>,
    pub pool: Arc<UpstreamPool>,
    pub challenges: Http01Challenges,
    pub monitor: Arc<AbnormalIpMonitor>,
    pub stats: Arc<GatewayStats>,
}

pub struct Orchestrator {
    shared: SharedComponents,
    bind_ip: IpAddr,
    config: OrchestratorConfig,
    request_timeout: Duration,
    registry: DashMap<String, ListenerHandle>,
    /// Ids with a launch in flight; removing an id cancels its registration
    starting: DashMap<String, ()>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(shared: SharedComponents, config: &Config) -> anyhow::Result<Arc<Self>> {
        let bind_ip: IpAddr = config
            .server
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid server.bind '{}': {}", config.server.bind, e))?;

        Ok(Arc::new(Self {
            shared,
            bind_ip,
            config: config.orchestrator.clone(),
            request_timeout: config.proxy.request_timeout(),
            registry: DashMap::new(),
            starting: DashMap::new(),
            locks: DashMap::new(),
        }))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.shared.store
    }

    fn key_lock(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.to_string()).or_default().value())
    }

    /// Forget the key lock of a deleted service unless someone still holds it
    fn release_lock(&self, id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks.remove_if(id, |_, held| Arc::strong_count(held) == 1);
    }

    fn persisted(&self, id: &str) -> Result<ServiceInstance, GatewayError> {
        self.shared
            .store
            .snapshot()
            .service(id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("service {}", id)))
    }

    fn ensure_unique_name(&self, service: &ServiceInstance) -> Result<(), GatewayError> {
        let snapshot = self.shared.store.snapshot();
        if let Some(other) = snapshot
            .services
            .iter()
            .find(|s| s.id != service.id && s.name.eq_ignore_ascii_case(&service.name))
        {
            return Err(GatewayError::Conflict(format!(
                "service name '{}' is already used by {}",
                service.name, other.id
            )));
        }
        Ok(())
    }

    // ==================== Registry Queries ====================

    pub fn is_online(&self, id: &str) -> bool {
        self.registry.contains_key(id)
    }

    pub fn batch_stats(&self, ids: &[String]) -> Vec<ServiceStatus> {
        ids.iter()
            .map(|id| ServiceStatus {
                id: id.clone(),
                online: self.is_online(id),
            })
            .collect()
    }

    /// Address the service's listener is bound to
    pub fn local_addr(&self, id: &str) -> Option<SocketAddr> {
        self.registry.get(id).and_then(|h| h.local_addr)
    }

    pub fn running(&self) -> Vec<String> {
        self.registry.iter().map(|e| e.key().clone()).collect()
    }

    fn status(&self, id: &str) -> ServiceStatus {
        ServiceStatus {
            id: id.to_string(),
            online: self.is_online(id),
        }
    }

    // ==================== Service Operations ====================

    /// Stop everything, then launch every enabled persisted service
    pub async fn load_all(self: &Arc<Self>) -> Result<Vec<ServiceStatus>, GatewayError> {
        self.stop_all().await;
        let snapshot = self.shared.store.refresh()?;

        let enabled: Vec<ServiceInstance> = snapshot.services.iter().filter(|s| s.enabled).cloned().collect();
        info!(total = snapshot.services.len(), enabled = enabled.len(), "Loading services");

        for service in &enabled {
            if let Err(e) = self.begin_launch(&service.id).await {
                warn!(service = service.id, error = %e, "Service vanished before launch");
            }
        }

        let mut statuses = Vec::with_capacity(enabled.len());
        for service in &enabled {
            statuses.push(ServiceStatus {
                id: service.id.clone(),
                online: self.wait_online(&service.id).await,
            });
        }
        Ok(statuses)
    }

    pub async fn create_service(self: &Arc<Self>, mut service: ServiceInstance) -> Result<ServiceStatus, GatewayError> {
        validate_service(&service)?;
        if self.shared.store.snapshot().service(&service.id).is_some() {
            return Err(GatewayError::Conflict(format!("service {} already exists", service.id)));
        }
        self.ensure_unique_name(&service)?;

        let now = Utc::now();
        service.created_at = now;
        service.updated_at = now;
        for location in &mut service.locations {
            location.service_id = service.id.clone();
        }
        self.shared.store.save_service(&service)?;
        info!(service = service.id, name = service.name, port = service.listen_port, "Service created");

        if !service.enabled {
            return Ok(self.status(&service.id));
        }
        self.start(&service.id).await
    }

    /// Persist new settings without touching a running listener
    pub async fn update_service(&self, mut service: ServiceInstance) -> Result<ServiceStatus, GatewayError> {
        validate_service(&service)?;
        let existing = self.persisted(&service.id)?;
        self.ensure_unique_name(&service)?;

        service.created_at = existing.created_at;
        service.updated_at = Utc::now();
        for location in &mut service.locations {
            location.service_id = service.id.clone();
        }
        self.shared.store.save_service(&service)?;

        if self.is_online(&service.id) {
            info!(service = service.id, "Service updated; running listener keeps its configuration until reload");
        } else {
            info!(service = service.id, "Service updated");
        }
        Ok(self.status(&service.id))
    }

    /// Stop, then delete the service and its locations in one transaction
    ///
    /// If the delete fails, a listener that was running is launched again.
    pub async fn delete_service(&self, id: &str) -> Result<(), GatewayError> {
        let service = self.persisted(id)?;
        let lock = self.key_lock(id);
        let _guard = lock.lock().await;

        self.starting.remove(id);
        let was_running = self.shutdown(id).await;

        match self.shared.store.delete_service(id) {
            Ok(true) => {
                info!(service = id, "Service deleted");
                drop(_guard);
                self.release_lock(id, lock);
                Ok(())
            }
            Ok(false) => Err(GatewayError::not_found(format!("service {}", id))),
            Err(e) => {
                error!(service = id, error = %e, "Service delete failed, rolling back");
                if was_running {
                    if let Err(launch_err) = self.launch(&service).await {
                        error!(service = id, error = %launch_err, "Failed to relaunch service after rollback");
                    }
                }
                Err(GatewayError::Store(e))
            }
        }
    }

    /// Launch the persisted service unless it is running or starting
    pub async fn start(self: &Arc<Self>, id: &str) -> Result<ServiceStatus, GatewayError> {
        self.begin_launch(id).await?;
        let online = self.wait_online(id).await;
        Ok(ServiceStatus {
            id: id.to_string(),
            online,
        })
    }

    pub async fn stop(&self, id: &str) -> Result<ServiceStatus, GatewayError> {
        self.persisted(id)?;
        let lock = self.key_lock(id);
        let _guard = lock.lock().await;

        self.starting.remove(id);
        if !self.shutdown(id).await {
            debug!(service = id, "Service already stopped");
        }
        Ok(self.status(id))
    }

    pub async fn restart(self: &Arc<Self>, id: &str) -> Result<ServiceStatus, GatewayError> {
        self.stop(id).await?;
        self.start(id).await
    }

    /// Persist `enabled` and converge the runtime state to it
    pub async fn start_or_stop(self: &Arc<Self>, id: &str, enabled: bool) -> Result<ServiceStatus, GatewayError> {
        let mut service = self.persisted(id)?;
        if service.enabled != enabled {
            service.enabled = enabled;
            service.updated_at = Utc::now();
            self.shared.store.save_service(&service)?;
        }
        if enabled {
            self.start(id).await
        } else {
            self.stop(id).await
        }
    }

    /// Swap in freshly compiled routes and policies without rebinding
    pub async fn reload(&self, id: &str) -> Result<ServiceStatus, GatewayError> {
        let service = self.persisted(id)?;
        let lock = self.key_lock(id);
        let _guard = lock.lock().await;

        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| GatewayError::NotRunning(id.to_string()))?;
        if handle.port != service.listen_port || handle.is_https != service.is_https {
            warn!(
                service = id,
                running_port = handle.port,
                persisted_port = service.listen_port,
                "Port or TLS changed; takes effect on restart"
            );
        }

        let pipeline = Pipeline::build(&service, &self.shared.store.snapshot(), self.request_timeout)?;
        handle.pipeline.store(Arc::new(pipeline));
        info!(service = id, "Service reloaded");
        Ok(ServiceStatus {
            id: id.to_string(),
            online: true,
        })
    }

    /// Reload every running service, e.g. after a security list change
    pub async fn reload_running(&self) {
        for id in self.running() {
            if let Err(e) = self.reload(&id).await {
                warn!(service = id, error = %e, "Failed to reload service");
            }
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .registry
            .iter()
            .map(|e| e.key().clone())
            .chain(self.starting.iter().map(|e| e.key().clone()))
            .collect();
        for id in ids {
            let lock = self.key_lock(&id);
            let _guard = lock.lock().await;
            self.starting.remove(&id);
            self.shutdown(&id).await;
        }
    }

    // ==================== Launch Internals ====================

    /// Mark the service as starting and launch it on its own task
    ///
    /// The record is read under the key lock, so a service deleted while
    /// the caller waited is reported missing instead of launched.
    async fn begin_launch(self: &Arc<Self>, id: &str) -> Result<(), GatewayError> {
        let lock = self.key_lock(id);
        let guard = lock.lock().await;

        if let Err(e) = self.persisted(id) {
            drop(guard);
            self.release_lock(id, lock);
            return Err(e);
        }
        if self.registry.contains_key(id) {
            debug!(service = id, "Service already running");
            return Ok(());
        }
        if self.starting.insert(id.to_string(), ()).is_some() {
            debug!(service = id, "Service already starting");
            return Ok(());
        }

        let orchestrator = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            let lock = orchestrator.key_lock(&id);
            let guard = lock.lock().await;

            // Stopped before we got here
            if !orchestrator.starting.contains_key(&id) {
                debug!(service = id, "Launch cancelled");
            } else {
                match orchestrator.persisted(&id) {
                    Ok(service) => {
                        if let Err(e) = orchestrator.launch(&service).await {
                            error!(
                                service = service.id,
                                name = service.name,
                                port = service.listen_port,
                                error = %e,
                                "Failed to launch service"
                            );
                        }
                    }
                    Err(_) => debug!(service = id, "Service deleted before launch"),
                }
                orchestrator.starting.remove(&id);
            }

            drop(guard);
            if orchestrator.persisted(&id).is_err() {
                orchestrator.release_lock(&id, lock);
            }
        });
        Ok(())
    }

    /// Bind and serve; the caller holds the service's key lock
    async fn launch(&self, service: &ServiceInstance) -> Result<(), GatewayError> {
        if let Some(owner) = self
            .registry
            .iter()
            .find(|e| e.port == service.listen_port && e.key() != &service.id)
        {
            return Err(GatewayError::Bind(format!(
                "port {} is owned by service {}",
                service.listen_port,
                owner.key()
            )));
        }

        let snapshot = self.shared.store.snapshot();
        let pipeline = Pipeline::build(service, &snapshot, self.request_timeout)?;

        let tls_acceptor = if service.is_https {
            let config = server_config(Arc::clone(&self.shared.certs))
                .map_err(|e| GatewayError::Bind(format!("TLS setup failed: {}", e)))?;
            Some(TlsAcceptor::from(config))
        } else {
            None
        };
        if service.enable_http3 {
            warn!(service = service.id, "HTTP/3 requested; serving HTTP/1.1 and HTTP/2 only");
        }

        let pipeline = Arc::new(ArcSwap::from_pointee(pipeline));
        let ctx = Arc::new(ListenerContext {
            service_id: service.id.clone(),
            pipeline: Arc::clone(&pipeline),
            pool: Arc::clone(&self.shared.pool),
            challenges: self.shared.challenges.clone(),
            monitor: Arc::clone(&self.shared.monitor),
            stats: Arc::clone(&self.shared.stats),
            is_tls: service.is_https,
        });

        let addr = SocketAddr::new(self.bind_ip, service.listen_port);
        let listener = Listener::bind(addr, tls_acceptor, ctx).await?;
        let local_addr = listener.local_addr();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        self.registry.insert(
            service.id.clone(),
            ListenerHandle {
                port: service.listen_port,
                is_https: service.is_https,
                local_addr,
                pipeline,
                shutdown_tx,
                task,
            },
        );
        info!(service = service.id, name = service.name, %addr, "Service online");
        Ok(())
    }

    /// Remove the listener and wait for its socket to close
    async fn shutdown(&self, id: &str) -> bool {
        let Some((_, handle)) = self.registry.remove(id) else {
            return false;
        };

        let _ = handle.shutdown_tx.send(true);
        let mut task = handle.task;
        match tokio::time::timeout(self.config.stop_timeout(), &mut task).await {
            Ok(_) => info!(service = id, "Service stopped"),
            Err(_) => {
                warn!(service = id, "Listener did not stop in time, aborting");
                task.abort();
            }
        }
        true
    }

    /// Poll registry membership on the configured schedule
    async fn wait_online(&self, id: &str) -> bool {
        for _ in 0..self.config.start_poll_attempts {
            if self.is_online(id) {
                return true;
            }
            if !self.starting.contains_key(id) {
                // launch finished without registering
                return self.is_online(id);
            }
            tokio::time::sleep(self.config.start_poll_interval()).await;
        }
        let online = self.is_online(id);
        if !online {
            debug!(service = id, "Service not online yet");
        }
        online
    }
}

impl ChallengeListener for Orchestrator {
    fn plain_listener_online(&self, port: u16) -> bool {
        self.registry.iter().any(|e| e.port == port && !e.is_https)
    }
}
