use portgate::api::{AdminServer, PKG_NAME, VERSION};
use portgate::config::Config;
use portgate::gateway::Gateway;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("portgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if explicit_path.is_none() && !config_path.exists() {
        warn!(path = %config_path.display(), "No configuration file found, using defaults");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    std::fs::create_dir_all(&config.server.certificate_dir).map_err(|e| {
        anyhow::anyhow!(
            "Failed to create certificate directory '{}': {}",
            config.server.certificate_dir,
            e
        )
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = Gateway::open(config.clone())?;

    // Launch every enabled service
    match gateway.load_all().await {
        Ok(statuses) => {
            let online = statuses.iter().filter(|s| s.online).count();
            info!(online, total = statuses.len(), "Services loaded");
        }
        Err(e) => error!(error = %e, "Failed to load services"),
    }

    // Certificate renewal
    let renewal_handle = tokio::spawn(Arc::clone(gateway.acme()).run_renewal(shutdown_rx.clone()));

    // Reload running services on security list changes
    let policy_handle = tokio::spawn(Arc::clone(&gateway).run_policy_reloader(shutdown_rx.clone()));

    // Create admin server (always loopback)
    let admin_addr = SocketAddr::from(([127, 0, 0, 1], config.server.admin_port));

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&gateway), shutdown_rx.clone(), admin_token);
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading services from the database...");
                    match gateway.load_all().await {
                        Ok(statuses) => {
                            let online = statuses.iter().filter(|s| s.online).count();
                            info!(online, total = statuses.len(), "Services reloaded");
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reload services");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all services...");
    gateway.shutdown().await;

    // Wait for background tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = admin_handle.await;
        let _ = policy_handle.await;
        let _ = renewal_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        database = %config.server.database,
        certificate_dir = %config.server.certificate_dir,
        default_cert = config.server.has_default_cert_files(),
        "Server configuration"
    );
    info!(
        directory = config.acme.directory_url.as_deref().unwrap_or("letsencrypt-production"),
        challenge_port = config.acme.challenge_port,
        renewal_interval_hours = config.acme.renewal_interval_hours,
        renew_before_days = config.acme.renew_before_days,
        "ACME settings"
    );
    info!(
        threshold = config.monitor.threshold,
        retention_minutes = config.monitor.retention_minutes,
        reload_on_policy_change = config.orchestrator.reload_on_policy_change,
        "Abnormal IP monitor settings"
    );
    info!(
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.proxy.pool_idle_timeout_secs,
        request_timeout_secs = config.proxy.request_timeout_secs,
        "Connection pool settings"
    );
}
