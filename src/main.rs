use hyper::body::Incoming;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use teamgate::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use teamgate::config::{Config, LogFormat, LoggingConfig};
use teamgate::engine::ProxyEngine;
use teamgate::landing::LandingPage;
use teamgate::orchestrator::{DockerOrchestrator, SharedOrchestrator};
use teamgate::pool::{ConnectionPool, PoolConfig};
use teamgate::proxy::{BalancerServer, RequestRouter};
use teamgate::transport::{HttpTransport, Transport};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load configuration from {}: {}", config_path.display(), e))?;

    init_logging(&config.logging)?;
    info!(path = %config_path.display(), "Configuration loaded");

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

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let docker = Arc::new(DockerOrchestrator::connect(config.orchestrator.clone()).await?);
    let orchestrator: SharedOrchestrator = docker.clone();

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let pool = Arc::new(ConnectionPool::new(pool_config));
    let transport: Arc<dyn Transport<Incoming>> =
        Arc::new(HttpTransport::new(pool, config.server.request_timeout()));

    let engine = ProxyEngine::from_config(&config.balancer, Arc::clone(&orchestrator), transport);
    let status_cache = Arc::clone(engine.status_cache());
    let identity = engine.identity().clone();
    let router = Arc::new(RequestRouter::new(LandingPage::from_config(&config.balancer), engine));

    let tls_acceptor = if config.server.tls_enabled() {
        let (certs, key) = match (&config.server.tls_cert, &config.server.tls_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
                (certs, key)
            }
            _ => {
                let (certs, key) = generate_self_signed_cert()?;
                warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
                (certs, key)
            }
        };

        let _ = rustls::crypto::ring::default_provider().install_default();
        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

        Some(TlsAcceptor::from(Arc::new(tls_config)))
    } else {
        None
    };

    let http_port = config.server.http_port();
    let https_port = config.server.https_port();

    let http_handle = if http_port > 0 {
        let http_addr = bind_address(&config.server.bind, http_port)?;
        let server = BalancerServer::new(http_addr, Arc::clone(&router), shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "HTTP balancer server error");
            }
        }))
    } else {
        None
    };

    let https_handle = match (&tls_acceptor, https_port) {
        (Some(acceptor), port) if port > 0 => {
            let https_addr = bind_address(&config.server.bind, port)?;
            let server = BalancerServer::new(https_addr, Arc::clone(&router), shutdown_rx.clone())
                .with_tls(acceptor.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "HTTPS balancer server error");
                }
            }))
        }
        _ => None,
    };

    // Admin API is always plain HTTP on localhost
    let admin_addr = bind_address("127.0.0.1", config.server.admin_port)?;
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_state = Arc::new(AdminState::new(orchestrator, status_cache, identity, admin_token));
    let admin_server = AdminServer::new(admin_addr, admin_state, shutdown_rx.clone());
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    if let Some(idle_timeout) = config.orchestrator.idle_timeout() {
        let interval = config.orchestrator.reclaim_interval();
        info!(
            idle_timeout_secs = idle_timeout.as_secs(),
            interval_secs = interval.as_secs(),
            "Idle instance reclaim enabled"
        );
        let reclaim_shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            reclaim_loop(docker, interval, reclaim_shutdown_rx).await;
        });
    }

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
        let _ = admin_handle.await;
    })
    .await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// RUST_LOG wins over the configured level when set
fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("warn,teamgate={}", logging.level))
            .map_err(|e| anyhow::anyhow!("Invalid logging.level '{}': {}", logging.level, e))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Full => builder.init(),
        LogFormat::Compact => builder.compact().init(),
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

async fn reclaim_loop(
    orchestrator: Arc<DockerOrchestrator>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let reclaimed = orchestrator.reclaim_idle().await;
                if !reclaimed.is_empty() {
                    info!(count = reclaimed.len(), "Reclaimed idle instances");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn bind_address(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", host, port).parse().map_err(|e| {
        error!(bind = %host, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", host, port, e)
    })
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

        // Non-blocking so a second instance fails fast
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
    info!(name = PKG_NAME, version = VERSION, "Starting balancer");
    let http_port = config.server.http_port();
    let https_port = config.server.https_port();
    info!(
        bind = %config.server.bind,
        http_port = if http_port > 0 { Some(http_port) } else { None },
        https_port = if https_port > 0 { Some(https_port) } else { None },
        admin_port = config.server.admin_port,
        tls = config.server.tls_enabled(),
        "Server configuration"
    );
    info!(
        cookie_name = %config.balancer.cookie_name,
        landing_path = %config.balancer.landing_path,
        upstream = %config.balancer.upstream,
        freshness_window_ms = config.balancer.freshness_window_ms,
        coalesce_lookups = config.balancer.coalesce_lookups,
        signed_cookies = config.balancer.cookie_secret.is_some(),
        "Balancer settings"
    );
    info!(
        image = %config.orchestrator.image,
        network = ?config.orchestrator.network,
        idle_timeout_secs = config.orchestrator.idle_timeout_secs,
        "Orchestrator settings"
    );
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}

fn generate_self_signed_cert() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((vec![cert_der], key_der))
}
