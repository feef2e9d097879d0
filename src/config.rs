use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the balancer
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and connection settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Team routing and caching behavior
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// How team instances are provisioned
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8080, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// HTTPS port (default: 8443 when TLS enabled, set to 0 to disable)
    pub tls_port: Option<u16>,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the internal admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle connections per team instance (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for an instance to respond (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Enable TLS (default: false). If true without cert/key, generates self-signed.
    #[serde(default)]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls || self.has_tls_files()
    }

    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Get HTTP port (0 means disabled)
    pub fn http_port(&self) -> u16 {
        self.port
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        if !self.tls_enabled() {
            return 0;
        }
        self.tls_port.unwrap_or(8443)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            tls_port: None,
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            pid_file: None,
            tls: false,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BalancerConfig {
    /// Name of the cookie carrying the team credential
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Prefix in front of the team name inside the cookie value
    #[serde(default = "default_team_prefix")]
    pub team_prefix: String,

    /// Path of the landing page; redirects point here
    #[serde(default = "default_landing_path")]
    pub landing_path: String,

    /// Directory with the landing page UI. The built-in page is used when unset
    pub static_dir: Option<String>,

    /// How long a status lookup or activity update stays fresh, in milliseconds
    #[serde(default = "default_freshness_window")]
    pub freshness_window_ms: u64,

    /// Let concurrent cache misses for one team share a single lookup
    #[serde(default = "default_true")]
    pub coalesce_lookups: bool,

    /// Secret for signed team cookies. Plain cookies are accepted when unset
    pub cookie_secret: Option<String>,

    /// Upstream URL template, `{team}` is replaced by the team name
    #[serde(default = "default_upstream")]
    pub upstream: String,
}

impl BalancerConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.cookie_name.is_empty() {
            errors.push("balancer.cookie_name must not be empty".to_string());
        }
        if !self.landing_path.starts_with('/') || !self.landing_path.ends_with('/') {
            errors.push(format!(
                "balancer.landing_path '{}' must start and end with '/'",
                self.landing_path
            ));
        }
        if self.landing_path == "/" {
            errors.push("balancer.landing_path must not be the root path".to_string());
        }
        if self.freshness_window_ms == 0 {
            errors.push("balancer.freshness_window_ms must be greater than 0".to_string());
        }
        let sample = self.upstream.replace("{team}", "sample-team");
        match sample.parse::<hyper::Uri>() {
            Ok(uri) if uri.scheme_str() == Some("http") && uri.authority().is_some() => {}
            _ => errors.push(format!(
                "balancer.upstream '{}' must be an http:// URL with a host",
                self.upstream
            )),
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            team_prefix: default_team_prefix(),
            landing_path: default_landing_path(),
            static_dir: None,
            freshness_window_ms: default_freshness_window(),
            coalesce_lookups: true,
            cookie_secret: None,
            upstream: default_upstream(),
        }
    }
}

/// Image pull policy for team instances
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before starting
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

/// Settings for the Docker-backed orchestrator
#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Docker host URL (default: DOCKER_HOST or common socket paths)
    pub docker_host: Option<String>,

    /// Image every team instance runs
    #[serde(default = "default_image")]
    pub image: String,

    /// Image pull policy: "always", "never", or "if-not-present" (default)
    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Port the application listens on inside the container
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// Container names are `<container_prefix>-<team>`
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// Docker network that instances (and the balancer) share
    pub network: Option<String>,

    /// Network alias template, `{team}` is replaced by the team name
    #[serde(default = "default_service_alias")]
    pub service_alias: String,

    /// Memory limit (e.g., "512m", "1g")
    pub memory: Option<String>,

    /// CPU limit (e.g., "0.5", "2")
    pub cpus: Option<String>,

    /// Environment variables passed to every instance
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Reclaim instances without requests for this long (0 disables)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How often idle instances are looked for
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: u64,

    /// Grace period in seconds when stopping an instance
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_secs: u64,

    /// Readiness check Docker runs inside each instance
    #[serde(default)]
    pub healthcheck: HealthcheckConfig,
}

/// Container healthcheck. Until it passes, a running instance counts as
/// restarting rather than ready.
#[derive(Debug, Deserialize, Clone)]
pub struct HealthcheckConfig {
    /// Set to false to treat any running container as ready
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Full Docker test command (e.g. `["CMD-SHELL", "curl -f localhost:3000"]`).
    /// Defaults to an HTTP GET of `health_path` through the image's node binary.
    pub command: Option<Vec<String>>,

    /// Path probed by the default command
    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,

    /// Consecutive failures before the container is unhealthy
    #[serde(default = "default_health_retries")]
    pub retries: u32,

    /// Boot time during which failures are not counted
    #[serde(default = "default_health_start_period")]
    pub start_period_ms: u64,
}

impl HealthcheckConfig {
    /// Docker `Healthcheck.Test` for an app listening on `port`
    pub fn test(&self, port: u16) -> Vec<String> {
        if let Some(command) = &self.command {
            return command.clone();
        }
        let url = format!("http://localhost:{}{}", port, self.health_path);
        vec![
            "CMD".to_string(),
            "/nodejs/bin/node".to_string(),
            "-e".to_string(),
            format!(
                "require('http').get('{}', r => process.exit(r.statusCode === 200 ? 0 : 1)).on('error', () => process.exit(1))",
                url
            ),
        ]
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn start_period(&self) -> Duration {
        Duration::from_millis(self.start_period_ms)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if !self.enabled {
            return;
        }
        if self.command.as_ref().is_some_and(|command| command.is_empty()) {
            errors.push("orchestrator.healthcheck.command must not be empty".to_string());
        }
        if !self.health_path.starts_with('/') {
            errors.push("orchestrator.healthcheck.health_path must start with '/'".to_string());
        }
        // Docker rejects intervals and timeouts below 1ms
        if self.interval_ms == 0 || self.timeout_ms == 0 {
            errors.push("orchestrator.healthcheck interval_ms and timeout_ms must be greater than 0".to_string());
        }
        if self.retries == 0 {
            errors.push("orchestrator.healthcheck.retries must be greater than 0".to_string());
        }
    }
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: None,
            health_path: default_health_path(),
            interval_ms: default_health_interval(),
            timeout_ms: default_health_timeout(),
            retries: default_health_retries(),
            start_period_ms: default_health_start_period(),
        }
    }
}

impl OrchestratorConfig {
    pub fn container_name(&self, team: &str) -> String {
        format!("{}-{}", self.container_prefix, team)
    }

    pub fn service_alias(&self, team: &str) -> String {
        self.service_alias.replace("{team}", team)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs.max(1))
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.image.is_empty() {
            errors.push("orchestrator.image must not be empty".to_string());
        }
        if self.container_port == 0 {
            errors.push("orchestrator.container_port must be greater than 0".to_string());
        }
        if self.container_prefix.is_empty() {
            errors.push("orchestrator.container_prefix must not be empty".to_string());
        }
        self.healthcheck.validate(errors);
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            image: default_image(),
            pull_policy: PullPolicy::default(),
            container_port: default_container_port(),
            container_prefix: default_container_prefix(),
            network: None,
            service_alias: default_service_alias(),
            memory: None,
            cpus: None,
            env: HashMap::new(),
            idle_timeout_secs: default_idle_timeout(),
            reclaim_interval_secs: default_reclaim_interval(),
            stop_grace_period_secs: default_stop_grace_period(),
            healthcheck: HealthcheckConfig::default(),
        }
    }
}

/// Output format for log lines
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Level for this crate's targets when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
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

fn default_cookie_name() -> String {
    "balancer".to_string()
}

fn default_team_prefix() -> String {
    "t-".to_string()
}

fn default_landing_path() -> String {
    "/balancer/".to_string()
}

fn default_freshness_window() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_upstream() -> String {
    "http://{team}-instance:3000".to_string()
}

fn default_image() -> String {
    "bkimminich/juice-shop:latest".to_string()
}

fn default_container_port() -> u16 {
    3000
}

fn default_container_prefix() -> String {
    "teamgate".to_string()
}

fn default_service_alias() -> String {
    "{team}-instance".to_string()
}

fn default_idle_timeout() -> u64 {
    24 * 60 * 60
}

fn default_reclaim_interval() -> u64 {
    60
}

fn default_stop_grace_period() -> u64 {
    10
}

fn default_health_path() -> String {
    "/rest/admin/application-version".to_string()
}

fn default_health_interval() -> u64 {
    2000
}

fn default_health_timeout() -> u64 {
    1000
}

fn default_health_retries() -> u32 {
    3
}

fn default_health_start_period() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
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

        self.balancer.validate(&mut errors);
        self.orchestrator.validate(&mut errors);

        if self.server.port == 0 && self.server.https_port() == 0 {
            errors.push("server: at least one of port or tls_port must be enabled".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
