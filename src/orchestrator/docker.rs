//! Team instances as Docker containers
//!
//! Each team gets one container named `<prefix>-<team>`, labelled so the
//! balancer can find its own containers again after a restart. Passcode
//! hashes and request timestamps change far more often than containers do,
//! so they live in an in-memory registry instead of container labels.

use super::{InstanceReplicas, InstanceSummary, LookupError, Orchestrator, OrchestratorError};
use crate::config::{OrchestratorConfig, PullPolicy};
use crate::identity::TeamId;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerState, EndpointSettings, HealthConfig, HealthStatusEnum, HostConfig};
use bollard::network::ConnectNetworkOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Label holding the team name
pub const LABEL_TEAM: &str = "teamgate.team";
/// Label marking containers this balancer manages
pub const LABEL_MANAGED: &str = "teamgate.managed";

/// What the balancer remembers about a team between requests
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TeamRecord {
    pub passcode_hash: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_request: Option<DateTime<Utc>>,
}

pub struct DockerOrchestrator {
    client: Docker,
    config: OrchestratorConfig,
    registry: DashMap<TeamId, TeamRecord>,
}

impl DockerOrchestrator {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. `orchestrator.docker_host`
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let client = if let Some(host) = config.docker_host.as_deref() {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                     Ensure Docker is running and accessible.",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        let orchestrator = Self {
            client,
            config,
            registry: DashMap::new(),
        };
        orchestrator.sync_registry().await?;
        Ok(orchestrator)
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        let mut tried_paths = Vec::new();

        for (name, path) in &socket_paths {
            // Skip paths built from empty env vars
            if path.is_empty() || path.starts_with("/.") || path.starts_with("/podman") {
                continue;
            }

            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                    Ok(client) => {
                        if client.ping().await.is_ok() {
                            return Ok(client);
                        }
                        tried_paths.push(format!("{} ({}) - socket exists but daemon not responding", path, name));
                    }
                    Err(e) => {
                        tried_paths.push(format!("{} ({}) - connection failed: {}", path, name, e));
                    }
                }
            }
        }

        match Docker::connect_with_socket_defaults() {
            Ok(client) => Ok(client),
            Err(e) => {
                let tried_info = if tried_paths.is_empty() {
                    "No Docker socket found at common locations".to_string()
                } else {
                    format!("Tried:\n  - {}", tried_paths.join("\n  - "))
                };

                anyhow::bail!(
                    "Cannot connect to Docker daemon. {}\n\n\
                     To fix this:\n\
                     - Start Docker Desktop, Colima, or dockerd\n\
                     - Or set DOCKER_HOST environment variable\n\
                     - Or set orchestrator.docker_host in the configuration\n\n\
                     Underlying error: {}",
                    tried_info, e
                )
            }
        }
    }

    /// Register containers that already exist so they are listed and reclaimed
    async fn sync_registry(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let containers = self.managed_containers().await.map_err(|e| anyhow::anyhow!("{}", e))?;

        for summary in &containers {
            let Some(team) = summary.labels.as_ref().and_then(team_from_labels) else {
                continue;
            };
            self.registry.entry(team).or_insert_with(|| TeamRecord {
                passcode_hash: None,
                created_at: summary.created.and_then(|secs| DateTime::from_timestamp(secs, 0)),
                // Existing instances get a full idle period from startup
                last_request: Some(now),
            });
        }

        info!(instances = self.registry.len(), "Loaded existing team instances");
        Ok(())
    }

    pub fn record(&self, team: &TeamId) -> Option<TeamRecord> {
        self.registry.get(team).map(|record| record.clone())
    }

    /// Pull the instance image if needed based on pull policy
    async fn pull_image_if_needed(&self) -> anyhow::Result<()> {
        let image = self.config.image.as_str();
        let should_pull = match self.config.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::Never => {
                if self.client.inspect_image(image).await.is_err() {
                    anyhow::bail!(
                        "Image '{}' not found locally and pull_policy is 'never'. \
                         Pull the image manually with 'docker pull {}' or change pull_policy.",
                        image, image
                    );
                }
                false
            }
            PullPolicy::IfNotPresent => match self.client.inspect_image(image).await {
                Ok(_) => {
                    debug!(image, "Image exists locally, skipping pull");
                    false
                }
                Err(_) => true,
            },
        };

        if should_pull {
            info!(image, "Pulling Docker image");
            let options = CreateImageOptions {
                from_image: image,
                ..Default::default()
            };

            let mut stream = self.client.create_image(Some(options), None, None);
            let mut last_error = None;

            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(status) = info.status {
                            debug!(image, status, "Pull progress");
                        }
                        if let Some(error) = info.error {
                            last_error = Some(error);
                        }
                    }
                    Err(e) => {
                        let err_str = e.to_string();
                        if err_str.contains("manifest unknown") || err_str.contains("not found") {
                            anyhow::bail!(
                                "Image '{}' not found in registry. Check the image name and tag are correct.",
                                image
                            );
                        } else if err_str.contains("unauthorized") || err_str.contains("authentication") {
                            anyhow::bail!(
                                "Authentication required to pull '{}'. Run 'docker login' first or check your credentials.",
                                image
                            );
                        } else {
                            anyhow::bail!("Failed to pull image '{}': {}", image, e);
                        }
                    }
                }
            }

            if let Some(error) = last_error {
                anyhow::bail!("Failed to pull image '{}': {}", image, error);
            }

            info!(image, "Image pulled successfully");
        }

        Ok(())
    }

    async fn managed_containers(&self) -> Result<Vec<bollard::models::ContainerSummary>, OrchestratorError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", LABEL_MANAGED)]);

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        self.client
            .list_containers(Some(options))
            .await
            .map_err(|e| OrchestratorError::Backend(e.to_string()))
    }

    /// Stop a container gracefully, then remove it
    async fn remove_instance(&self, container_name: &str) -> Result<(), OrchestratorError> {
        let options = StopContainerOptions {
            t: self.config.stop_grace_period().as_secs() as i64,
        };

        match self.client.stop_container(container_name, Some(options)).await {
            Ok(_) => debug!(container_name, "Stopped Docker container"),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                debug!(container_name, "Container was already stopped");
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                debug!(container_name, "Container not found");
                return Ok(());
            }
            Err(e) => return Err(OrchestratorError::Backend(format!("failed to stop container: {}", e))),
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container_name, Some(options)).await {
            Ok(_) => {
                debug!(container_name, "Removed Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(OrchestratorError::Backend(format!("failed to remove container: {}", e))),
        }
    }

    /// Stop and remove instances whose last request is older than the idle
    /// timeout. Returns the reclaimed teams.
    pub async fn reclaim_idle(&self) -> Vec<TeamId> {
        let Some(timeout) = self.config.idle_timeout() else {
            return Vec::new();
        };

        let now = Utc::now();
        let idle: Vec<TeamId> = self
            .registry
            .iter()
            .filter(|entry| is_idle(entry.value(), now, timeout))
            .map(|entry| entry.key().clone())
            .collect();

        let mut reclaimed = Vec::new();
        for team in idle {
            let container_name = self.config.container_name(team.as_str());
            match self.remove_instance(&container_name).await {
                Ok(()) => {
                    self.registry.remove(&team);
                    info!(team = %team, container_name, "Reclaimed idle team instance");
                    reclaimed.push(team);
                }
                Err(e) => warn!(team = %team, error = %e, "Failed to reclaim idle instance"),
            }
        }
        reclaimed
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn get_instance(&self, team: &TeamId) -> Result<InstanceReplicas, LookupError> {
        let container_name = self.config.container_name(team.as_str());
        match self.client.inspect_container(&container_name, None).await {
            Ok(info) => Ok(replicas_from_state(info.state.as_ref())),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Err(LookupError::NotFound(team.to_string()))
            }
            Err(e) => Err(LookupError::Unavailable(e.to_string())),
        }
    }

    async fn update_last_request_timestamp(&self, team: &TeamId) -> Result<(), OrchestratorError> {
        self.registry.entry(team.clone()).or_default().last_request = Some(Utc::now());
        Ok(())
    }

    async fn create_deployment(&self, team: &TeamId, passcode_hash: &str) -> Result<(), OrchestratorError> {
        let container_name = self.config.container_name(team.as_str());

        match self.client.inspect_container(&container_name, None).await {
            Ok(_) => return Err(OrchestratorError::AlreadyExists(team.to_string())),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {}
            Err(e) => return Err(OrchestratorError::Backend(e.to_string())),
        }

        self.pull_image_if_needed()
            .await
            .map_err(|e| OrchestratorError::Backend(e.to_string()))?;

        let container_config = container_config(&self.config, team)?;
        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                OrchestratorError::Backend(format!(
                    "failed to create container '{}' from image '{}': {}",
                    container_name, self.config.image, e
                ))
            })?;

        let container_id = response.id;
        info!(team = %team, container_id, container_name, image = %self.config.image, "Created Docker container");

        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                OrchestratorError::Backend(format!("failed to start container '{}': {}", container_name, e))
            })?;

        info!(team = %team, container_id, "Started Docker container");

        let now = Utc::now();
        self.registry.insert(
            team.clone(),
            TeamRecord {
                passcode_hash: Some(passcode_hash.to_string()),
                created_at: Some(now),
                last_request: Some(now),
            },
        );
        Ok(())
    }

    async fn create_service(&self, team: &TeamId) -> Result<(), OrchestratorError> {
        let Some(network) = self.config.network.as_deref() else {
            debug!(team = %team, "No network configured, instance keeps its default networking");
            return Ok(());
        };

        let container_name = self.config.container_name(team.as_str());
        let alias = self.config.service_alias(team.as_str());
        let options = ConnectNetworkOptions {
            container: container_name.clone(),
            endpoint_config: EndpointSettings {
                aliases: Some(vec![alias.clone()]),
                ..Default::default()
            },
        };

        match self.client.connect_network(network, options).await {
            Ok(()) => {
                info!(team = %team, network, alias, "Connected instance to network");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, message }) => {
                Err(OrchestratorError::NotFound(format!("{} ({})", team, message)))
            }
            Err(e) => Err(OrchestratorError::Backend(format!(
                "failed to connect '{}' to network '{}': {}",
                container_name, network, e
            ))),
        }
    }

    async fn delete_deployment(&self, team: &TeamId) -> Result<(), OrchestratorError> {
        let container_name = self.config.container_name(team.as_str());
        self.remove_instance(&container_name).await?;
        self.registry.remove(team);
        info!(team = %team, container_name, "Removed team instance");
        Ok(())
    }

    async fn delete_instance_pod(&self, team: &TeamId) -> Result<(), OrchestratorError> {
        let container_name = self.config.container_name(team.as_str());
        let options = RestartContainerOptions {
            t: self.config.stop_grace_period().as_secs() as isize,
        };

        match self.client.restart_container(&container_name, Some(options)).await {
            Ok(()) => {
                info!(team = %team, container_name, "Restarted Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Err(OrchestratorError::NotFound(team.to_string()))
            }
            Err(e) => Err(OrchestratorError::Backend(e.to_string())),
        }
    }

    async fn change_passcode_hash(&self, team: &TeamId, passcode_hash: &str) -> Result<(), OrchestratorError> {
        let container_name = self.config.container_name(team.as_str());
        match self.client.inspect_container(&container_name, None).await {
            Ok(_) => {}
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                return Err(OrchestratorError::NotFound(team.to_string()));
            }
            Err(e) => return Err(OrchestratorError::Backend(e.to_string())),
        }

        self.registry.entry(team.clone()).or_default().passcode_hash = Some(passcode_hash.to_string());
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSummary>, OrchestratorError> {
        let containers = self.managed_containers().await?;

        let mut instances: Vec<InstanceSummary> = containers
            .iter()
            .filter_map(|summary| {
                let team = summary.labels.as_ref().and_then(team_from_labels)?;
                let record = self.record(&team);
                Some(InstanceSummary {
                    ready: summary_ready(summary.state.as_deref(), summary.status.as_deref()),
                    created_at: summary.created.and_then(|secs| DateTime::from_timestamp(secs, 0)),
                    last_request: record.and_then(|r| r.last_request),
                    team: team.to_string(),
                })
            })
            .collect();

        instances.sort_by(|a, b| a.team.cmp(&b.team));
        Ok(instances)
    }
}

/// Replica counts for a container in the given state.
///
/// A running container counts as available; it is also ready unless its
/// healthcheck is still starting or failing.
fn replicas_from_state(state: Option<&ContainerState>) -> InstanceReplicas {
    let Some(state) = state else {
        return InstanceReplicas::default();
    };
    if !state.running.unwrap_or(false) {
        return InstanceReplicas::default();
    }

    match state.health.as_ref().and_then(|health| health.status.as_ref()) {
        Some(HealthStatusEnum::STARTING) | Some(HealthStatusEnum::UNHEALTHY) => InstanceReplicas::new(0, 1),
        _ => InstanceReplicas::new(1, 1),
    }
}

/// Readiness from a container listing, where health only shows up in the status text
fn summary_ready(state: Option<&str>, status: Option<&str>) -> bool {
    let status = status.unwrap_or("");
    state == Some("running") && !status.contains("health: starting") && !status.contains("unhealthy")
}

fn team_from_labels(labels: &HashMap<String, String>) -> Option<TeamId> {
    TeamId::parse(labels.get(LABEL_TEAM)?)
}

fn is_idle(record: &TeamRecord, now: DateTime<Utc>, timeout: Duration) -> bool {
    let Some(last_seen) = record.last_request.or(record.created_at) else {
        return false;
    };
    (now - last_seen).to_std().map(|age| age >= timeout).unwrap_or(false)
}

/// Container definition for a team's instance
fn container_config(config: &OrchestratorConfig, team: &TeamId) -> Result<Config<String>, OrchestratorError> {
    let mut env: Vec<String> = config.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    env.sort();

    let mut labels = HashMap::new();
    labels.insert(LABEL_TEAM.to_string(), team.to_string());
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    exposed_ports.insert(format!("{}/tcp", config.container_port), HashMap::new());

    let mut host_config = HostConfig::default();
    if let Some(memory) = &config.memory {
        host_config.memory =
            Some(parse_memory_limit(memory).map_err(|e| OrchestratorError::Backend(e.to_string()))?);
    }
    if let Some(cpus) = &config.cpus {
        let cpu_count: f64 = cpus
            .parse()
            .map_err(|_| OrchestratorError::Backend(format!("Invalid CPU limit: {}", cpus)))?;
        // NanoCPUs is CPUs * 1e9
        host_config.nano_cpus = Some((cpu_count * 1_000_000_000.0) as i64);
    }

    Ok(Config {
        image: Some(config.image.clone()),
        env: Some(env),
        labels: Some(labels),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        healthcheck: health_config(config),
        ..Default::default()
    })
}

/// Docker healthcheck for instances; durations are in nanoseconds
fn health_config(config: &OrchestratorConfig) -> Option<HealthConfig> {
    let healthcheck = &config.healthcheck;
    if !healthcheck.enabled {
        return None;
    }

    Some(HealthConfig {
        test: Some(healthcheck.test(config.container_port)),
        interval: Some(healthcheck.interval().as_nanos() as i64),
        timeout: Some(healthcheck.timeout().as_nanos() as i64),
        retries: Some(healthcheck.retries as i64),
        start_period: Some(healthcheck.start_period().as_nanos() as i64),
        ..Default::default()
    })
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with('g') || limit.ends_with("gb") {
        let num = limit.trim_end_matches("gb").trim_end_matches('g');
        (num, 1024 * 1024 * 1024i64)
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        let num = limit.trim_end_matches("mb").trim_end_matches('m');
        (num, 1024 * 1024i64)
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        let num = limit.trim_end_matches("kb").trim_end_matches('k');
        (num, 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;

    Ok((num * multiplier as f64) as i64)
}
