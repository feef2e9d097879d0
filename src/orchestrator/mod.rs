//! Boundary to the system that runs team instances
//!
//! The balancer only needs two operations on the hot path
//! ([`Orchestrator::get_instance`] and
//! [`Orchestrator::update_last_request_timestamp`]); the rest are used by the
//! admin API and the idle reclaim loop.

pub mod docker;

use crate::identity::TeamId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

pub use docker::DockerOrchestrator;

/// Replica counts of a team instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstanceReplicas {
    pub ready_replicas: u32,
    pub available_replicas: u32,
}

impl InstanceReplicas {
    pub fn new(ready_replicas: u32, available_replicas: u32) -> Self {
        Self {
            ready_replicas,
            available_replicas,
        }
    }
}

/// Summary of one team instance, as listed by the admin API
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InstanceSummary {
    pub team: String,
    pub ready: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub last_request: Option<DateTime<Utc>>,
}

/// Why an instance lookup produced no description
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// The team has no instance
    #[error("no instance for team '{0}'")]
    NotFound(String),
    /// The orchestrator could not answer
    #[error("instance lookup failed: {0}")]
    Unavailable(String),
}

/// Failure of a mutating orchestrator call
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no instance for team '{0}'")]
    NotFound(String),
    #[error("instance for team '{0}' already exists")]
    AlreadyExists(String),
    #[error("orchestrator request failed: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Replica counts for the team's instance
    async fn get_instance(&self, team: &TeamId) -> Result<InstanceReplicas, LookupError>;

    /// Record that the team just sent traffic
    async fn update_last_request_timestamp(&self, team: &TeamId) -> Result<(), OrchestratorError>;

    /// Provision the team's instance
    async fn create_deployment(&self, team: &TeamId, passcode_hash: &str) -> Result<(), OrchestratorError>;

    /// Make the team's instance reachable under its upstream name
    async fn create_service(&self, team: &TeamId) -> Result<(), OrchestratorError>;

    /// Remove the team's instance entirely. Removing a missing instance succeeds.
    async fn delete_deployment(&self, team: &TeamId) -> Result<(), OrchestratorError>;

    /// Restart the team's instance
    async fn delete_instance_pod(&self, team: &TeamId) -> Result<(), OrchestratorError>;

    async fn change_passcode_hash(&self, team: &TeamId, passcode_hash: &str) -> Result<(), OrchestratorError>;

    async fn list_instances(&self) -> Result<Vec<InstanceSummary>, OrchestratorError>;
}

pub type SharedOrchestrator = Arc<dyn Orchestrator>;
