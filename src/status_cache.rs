//! Time-windowed cache of team instance status
//!
//! Every proxied request needs to know whether its team's instance can take
//! traffic. Asking the orchestrator each time would put the control plane
//! under request-rate load, so answers (including failed lookups) are kept
//! for one freshness window per team.

use crate::identity::TeamId;
use crate::orchestrator::{InstanceReplicas, LookupError, SharedOrchestrator};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info};

/// The balancer's view of a team instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Replicas are ready and available
    Ready,
    /// The instance exists but nothing is ready yet
    Restarting,
    /// The lookup failed or the team has no instance
    Missing,
}

impl InstanceStatus {
    pub fn from_replicas(replicas: InstanceReplicas) -> Self {
        if replicas.ready_replicas >= 1 && replicas.available_replicas >= 1 {
            InstanceStatus::Ready
        } else {
            InstanceStatus::Restarting
        }
    }

    pub fn from_lookup(lookup: Result<InstanceReplicas, LookupError>) -> Self {
        match lookup {
            Ok(replicas) => Self::from_replicas(replicas),
            Err(_) => InstanceStatus::Missing,
        }
    }
}

/// One cached lookup result
#[derive(Debug, Clone, Copy)]
pub struct StatusEntry {
    pub status: InstanceStatus,
    pub fetched_at: Instant,
}

/// Cache of instance status keyed by team
pub struct StatusCache {
    orchestrator: SharedOrchestrator,
    entries: Arc<DashMap<TeamId, StatusEntry>>,
    /// Per-team lookup locks, present when coalescing is enabled
    in_flight: Option<DashMap<TeamId, Arc<Mutex<()>>>>,
    window: Duration,
}

impl StatusCache {
    pub fn new(orchestrator: SharedOrchestrator, window: Duration) -> Self {
        Self {
            orchestrator,
            entries: Arc::new(DashMap::new()),
            in_flight: None,
            window,
        }
    }

    /// Let concurrent misses for one team wait for a single lookup
    pub fn with_coalescing(mut self, enabled: bool) -> Self {
        self.in_flight = enabled.then(DashMap::new);
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Status of the team's instance, refreshed when the cached one is stale
    pub async fn get_status(&self, team: &TeamId) -> InstanceStatus {
        if let Some(status) = self.fresh(team) {
            return status;
        }

        let guard = match &self.in_flight {
            Some(locks) => {
                let lock = Arc::clone(locks.entry(team.clone()).or_default().value());
                let guard = lock.lock_owned().await;
                // Another request may have refreshed while we waited
                if let Some(status) = self.fresh(team) {
                    return status;
                }
                Some(guard)
            }
            None => None,
        };

        self.refresh(team, guard).await
    }

    /// Cached entry without triggering a lookup
    pub fn peek(&self, team: &TeamId) -> Option<StatusEntry> {
        self.entries.get(team).map(|entry| *entry)
    }

    /// Drop the team's entry so the next request looks it up again
    pub fn invalidate(&self, team: &TeamId) {
        self.entries.remove(team);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn fresh(&self, team: &TeamId) -> Option<InstanceStatus> {
        let entry = self.entries.get(team)?;
        (entry.fetched_at.elapsed() < self.window).then_some(entry.status)
    }

    /// Look the team up and overwrite its entry.
    ///
    /// The lookup runs in its own task so the result is cached even when
    /// the request that triggered it goes away.
    async fn refresh(&self, team: &TeamId, guard: Option<OwnedMutexGuard<()>>) -> InstanceStatus {
        let orchestrator = Arc::clone(&self.orchestrator);
        let entries = Arc::clone(&self.entries);
        let team = team.clone();

        let task = tokio::spawn(async move {
            let lookup = orchestrator.get_instance(&team).await;
            match &lookup {
                Ok(replicas) => debug!(
                    team = %team,
                    ready_replicas = replicas.ready_replicas,
                    available_replicas = replicas.available_replicas,
                    "Instance lookup"
                ),
                Err(LookupError::NotFound(_)) => debug!(team = %team, "No instance for team"),
                Err(e @ LookupError::Unavailable(_)) => info!(team = %team, error = %e, "Instance lookup failed"),
            }

            let status = InstanceStatus::from_lookup(lookup);
            entries.insert(
                team,
                StatusEntry {
                    status,
                    fetched_at: Instant::now(),
                },
            );
            drop(guard);
            status
        });

        match task.await {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "Instance lookup task failed");
                InstanceStatus::Missing
            }
        }
    }
}
