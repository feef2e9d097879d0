//! Debounced "team is active" signals
//!
//! The orchestrator reclaims instances whose last request is too old. Telling
//! it about every request would turn request rate into write rate, so the
//! signal goes out at most once per window per team.

use crate::identity::TeamId;
use crate::orchestrator::SharedOrchestrator;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// When a team's activity was last sent upstream
#[derive(Debug, Clone, Copy)]
pub struct ActivityRecord {
    pub last_sent_at: Instant,
}

pub struct ActivityDebouncer {
    orchestrator: SharedOrchestrator,
    records: DashMap<TeamId, ActivityRecord>,
    window: Duration,
}

impl ActivityDebouncer {
    pub fn new(orchestrator: SharedOrchestrator, window: Duration) -> Self {
        Self {
            orchestrator,
            records: DashMap::new(),
            window,
        }
    }

    /// Report the team as active unless that already happened in this window.
    ///
    /// Failures are logged and not retried; the window still counts from the
    /// attempt so a failing orchestrator is not hit on every request.
    pub async fn mark_active(&self, team: &TeamId) {
        if !self.claim(team, Instant::now()) {
            return;
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        let team = team.clone();
        let task = tokio::spawn(async move {
            match orchestrator.update_last_request_timestamp(&team).await {
                Ok(()) => debug!(team = %team, "Updated last request timestamp"),
                Err(e) => warn!(team = %team, error = %e, "Failed to update last request timestamp"),
            }
        });

        if let Err(e) = task.await {
            error!(error = %e, "Activity update task failed");
        }
    }

    pub fn last_sent(&self, team: &TeamId) -> Option<ActivityRecord> {
        self.records.get(team).map(|record| *record)
    }

    /// Take the team's slot for the current window, if it is free
    fn claim(&self, team: &TeamId, now: Instant) -> bool {
        match self.records.entry(team.clone()) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(entry.get().last_sent_at) >= self.window {
                    entry.insert(ActivityRecord { last_sent_at: now });
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(ActivityRecord { last_sent_at: now });
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::fake::FakeOrchestrator;

    const WINDOW: Duration = Duration::from_secs(10);

    fn team(name: &str) -> TeamId {
        TeamId::parse(name).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_activity_is_sent() {
        let orchestrator = Arc::new(FakeOrchestrator::ready());
        let debouncer = ActivityDebouncer::new(orchestrator.clone(), WINDOW);
        let team = team("team-last-connect-test");

        assert!(debouncer.last_sent(&team).is_none());
        debouncer.mark_active(&team).await;

        assert_eq!(orchestrator.updates(), 1);
        assert!(debouncer.last_sent(&team).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_timeline() {
        let orchestrator = Arc::new(FakeOrchestrator::ready());
        let debouncer = ActivityDebouncer::new(orchestrator.clone(), WINDOW);
        let team = team("team-x");

        debouncer.mark_active(&team).await;
        assert_eq!(orchestrator.updates(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        debouncer.mark_active(&team).await;
        assert_eq!(orchestrator.updates(), 1);

        tokio::time::advance(Duration::from_millis(5_001)).await;
        debouncer.mark_active(&team).await;
        assert_eq!(orchestrator.updates(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_requests_in_window_send_once() {
        let orchestrator = Arc::new(FakeOrchestrator::ready());
        let debouncer = ActivityDebouncer::new(orchestrator.clone(), WINDOW);
        let team = team("busy");

        for _ in 0..50 {
            debouncer.mark_active(&team).await;
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert_eq!(orchestrator.updates(), 1);

        tokio::time::advance(WINDOW).await;
        debouncer.mark_active(&team).await;
        assert_eq!(orchestrator.updates(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teams_are_debounced_independently() {
        let orchestrator = Arc::new(FakeOrchestrator::ready());
        let debouncer = ActivityDebouncer::new(orchestrator.clone(), WINDOW);

        debouncer.mark_active(&team("alpha")).await;
        debouncer.mark_active(&team("beta")).await;
        debouncer.mark_active(&team("alpha")).await;

        assert_eq!(orchestrator.updates(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_still_starts_window() {
        let orchestrator = Arc::new(FakeOrchestrator::ready().failing_updates());
        let debouncer = ActivityDebouncer::new(orchestrator.clone(), WINDOW);
        let team = team("flaky");

        debouncer.mark_active(&team).await;
        debouncer.mark_active(&team).await;
        assert_eq!(orchestrator.updates(), 1);

        tokio::time::advance(WINDOW).await;
        debouncer.mark_active(&team).await;
        assert_eq!(orchestrator.updates(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_marks_claim_one_slot() {
        let orchestrator = Arc::new(FakeOrchestrator::ready());
        let debouncer = Arc::new(ActivityDebouncer::new(orchestrator.clone(), Duration::from_secs(60)));
        let team = team("concurrent");

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let debouncer = Arc::clone(&debouncer);
                let team = team.clone();
                tokio::spawn(async move { debouncer.mark_active(&team).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(orchestrator.updates(), 1);
    }
}
