//! Backend health tracking.
//!
//! Health is derived from consecutive call failures: one success resets a
//! backend to healthy, a run of failures downgrades it through `degraded`,
//! `unhealthy` and `offline` according to its [`BackendConfig`] thresholds.
//! Every change is broadcast so the scheduler and the fan-out hub can react
//! without sharing mutable state with the client.
//!
//! A backend that is down is half-open: [`HealthTracker::admit`] lets exactly
//! one recovery trial through at a time. The trial's outcome is recorded like
//! any other attempt, so a success brings the backend back.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::BackendConfig;

/// Buffer for health change notifications.
const HEALTH_CHANNEL_CAPACITY: usize = 64;

/// Availability classification of a remote backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl BackendHealth {
    /// Whether jobs may be dispatched to a backend in this state.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, BackendHealth::Healthy | BackendHealth::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendHealth::Healthy => "healthy",
            BackendHealth::Degraded => "degraded",
            BackendHealth::Unhealthy => "unhealthy",
            BackendHealth::Offline => "offline",
        }
    }
}

impl std::fmt::Display for BackendHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition of one backend between health states.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthChange {
    pub backend: String,
    pub previous: BackendHealth,
    pub current: BackendHealth,
    pub consecutive_failures: u32,
    pub at: DateTime<Utc>,
}

/// Whether a call may be sent to a backend right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The backend is dispatchable.
    Open,
    /// The backend is down and this caller holds its recovery trial.
    Trial,
    /// The backend is down and a trial is already in flight.
    Closed(BackendHealth),
}

#[derive(Debug, Clone, Default)]
struct BackendState {
    health: BackendHealth,
    consecutive_failures: u32,
    trial_in_flight: bool,
}

/// Tracks health per backend and broadcasts transitions.
pub struct HealthTracker {
    states: Mutex<HashMap<String, BackendState>>,
    changes: broadcast::Sender<HealthChange>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
        Self {
            states: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Subscribes to health transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthChange> {
        self.changes.subscribe()
    }

    /// Current health of a backend. Unknown backends are healthy.
    pub fn health(&self, backend: &str) -> BackendHealth {
        self.lock()
            .get(backend)
            .map(|s| s.health)
            .unwrap_or_default()
    }

    /// Current run of consecutive failures for a backend.
    pub fn consecutive_failures(&self, backend: &str) -> u32 {
        self.lock()
            .get(backend)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    /// Health of every backend seen so far.
    pub fn snapshot(&self) -> HashMap<String, BackendHealth> {
        self.lock()
            .iter()
            .map(|(name, state)| (name.clone(), state.health))
            .collect()
    }

    /// Decides whether a call may go out, claiming the recovery trial when
    /// the backend is down and nobody holds it.
    ///
    /// The trial is released by the next recorded outcome or by
    /// [`end_trial`](Self::end_trial).
    pub fn admit(&self, backend: &str) -> Admission {
        let mut states = self.lock();
        let state = states.entry(backend.to_string()).or_default();
        if state.health.is_dispatchable() {
            return Admission::Open;
        }
        if state.trial_in_flight {
            return Admission::Closed(state.health);
        }
        state.trial_in_flight = true;
        Admission::Trial
    }

    /// Releases a recovery trial that ended without a recorded outcome.
    pub fn end_trial(&self, backend: &str) {
        if let Some(state) = self.lock().get_mut(backend) {
            state.trial_in_flight = false;
        }
    }

    /// Records a successful call; recovers the backend to healthy.
    pub fn record_success(&self, backend: &str) -> Option<HealthChange> {
        let change = {
            let mut states = self.lock();
            let state = states.entry(backend.to_string()).or_default();
            state.consecutive_failures = 0;
            state.trial_in_flight = false;
            Self::transition(backend, state, BackendHealth::Healthy)
        };
        self.emit(change)
    }

    /// Records a failed call and downgrades the backend as thresholds are hit.
    pub fn record_failure(&self, backend: &str, config: &BackendConfig) -> Option<HealthChange> {
        let change = {
            let mut states = self.lock();
            let state = states.entry(backend.to_string()).or_default();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.trial_in_flight = false;
            let next = config.classify_failures(state.consecutive_failures);
            Self::transition(backend, state, next)
        };
        self.emit(change)
    }

    /// Forces a backend into a health state (operator override or health check).
    pub fn set_health(&self, backend: &str, health: BackendHealth) -> Option<HealthChange> {
        let change = {
            let mut states = self.lock();
            let state = states.entry(backend.to_string()).or_default();
            if health == BackendHealth::Healthy {
                state.consecutive_failures = 0;
                state.trial_in_flight = false;
            }
            Self::transition(backend, state, health)
        };
        self.emit(change)
    }

    fn transition(
        backend: &str,
        state: &mut BackendState,
        next: BackendHealth,
    ) -> Option<HealthChange> {
        if state.health == next {
            return None;
        }

        let change = HealthChange {
            backend: backend.to_string(),
            previous: state.health,
            current: next,
            consecutive_failures: state.consecutive_failures,
            at: Utc::now(),
        };
        state.health = next;
        Some(change)
    }

    fn emit(&self, change: Option<HealthChange>) -> Option<HealthChange> {
        if let Some(ref change) = change {
            if change.current.is_dispatchable() {
                info!(
                    backend = %change.backend,
                    previous = %change.previous,
                    current = %change.current,
                    "Backend health changed"
                );
            } else {
                warn!(
                    backend = %change.backend,
                    previous = %change.previous,
                    current = %change.current,
                    consecutive_failures = change.consecutive_failures,
                    "Backend health downgraded"
                );
            }
            // No receivers is fine; health is still queryable.
            let _ = self.changes.send(change.clone());
        }
        change
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BackendState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackendConfig {
        BackendConfig::default().with_health_thresholds(2, 4)
    }

    #[test]
    fn test_unknown_backend_is_healthy() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.health("gpu-a"), BackendHealth::Healthy);
        assert_eq!(tracker.consecutive_failures("gpu-a"), 0);
    }

    #[test]
    fn test_downgrade_sequence() {
        let tracker = HealthTracker::new();
        let config = config();

        let change = tracker.record_failure("gpu-a", &config).expect("changed");
        assert_eq!(change.current, BackendHealth::Degraded);

        let change = tracker.record_failure("gpu-a", &config).expect("changed");
        assert_eq!(change.previous, BackendHealth::Degraded);
        assert_eq!(change.current, BackendHealth::Unhealthy);

        assert!(tracker.record_failure("gpu-a", &config).is_none());

        let change = tracker.record_failure("gpu-a", &config).expect("changed");
        assert_eq!(change.current, BackendHealth::Offline);
        assert!(!tracker.health("gpu-a").is_dispatchable());
    }

    #[test]
    fn test_success_recovers() {
        let tracker = HealthTracker::new();
        let config = config();

        tracker.record_failure("gpu-a", &config);
        tracker.record_failure("gpu-a", &config);
        assert_eq!(tracker.health("gpu-a"), BackendHealth::Unhealthy);

        let change = tracker.record_success("gpu-a").expect("recovered");
        assert_eq!(change.current, BackendHealth::Healthy);
        assert_eq!(tracker.consecutive_failures("gpu-a"), 0);
        assert!(tracker.record_success("gpu-a").is_none());
    }

    #[test]
    fn test_down_backend_admits_one_trial() {
        let tracker = HealthTracker::new();
        let config = config();
        assert_eq!(tracker.admit("gpu-a"), Admission::Open);

        tracker.record_failure("gpu-a", &config);
        tracker.record_failure("gpu-a", &config);
        assert_eq!(tracker.admit("gpu-a"), Admission::Trial);
        assert_eq!(
            tracker.admit("gpu-a"),
            Admission::Closed(BackendHealth::Unhealthy)
        );

        // A failed trial keeps the backend down and frees the slot.
        tracker.record_failure("gpu-a", &config);
        assert_eq!(tracker.admit("gpu-a"), Admission::Trial);
        tracker.end_trial("gpu-a");
        assert_eq!(tracker.admit("gpu-a"), Admission::Trial);

        // A successful trial reopens the backend.
        tracker.record_success("gpu-a");
        assert_eq!(tracker.admit("gpu-a"), Admission::Open);
        assert_eq!(tracker.health("gpu-a"), BackendHealth::Healthy);
    }

    #[tokio::test]
    async fn test_changes_are_broadcast() {
        let tracker = HealthTracker::new();
        let mut rx = tracker.subscribe();

        tracker.set_health("gpu-b", BackendHealth::Offline);
        let change = rx.recv().await.expect("change received");

        assert_eq!(change.backend, "gpu-b");
        assert_eq!(change.current, BackendHealth::Offline);
        assert_eq!(
            tracker.snapshot().get("gpu-b"),
            Some(&BackendHealth::Offline)
        );
    }
}
