//! Job registry
//!
//! Tracks every registered script until its terminal state is acknowledged.
//! State changes and their notifications happen under one lock, so events for
//! a given job reach subscribers in the order the job actually moved.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::events::EventBus;
use crate::script::{Script, ScriptId, ScriptPayload, ScriptState};

/// Snapshot of one tracked job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: ScriptId,
    pub name: String,
    pub drive: String,
    pub state: ScriptState,
    pub registered_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A job changed state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub id: ScriptId,
    pub name: String,
    pub drive: String,
    pub state: ScriptState,
}

struct TrackedJob {
    info: JobInfo,
    cancel: CancellationToken,
    payload: Arc<dyn ScriptPayload>,
}

/// Cancellation handles of a job that has not finished
pub(crate) struct ActiveJob {
    pub id: ScriptId,
    pub cancel: CancellationToken,
    pub payload: Arc<dyn ScriptPayload>,
}

pub(crate) struct JobRegistry {
    jobs: Mutex<HashMap<ScriptId, TrackedJob>>,
    events: EventBus<JobEvent>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            events: EventBus::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ScriptId, TrackedJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Start tracking a script in `Pending`.
    ///
    /// Returns false, leaving the tracked job untouched, when the id is
    /// already known.
    pub fn insert(&self, script: &Script, cancel: CancellationToken) -> bool {
        let info = JobInfo {
            id: script.id(),
            name: script.name().to_string(),
            drive: script.drive().to_string(),
            state: ScriptState::Pending,
            registered_at: Utc::now(),
            finished_at: None,
        };

        let mut jobs = self.lock();
        let Entry::Vacant(slot) = jobs.entry(script.id()) else {
            return false;
        };
        self.publish(&info);
        slot.insert(TrackedJob {
            info,
            cancel,
            payload: Arc::clone(script.payload()),
        });
        true
    }

    /// Move a job to `state`.
    ///
    /// Returns false when the job is unknown or already terminal; terminal
    /// states are final.
    pub fn transition(&self, id: ScriptId, state: ScriptState) -> bool {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return false;
        };

        if job.info.state.is_terminal() {
            trace!(job = %id, "Ignoring {} after {}", state, job.info.state);
            return false;
        }

        debug!(job = %id, drive = %job.info.drive, "{} -> {}", job.info.state, state);
        if state.is_terminal() {
            job.info.finished_at = Some(Utc::now());
        }
        job.info.state = state;
        self.publish(&job.info);
        true
    }

    /// Cancel a job that has not started running. Returns false otherwise.
    pub fn cancel_if_pending(&self, id: ScriptId) -> bool {
        let mut jobs = self.lock();
        match jobs.get_mut(&id) {
            Some(job) if job.info.state == ScriptState::Pending => {
                job.info.state = ScriptState::Cancelled;
                job.info.finished_at = Some(Utc::now());
                self.publish(&job.info);
                true
            }
            _ => false,
        }
    }

    fn publish(&self, info: &JobInfo) {
        self.events.publish(JobEvent {
            id: info.id,
            name: info.name.clone(),
            drive: info.drive.clone(),
            state: info.state.clone(),
        });
    }

    pub fn get(&self, id: ScriptId) -> Option<JobInfo> {
        self.lock().get(&id).map(|job| job.info.clone())
    }

    pub fn cancel_handles(&self, id: ScriptId) -> Option<ActiveJob> {
        self.lock().get(&id).map(|job| ActiveJob {
            id,
            cancel: job.cancel.clone(),
            payload: Arc::clone(&job.payload),
        })
    }

    /// Every job, oldest registration first
    pub fn snapshot(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.lock().values().map(|job| job.info.clone()).collect();
        jobs.sort_by_key(|job| job.registered_at);
        jobs
    }

    /// Jobs not yet in a terminal state
    pub fn active(&self) -> Vec<ActiveJob> {
        self.lock()
            .iter()
            .filter(|(_, job)| !job.info.state.is_terminal())
            .map(|(id, job)| ActiveJob {
                id: *id,
                cancel: job.cancel.clone(),
                payload: Arc::clone(&job.payload),
            })
            .collect()
    }

    /// Drop a job from the registry if it is terminal.
    ///
    /// `Err` carries the current state when the job is still in flight.
    pub fn remove_terminal(&self, id: ScriptId) -> Option<Result<JobInfo, ScriptState>> {
        let mut jobs = self.lock();
        let state = jobs.get(&id)?.info.state.clone();
        if !state.is_terminal() {
            return Some(Err(state));
        }
        jobs.remove(&id).map(|job| Ok(job.info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> Script {
        Script::from_fn("noop", "default", |_| Ok(()))
    }

    #[test]
    fn test_terminal_state_is_final() {
        let registry = JobRegistry::new();
        let script = script();
        registry.insert(&script, CancellationToken::new());

        assert!(registry.transition(script.id(), ScriptState::Running));
        assert!(registry.transition(script.id(), ScriptState::Cancelled));
        assert!(!registry.transition(script.id(), ScriptState::Succeeded));
        assert_eq!(registry.get(script.id()).unwrap().state, ScriptState::Cancelled);
        assert!(registry.get(script.id()).unwrap().finished_at.is_some());
    }

    #[test]
    fn test_insert_keeps_existing_job() {
        let registry = JobRegistry::new();
        let mut events = registry.subscribe();
        let script = script();

        assert!(registry.insert(&script, CancellationToken::new()));
        registry.transition(script.id(), ScriptState::Running);
        assert!(!registry.insert(&script.clone(), CancellationToken::new()));

        assert_eq!(registry.get(script.id()).unwrap().state, ScriptState::Running);
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(events.try_recv().unwrap().state, ScriptState::Pending);
        assert_eq!(events.try_recv().unwrap().state, ScriptState::Running);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_events_follow_transitions() {
        let registry = JobRegistry::new();
        let mut events = registry.subscribe();
        let script = script();

        registry.insert(&script, CancellationToken::new());
        registry.transition(script.id(), ScriptState::Running);
        registry.transition(script.id(), ScriptState::Succeeded);

        let states: Vec<ScriptState> = (0..3).map(|_| events.try_recv().unwrap().state).collect();
        assert_eq!(
            states,
            vec![ScriptState::Pending, ScriptState::Running, ScriptState::Succeeded]
        );
    }

    #[test]
    fn test_cancel_if_pending() {
        let registry = JobRegistry::new();
        let pending = script();
        let running = script();
        registry.insert(&pending, CancellationToken::new());
        registry.insert(&running, CancellationToken::new());
        registry.transition(running.id(), ScriptState::Running);

        assert!(registry.cancel_if_pending(pending.id()));
        assert!(!registry.cancel_if_pending(running.id()));
        assert_eq!(registry.active().len(), 1);
    }

    #[test]
    fn test_remove_only_terminal() {
        let registry = JobRegistry::new();
        let script = script();
        registry.insert(&script, CancellationToken::new());

        assert_eq!(
            registry.remove_terminal(script.id()),
            Some(Err(ScriptState::Pending))
        );
        registry.transition(script.id(), ScriptState::Cancelled);
        assert!(matches!(registry.remove_terminal(script.id()), Some(Ok(_))));
        assert!(registry.remove_terminal(script.id()).is_none());
        assert!(registry.active().is_empty());
    }
}
