use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::ServiceError,
    jobs::{JobRecord, JobState},
};

struct JobEntry {
    record: JobRecord,
    updates: watch::Sender<JobState>,
}

#[derive(Default)]
struct JobTable {
    entries: HashMap<Uuid, JobEntry>,
    /// Terminal jobs, oldest first.
    finished: VecDeque<Uuid>,
    in_flight: usize,
}

impl JobTable {
    fn evict(&mut self, retain: usize) {
        while self.finished.len() > retain {
            let Some(id) = self.finished.pop_front() else {
                break;
            };
            self.entries.remove(&id);
            debug!(job_id = %id, "evicted finished job record");
        }
    }
}

/// In-memory job table. Workers move records forward on success and
/// failure; terminal states are never overwritten. At most
/// `retain_finished` terminal records are kept, oldest evicted first.
pub struct JobRegistry {
    jobs: RwLock<JobTable>,
    retain_finished: usize,
}

impl JobRegistry {
    pub fn new(retain_finished: usize) -> Self {
        Self {
            jobs: RwLock::new(JobTable::default()),
            retain_finished,
        }
    }

    /// Insert `record` unless `limit` unfinished jobs are already admitted.
    pub fn try_admit(&self, record: JobRecord, limit: usize) -> Result<(), ServiceError> {
        let mut jobs = self.jobs.write();
        if jobs.in_flight >= limit {
            return Err(ServiceError::Busy(jobs.in_flight));
        }

        let (updates, _) = watch::channel(record.state.clone());
        if !record.state.is_terminal() {
            jobs.in_flight += 1;
        }
        jobs.entries.insert(record.id, JobEntry { record, updates });
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.jobs.read().entries.get(&id).map(|entry| entry.record.clone())
    }

    pub fn remove(&self, id: Uuid) -> Option<JobRecord> {
        let mut jobs = self.jobs.write();
        let entry = jobs.entries.remove(&id)?;
        if entry.record.state.is_terminal() {
            jobs.finished.retain(|finished| *finished != id);
        } else {
            jobs.in_flight = jobs.in_flight.saturating_sub(1);
        }
        Some(entry.record)
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.read().in_flight
    }

    pub fn len(&self) -> usize {
        self.jobs.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self, id: Uuid) -> Option<watch::Receiver<JobState>> {
        self.jobs
            .read()
            .entries
            .get(&id)
            .map(|entry| entry.updates.subscribe())
    }

    pub fn mark_running(&self, id: Uuid) {
        self.transition(id, JobState::Running);
    }

    pub fn complete(&self, id: Uuid) {
        self.transition(id, JobState::Completed);
    }

    pub fn fail(&self, id: Uuid, error: impl Into<String>) {
        self.transition(
            id,
            JobState::Failed {
                error: error.into(),
            },
        );
    }

    fn transition(&self, id: Uuid, state: JobState) {
        let mut guard = self.jobs.write();
        let jobs = &mut *guard;
        let Some(entry) = jobs.entries.get_mut(&id) else {
            warn!(job_id = %id, state = state.label(), "transition for unknown job");
            return;
        };
        if entry.record.state.is_terminal() {
            warn!(
                job_id = %id,
                from = entry.record.state.label(),
                to = state.label(),
                "ignoring transition out of terminal state"
            );
            return;
        }

        let finished = state.is_terminal();
        if finished {
            entry.record.finished_at = Some(Utc::now());
        }
        entry.record.state = state.clone();
        // Subscribers keep the terminal value even if the record is evicted.
        entry.updates.send_replace(state);

        if finished {
            jobs.in_flight = jobs.in_flight.saturating_sub(1);
            jobs.finished.push_back(id);
            jobs.evict(self.retain_finished);
        }
    }
}
