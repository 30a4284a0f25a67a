//! In-memory task queue for tests and single-process development.
//!
//! Nothing survives a restart. Time is whatever the caller passes to
//! [`TaskQueue::claim_due`], which lets tests step over delays without
//! sleeping.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{EnqueueResult, Task, TaskEnvelope, TaskQueue};
use crate::error::{unexpected_error, Error};

#[derive(Debug, Clone)]
struct QueueEntry {
    envelope: TaskEnvelope,
    leased_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<Uuid, QueueEntry>,
    keys: HashMap<String, Uuid>,
}

impl QueueState {
    fn remove(&mut self, id: Uuid) -> Option<QueueEntry> {
        let entry = self.entries.remove(&id)?;
        self.keys.remove(&entry.envelope.task.dedup_key());
        Some(entry)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    state: RwLock<QueueState>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    tracing::error!("task queue lock poisoned");
    unexpected_error()
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// All pending tasks, earliest first.
    pub fn pending(&self) -> Result<Vec<TaskEnvelope>, Error> {
        let state = self.state.read().map_err(poison_err)?;

        let mut envelopes: Vec<TaskEnvelope> = state
            .entries
            .values()
            .map(|entry| entry.envelope.clone())
            .collect();
        envelopes.sort_by_key(|envelope| envelope.run_at);

        Ok(envelopes)
    }

    /// Pending tasks matching `predicate`.
    pub fn pending_where<F>(&self, predicate: F) -> Result<Vec<Task>, Error>
    where
        F: Fn(&Task) -> bool,
    {
        Ok(self
            .pending()?
            .into_iter()
            .map(|envelope| envelope.task)
            .filter(|task| predicate(task))
            .collect())
    }

    pub fn last_error(&self, id: Uuid) -> Result<Option<String>, Error> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.entries.get(&id).and_then(|entry| entry.last_error.clone()))
    }

    pub fn clear(&self) -> Result<(), Error> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.entries.clear();
        state.keys.clear();
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<EnqueueResult, Error> {
        let key = task.dedup_key();
        let now = Utc::now();

        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(existing_id) = state.keys.get(&key) {
            return Ok(EnqueueResult::Deduplicated {
                existing_id: *existing_id,
            });
        }

        let envelope = TaskEnvelope::new(task, now + delay, now);
        let id = envelope.id;

        state.keys.insert(key, id);
        state.entries.insert(
            id,
            QueueEntry {
                envelope,
                leased_until: None,
                last_error: None,
            },
        );

        Ok(EnqueueResult::Enqueued { id })
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize, lease: Duration) -> Result<Vec<TaskEnvelope>, Error> {
        let mut state = self.state.write().map_err(poison_err)?;

        let mut due: Vec<&mut QueueEntry> = state
            .entries
            .values_mut()
            .filter(|entry| entry.envelope.run_at <= now)
            .filter(|entry| entry.leased_until.map_or(true, |until| until <= now))
            .collect();
        due.sort_by_key(|entry| entry.envelope.run_at);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|entry| {
                entry.leased_until = Some(now + lease);
                entry.envelope.attempt += 1;
                entry.envelope.clone()
            })
            .collect())
    }

    async fn complete(&self, id: Uuid) -> Result<(), Error> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.remove(id);
        Ok(())
    }

    async fn reschedule(&self, id: Uuid, delay: Duration, error: &str) -> Result<(), Error> {
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(entry) = state.entries.get_mut(&id) {
            entry.envelope.run_at = Utc::now() + delay;
            entry.leased_until = None;
            entry.last_error = Some(error.to_string());
        }

        Ok(())
    }

    async fn abandon(&self, id: Uuid, error: &str) -> Result<(), Error> {
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(entry) = state.remove(id) {
            tracing::warn!(task = entry.envelope.task.name(), %error, "task abandoned");
        }

        Ok(())
    }

    async fn depth(&self) -> Result<usize, Error> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.entries.len())
    }
}
