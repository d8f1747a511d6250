//! Worker registry: identities and lifecycle state, nothing else.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::BusError;

pub const MAX_WORKER_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Polling,
    Pending,
    Executing,
}

impl WorkerStatus {
    /// Idle and polling workers can take a new task.
    pub fn is_available(&self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Polling)
    }
}

#[derive(Debug, Clone)]
pub struct Worker {
    pub name: String,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub last_seen_at: DateTime<Utc>,
    pub current_task: Option<String>,
    pub task_started_at: Option<Instant>,
}

impl Worker {
    fn new(name: &str, now: Instant) -> Self {
        let wall = Utc::now();
        Self {
            name: name.to_string(),
            status: WorkerStatus::Idle,
            registered_at: wall,
            last_activity: now,
            last_seen_at: wall,
            current_task: None,
            task_started_at: None,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
        self.last_seen_at = Utc::now();
    }

    /// Drop whatever task the worker held and fall back to `status`.
    pub fn release(&mut self, status: WorkerStatus) -> Option<String> {
        self.status = status;
        self.task_started_at = None;
        self.current_task.take()
    }
}

/// `[A-Za-z0-9][A-Za-z0-9._-]*`, at most 64 characters.
pub fn validate_worker_name(name: &str) -> Result<(), BusError> {
    if name.is_empty() {
        return Err(BusError::invalid("worker name must be non-empty"));
    }
    if name.len() > MAX_WORKER_NAME_LEN {
        return Err(BusError::invalid(format!(
            "worker name must be at most {MAX_WORKER_NAME_LEN} characters"
        )));
    }
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !first_ok || !rest_ok {
        return Err(BusError::invalid(format!(
            "invalid worker name '{name}': must start with a letter or digit and contain only letters, digits, '.', '_' or '-'"
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct Registry {
    workers: HashMap<String, Worker>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert. Returns `true` when the name was not known before.
    ///
    /// Re-registering only refreshes `last_activity`; two callers using the same
    /// name silently share the entry (last write wins).
    pub fn register(&mut self, name: &str, now: Instant) -> bool {
        match self.workers.get_mut(name) {
            Some(worker) => {
                worker.touch(now);
                false
            }
            None => {
                self.workers.insert(name.to_string(), Worker::new(name, now));
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Worker> {
        self.workers.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Worker> {
        self.workers.get_mut(name)
    }

    /// Look up a worker that must exist, refreshing its activity timestamp.
    pub fn touch(&mut self, name: &str, now: Instant) -> Result<&mut Worker, BusError> {
        let worker = self
            .workers
            .get_mut(name)
            .ok_or_else(|| BusError::UnknownWorker(name.to_string()))?;
        worker.touch(now);
        Ok(worker)
    }

    /// Name of the worker currently holding `task_id`, pending or executing.
    pub fn holder_of(&self, task_id: &str) -> Option<&str> {
        self.workers
            .values()
            .find(|w| w.current_task.as_deref() == Some(task_id))
            .map(|w| w.name.as_str())
    }

    /// LRU selection: the available worker with the oldest `last_activity`,
    /// ties broken by name.
    pub fn select_lru(&self, exclude: &[String]) -> Option<String> {
        self.workers
            .values()
            .filter(|w| w.status.is_available() && w.current_task.is_none())
            .filter(|w| !exclude.iter().any(|e| e == &w.name))
            .min_by(|a, b| {
                a.last_activity
                    .cmp(&b.last_activity)
                    .then_with(|| a.name.cmp(&b.name))
            })
            .map(|w| w.name.clone())
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }
}
