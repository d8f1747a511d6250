//! Task placement: LRU worker selection, hand-off and queue drain.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::coordinator::{FailureRecord, State};
use crate::longpoll::Assignment;
use crate::registry::WorkerStatus;

/// A task handed to a worker that has not acknowledged it yet.
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub task_id: String,
    pub assigned_at: Instant,
    pub assigned_at_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Queued { position: usize },
    Assigned { worker: String, delivered: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitReply {
    pub task_id: String,
    pub title: Option<String>,
    pub queued: bool,
    pub assigned_to: Option<String>,
    /// A parked poll was woken with the task.
    pub delivered: bool,
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_failure: Option<FailureRecord>,
}

impl SubmitReply {
    pub(crate) fn new(
        task_id: &str,
        title: Option<String>,
        placement: Placement,
        previous_failure: Option<FailureRecord>,
    ) -> Self {
        let (queued, assigned_to, delivered, queue_position) = match placement {
            Placement::Queued { position } => (true, None, false, Some(position)),
            Placement::Assigned { worker, delivered } => (false, Some(worker), delivered, None),
        };
        Self {
            task_id: task_id.to_string(),
            title,
            queued,
            assigned_to,
            delivered,
            queue_position,
            previous_failure,
        }
    }
}

pub(crate) struct HandOff {
    pub assignment: Assignment,
    pub delivered: bool,
}

impl State {
    pub(crate) fn assignment_for(&self, entry: &PendingTask) -> Assignment {
        Assignment {
            task_id: entry.task_id.clone(),
            title: self.titles.get(&entry.task_id).cloned(),
            assigned_at: entry.assigned_at_utc,
        }
    }

    /// Give `task_id` to `worker`. The pending entry is created whether or not
    /// a poll is parked, so a worker whose poll went away picks the task up on
    /// its next poll.
    pub(crate) fn hand_off(&mut self, worker: &str, task_id: String, now: Instant) -> HandOff {
        let entry = PendingTask {
            task_id: task_id.clone(),
            assigned_at: now,
            assigned_at_utc: Utc::now(),
        };
        let assignment = self.assignment_for(&entry);
        self.pending.insert(worker.to_string(), entry);

        if let Some(w) = self.registry.get_mut(worker) {
            w.status = WorkerStatus::Pending;
            w.current_task = Some(task_id.clone());
            w.task_started_at = None;
        }

        let delivered = match self.waiters.take(worker) {
            Some(poller) => match poller.resolve(assignment.clone()) {
                Ok(()) => true,
                Err(_) => {
                    debug!(worker = %worker, task_id = %task_id, "Poller gone before delivery");
                    false
                }
            },
            None => false,
        };

        info!(worker = %worker, task_id = %task_id, delivered, "Task assigned");
        HandOff {
            assignment,
            delivered,
        }
    }

    /// Hand queued tasks to available workers until one side runs out.
    pub(crate) fn drain_queue(&mut self, now: Instant, exclude: &[String]) -> Vec<(String, String, bool)> {
        let mut placed = Vec::new();
        while !self.queue.is_empty() {
            let Some(worker) = self.registry.select_lru(exclude) else {
                break;
            };
            let Some(task_id) = self.queue.pop_front() else {
                break;
            };
            let handoff = self.hand_off(&worker, task_id.clone(), now);
            placed.push((task_id, worker, handoff.delivered));
        }
        placed
    }

    /// Append a validated task and dispatch whatever can be dispatched.
    pub(crate) fn enqueue_and_dispatch(&mut self, task_id: &str, now: Instant) -> Placement {
        self.queue.push_back(task_id.to_string());
        let placed = self.drain_queue(now, &[]);

        if let Some(position) = self.queue.position(task_id) {
            return Placement::Queued { position };
        }
        if let Some((_, worker, delivered)) = placed.into_iter().find(|(t, _, _)| t == task_id) {
            return Placement::Assigned { worker, delivered };
        }
        let worker = self.registry.holder_of(task_id).unwrap_or_default().to_string();
        Placement::Assigned {
            worker,
            delivered: false,
        }
    }
}
