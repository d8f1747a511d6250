//! The single owner of broker state.
//!
//! Registry, queue, pending entries and parked polls all live in one [`State`]
//! behind one mutex. Every transition is a synchronous method on `State`, so
//! submit/ack/done/reset/retry and health sweeps observe a total order. The
//! lock is never held across an await on the tracker or on a parked poll.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatch::{PendingTask, Placement, SubmitReply};
use crate::error::BusError;
use crate::health::{HealthThresholds, StatusReport, SweepReport};
use crate::longpoll::{Assignment, ConnId, PollReply, PollTicket, WaitOutcome, Waiters};
use crate::protocol::Operation;
use crate::queue::{ActiveTasks, TaskQueue};
use crate::registry::{validate_worker_name, Registry, WorkerStatus};
use crate::tracker::{TaskTracker, TrackedTask, TrackerError};

const MAX_FAILURE_RECORDS: usize = 100;
const MIN_POLL_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub default_poll_timeout: Duration,
    pub max_poll_timeout: Duration,
    pub health: HealthThresholds,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            default_poll_timeout: Duration::from_secs(30),
            max_poll_timeout: Duration::from_secs(600),
            health: HealthThresholds::default(),
        }
    }
}

impl CoordinatorSettings {
    pub fn poll_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let requested = requested_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_poll_timeout);
        requested.clamp(MIN_POLL_TIMEOUT, self.max_poll_timeout.max(MIN_POLL_TIMEOUT))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub task_id: String,
    pub worker: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterReply {
    pub worker: String,
    pub registered: bool,
    pub status: WorkerStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckReply {
    pub worker: String,
    pub task_id: String,
    pub status: WorkerStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseReply {
    pub task_id: String,
    pub worker: String,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetReply {
    pub worker: String,
    pub status: WorkerStatus,
    pub requeued_task: Option<String>,
}

pub(crate) enum PollStart {
    Ready(Assignment),
    Wait(PollTicket),
}

#[derive(Debug)]
pub(crate) struct State {
    pub(crate) registry: Registry,
    pub(crate) queue: TaskQueue,
    pub(crate) active: ActiveTasks,
    pub(crate) pending: HashMap<String, PendingTask>,
    pub(crate) waiters: Waiters,
    pub(crate) titles: HashMap<String, String>,
    pub(crate) failures: VecDeque<FailureRecord>,
    pub(crate) accepting: bool,
}

impl State {
    pub(crate) fn new() -> Self {
        Self {
            registry: Registry::new(),
            queue: TaskQueue::new(),
            active: ActiveTasks::new(),
            pending: HashMap::new(),
            waiters: Waiters::new(),
            titles: HashMap::new(),
            failures: VecDeque::new(),
            accepting: true,
        }
    }

    fn ensure_accepting(&self) -> Result<(), BusError> {
        if self.accepting {
            Ok(())
        } else {
            Err(BusError::ShuttingDown)
        }
    }

    pub(crate) fn register(&mut self, name: &str, now: Instant) -> Result<RegisterReply, BusError> {
        validate_worker_name(name)?;
        let fresh = self.registry.register(name, now);
        if fresh {
            info!(worker = %name, "Worker registered");
            self.drain_queue(now, &[]);
        } else {
            debug!(worker = %name, "Worker re-registered");
        }
        let status = self
            .registry
            .get(name)
            .map(|w| w.status)
            .unwrap_or(WorkerStatus::Idle);
        Ok(RegisterReply {
            worker: name.to_string(),
            registered: fresh,
            status,
        })
    }

    pub(crate) fn begin_poll(
        &mut self,
        name: &str,
        conn: Option<ConnId>,
        now: Instant,
    ) -> Result<PollStart, BusError> {
        validate_worker_name(name)?;
        let worker = self.registry.touch(name, now)?;
        if worker.status == WorkerStatus::Executing {
            let task = worker.current_task.clone().unwrap_or_default();
            return Err(BusError::mismatch(format!(
                "worker {name} is still executing {task}; report done or failed first"
            )));
        }

        if let Some(entry) = self.pending.get(name) {
            return Ok(PollStart::Ready(self.assignment_for(entry)));
        }

        if self.waiters.contains(name) {
            return Err(BusError::invalid(format!(
                "worker {name} already has a poll outstanding"
            )));
        }

        if let Some(task_id) = self.queue.pop_front() {
            let handoff = self.hand_off(name, task_id, now);
            return Ok(PollStart::Ready(handoff.assignment));
        }

        let ticket = self.waiters.park(name, conn).ok_or_else(|| {
            BusError::invalid(format!("worker {name} already has a poll outstanding"))
        })?;
        if let Some(worker) = self.registry.get_mut(name) {
            worker.status = WorkerStatus::Polling;
        }
        debug!(worker = %name, poll_id = ticket.poll_id, "Poll parked");
        Ok(PollStart::Wait(ticket))
    }

    /// Timer fired: forget the poller if it is still ours.
    pub(crate) fn expire_poll(&mut self, name: &str, poll_id: u64) {
        if self.waiters.expire(name, poll_id) {
            if let Some(worker) = self.registry.get_mut(name) {
                if worker.status == WorkerStatus::Polling {
                    worker.status = WorkerStatus::Idle;
                }
            }
            debug!(worker = %name, poll_id, "Poll timed out");
        }
    }

    pub(crate) fn ack(&mut self, name: &str, task_id: &str, now: Instant) -> Result<AckReply, BusError> {
        validate_worker_name(name)?;
        self.registry.touch(name, now)?;
        match self.pending.get(name) {
            Some(entry) if entry.task_id == task_id => {}
            Some(entry) => {
                return Err(BusError::mismatch(format!(
                    "worker {name} has pending task {}, not {task_id}",
                    entry.task_id
                )))
            }
            None => {
                return Err(BusError::mismatch(format!(
                    "worker {name} has no pending task to acknowledge (got {task_id})"
                )))
            }
        }

        self.pending.remove(name);
        if let Some(worker) = self.registry.get_mut(name) {
            worker.status = WorkerStatus::Executing;
            worker.current_task = Some(task_id.to_string());
            worker.task_started_at = Some(now);
        }
        info!(worker = %name, task_id = %task_id, "Task acknowledged");
        Ok(AckReply {
            worker: name.to_string(),
            task_id: task_id.to_string(),
            status: WorkerStatus::Executing,
        })
    }

    /// Free the worker holding `task_id` and retire the task from the broker.
    fn release(&mut self, task_id: &str, now: Instant) -> Result<String, BusError> {
        let Some(name) = self.registry.holder_of(task_id).map(str::to_string) else {
            if self.queue.contains(task_id) {
                return Err(BusError::mismatch(format!(
                    "task {task_id} is queued and not assigned to any worker"
                )));
            }
            return Err(BusError::mismatch(format!(
                "task {task_id} is not assigned to any worker"
            )));
        };

        self.pending.remove(&name);
        if let Some(worker) = self.registry.get_mut(&name) {
            worker.touch(now);
            worker.release(WorkerStatus::Idle);
        }
        self.active.release(task_id);
        self.titles.remove(task_id);
        Ok(name)
    }

    pub(crate) fn done(&mut self, task_id: &str, now: Instant) -> Result<ReleaseReply, BusError> {
        let worker = self.release(task_id, now)?;
        self.forget_failure(task_id);
        info!(worker = %worker, task_id = %task_id, "Task done");
        self.drain_queue(now, &[]);
        Ok(ReleaseReply {
            task_id: task_id.to_string(),
            worker,
            status: WorkerStatus::Idle,
            reason: None,
        })
    }

    pub(crate) fn failed(
        &mut self,
        task_id: &str,
        reason: &str,
        now: Instant,
    ) -> Result<ReleaseReply, BusError> {
        let worker = self.release(task_id, now)?;
        warn!(worker = %worker, task_id = %task_id, reason = %reason, "Task failed");
        self.record_failure(FailureRecord {
            task_id: task_id.to_string(),
            worker: worker.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        self.drain_queue(now, &[]);
        Ok(ReleaseReply {
            task_id: task_id.to_string(),
            worker,
            status: WorkerStatus::Idle,
            reason: Some(reason.to_string()),
        })
    }

    pub(crate) fn reset_worker(&mut self, name: &str, now: Instant) -> Result<ResetReply, BusError> {
        validate_worker_name(name)?;
        let polling = self.waiters.contains(name);
        let worker = self
            .registry
            .get_mut(name)
            .ok_or_else(|| BusError::UnknownWorker(name.to_string()))?;
        let status = if polling {
            WorkerStatus::Polling
        } else {
            WorkerStatus::Idle
        };
        let requeued = worker.release(status);
        self.pending.remove(name);

        if let Some(task_id) = &requeued {
            self.queue.push_front(task_id.clone());
            warn!(worker = %name, task_id = %task_id, "Worker reset; task returned to queue");
        } else {
            info!(worker = %name, "Worker reset");
        }
        self.drain_queue(now, &[name.to_string()]);

        Ok(ResetReply {
            worker: name.to_string(),
            status,
            requeued_task: requeued,
        })
    }

    fn record_failure(&mut self, record: FailureRecord) {
        self.forget_failure(&record.task_id);
        self.failures.push_back(record);
        while self.failures.len() > MAX_FAILURE_RECORDS {
            self.failures.pop_front();
        }
    }

    fn forget_failure(&mut self, task_id: &str) -> Option<FailureRecord> {
        let index = self.failures.iter().position(|f| f.task_id == task_id)?;
        self.failures.remove(index)
    }

    /// Stop taking requests and cancel every parked poll.
    pub(crate) fn begin_shutdown(&mut self) -> usize {
        self.accepting = false;
        let cancelled = self.waiters.drain();
        for name in &cancelled {
            if let Some(worker) = self.registry.get_mut(name) {
                if worker.status == WorkerStatus::Polling {
                    worker.status = WorkerStatus::Idle;
                }
            }
        }
        cancelled.len()
    }

    pub(crate) fn disconnect(&mut self, conn: ConnId) -> Vec<String> {
        let abandoned = self.waiters.drop_connection(conn);
        for name in &abandoned {
            if let Some(worker) = self.registry.get_mut(name) {
                if worker.status == WorkerStatus::Polling {
                    worker.status = WorkerStatus::Idle;
                }
            }
        }
        abandoned
    }
}

/// Cheaply cloneable handle to the serialized broker state.
#[derive(Clone)]
pub struct Coordinator {
    state: Arc<Mutex<State>>,
    tracker: Arc<dyn TaskTracker>,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(tracker: Arc<dyn TaskTracker>, settings: CoordinatorSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
            tracker,
            settings,
        }
    }

    /// Entry point used by the transport: run one decoded operation.
    pub async fn execute(&self, operation: Operation, conn: Option<ConnId>) -> Result<Value, BusError> {
        match operation {
            Operation::Register { name } => to_data(self.register(&name).await?),
            Operation::Poll { name, timeout_ms } => {
                to_data(self.poll(&name, timeout_ms, conn).await?)
            }
            Operation::Ack { name, task_id } => to_data(self.ack(&name, &task_id).await?),
            Operation::Done { task_id } => to_data(self.done(&task_id).await?),
            Operation::Failed { task_id, reason } => to_data(self.failed(&task_id, &reason).await?),
            Operation::Submit { task_id } => to_data(self.submit(&task_id).await?),
            Operation::GetStatus => to_data(self.status().await),
            Operation::ResetWorker { name } => to_data(self.reset_worker(&name).await?),
            Operation::RetryTask { task_id } => to_data(self.retry_task(&task_id).await?),
        }
    }

    pub async fn register(&self, name: &str) -> Result<RegisterReply, BusError> {
        let mut state = self.state.lock().await;
        state.ensure_accepting()?;
        state.register(name, Instant::now())
    }

    /// Long-poll for a task. Only this call suspends.
    pub async fn poll(
        &self,
        name: &str,
        timeout_ms: Option<u64>,
        conn: Option<ConnId>,
    ) -> Result<PollReply, BusError> {
        let timeout = self.settings.poll_timeout(timeout_ms);
        let ticket = {
            let mut state = self.state.lock().await;
            state.ensure_accepting()?;
            match state.begin_poll(name, conn, Instant::now())? {
                PollStart::Ready(assignment) => return Ok(PollReply::assigned(assignment)),
                PollStart::Wait(ticket) => ticket,
            }
        };

        match ticket.wait(timeout).await {
            WaitOutcome::Assigned(assignment) => Ok(PollReply::assigned(assignment)),
            WaitOutcome::Cancelled => {
                let state = self.state.lock().await;
                if state.accepting {
                    Err(BusError::PollCancelled)
                } else {
                    Err(BusError::ShuttingDown)
                }
            }
            WaitOutcome::Elapsed(mut ticket) => {
                let mut state = self.state.lock().await;
                // A dispatch may have resolved the poller between the timer
                // firing and us taking the lock.
                if let Some(assignment) = ticket.try_claim() {
                    return Ok(PollReply::assigned(assignment));
                }
                state.expire_poll(name, ticket.poll_id);
                Ok(PollReply::timed_out())
            }
        }
    }

    pub async fn ack(&self, name: &str, task_id: &str) -> Result<AckReply, BusError> {
        let mut state = self.state.lock().await;
        state.ensure_accepting()?;
        state.ack(name, task_id, Instant::now())
    }

    pub async fn done(&self, task_id: &str) -> Result<ReleaseReply, BusError> {
        let mut state = self.state.lock().await;
        state.ensure_accepting()?;
        state.done(task_id, Instant::now())
    }

    pub async fn failed(&self, task_id: &str, reason: &str) -> Result<ReleaseReply, BusError> {
        let mut state = self.state.lock().await;
        state.ensure_accepting()?;
        state.failed(task_id, reason, Instant::now())
    }

    pub async fn submit(&self, task_id: &str) -> Result<SubmitReply, BusError> {
        self.dispatch_new(task_id, false).await
    }

    pub async fn retry_task(&self, task_id: &str) -> Result<SubmitReply, BusError> {
        self.dispatch_new(task_id, true).await
    }

    async fn dispatch_new(&self, task_id: &str, retry: bool) -> Result<SubmitReply, BusError> {
        {
            let mut state = self.state.lock().await;
            state.ensure_accepting()?;
            if !state.active.reserve(task_id) {
                return Err(BusError::DuplicateTask(task_id.to_string()));
            }
        }

        let tracked = match self.check_with_tracker(task_id, retry).await {
            Ok(task) => task,
            Err(err) => {
                self.state.lock().await.active.release(task_id);
                warn!(task_id = %task_id, error = %err, "Tracker refused task");
                return Err(err.into());
            }
        };

        let mut state = self.state.lock().await;
        if !state.accepting {
            state.active.release(task_id);
            return Err(BusError::ShuttingDown);
        }
        let previous_failure = if retry {
            state.forget_failure(task_id)
        } else {
            None
        };
        if let Some(title) = &tracked.title {
            state.titles.insert(task_id.to_string(), title.clone());
        }

        let placement = state.enqueue_and_dispatch(task_id, Instant::now());
        if let Placement::Queued { position } = placement {
            info!(task_id = %task_id, position, "No worker available; task queued");
        }
        Ok(SubmitReply::new(task_id, tracked.title, placement, previous_failure))
    }

    async fn check_with_tracker(&self, task_id: &str, retry: bool) -> Result<TrackedTask, TrackerError> {
        let task = if retry {
            let task = self.tracker.show(task_id).await?;
            task.ensure_dispatchable(true)?;
            task
        } else {
            self.tracker.validate(task_id).await?
        };
        self.tracker.mark_in_progress(task_id).await?;
        Ok(task)
    }

    pub async fn reset_worker(&self, name: &str) -> Result<ResetReply, BusError> {
        let mut state = self.state.lock().await;
        state.ensure_accepting()?;
        state.reset_worker(name, Instant::now())
    }

    pub async fn status(&self) -> StatusReport {
        let state = self.state.lock().await;
        state.status_report(Instant::now(), &self.settings.health)
    }

    pub async fn sweep(&self) -> SweepReport {
        let mut state = self.state.lock().await;
        state.sweep(Instant::now(), &self.settings.health)
    }

    /// Forget polls parked through a connection that went away.
    pub async fn disconnect(&self, conn: ConnId) {
        let abandoned = self.state.lock().await.disconnect(conn);
        for worker in abandoned {
            debug!(worker = %worker, conn, "Poll abandoned by disconnect");
        }
    }

    pub async fn begin_shutdown(&self) -> usize {
        self.state.lock().await.begin_shutdown()
    }

    /// Snapshot used by shutdown logging.
    pub async fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock().await;
        (state.registry.len(), state.queue.len(), state.active.len())
    }
}

fn to_data<T: Serialize>(reply: T) -> Result<Value, BusError> {
    serde_json::to_value(reply).map_err(|err| BusError::Internal(err.to_string()))
}
