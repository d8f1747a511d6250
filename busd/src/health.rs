//! Worker health classification, the status snapshot, and the periodic sweep
//! that reclaims unacknowledged hand-offs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, FailureRecord, State};
use crate::dispatch::PendingTask;
use crate::registry::{Worker, WorkerStatus};

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Idle or polling with no call for this long.
    pub stale_after: Duration,
    /// Executing for this long.
    pub stuck_after: Duration,
    /// Pending without ack for this long; the task is reclaimed.
    pub pending_ack: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(90),
            stuck_after: Duration::from_secs(300),
            pending_ack: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Stale,
    Stuck,
}

pub fn classify(
    worker: &Worker,
    pending: Option<&PendingTask>,
    now: Instant,
    thresholds: &HealthThresholds,
) -> Health {
    let exceeded = |since: Instant, limit: Duration| now.saturating_duration_since(since) > limit;
    match worker.status {
        WorkerStatus::Executing => match worker.task_started_at {
            Some(started) if exceeded(started, thresholds.stuck_after) => Health::Stuck,
            _ => Health::Healthy,
        },
        WorkerStatus::Pending => match pending {
            Some(entry) if exceeded(entry.assigned_at, thresholds.pending_ack) => Health::Stuck,
            _ => Health::Healthy,
        },
        WorkerStatus::Idle | WorkerStatus::Polling => {
            if exceeded(worker.last_activity, thresholds.stale_after) {
                Health::Stale
            } else {
                Health::Healthy
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub name: String,
    pub status: WorkerStatus,
    pub health: Health,
    pub current_task: Option<String>,
    pub title: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub idle_seconds: Option<u64>,
    pub executing_seconds: Option<u64>,
    pub pending_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedTask {
    pub task_id: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingReport {
    pub worker: String,
    pub task_id: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSummary {
    pub workers: usize,
    pub idle: usize,
    pub polling: usize,
    pub pending: usize,
    pub executing: usize,
    pub stale: usize,
    pub stuck: usize,
    pub queued: usize,
    pub active_tasks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub workers: Vec<WorkerReport>,
    pub queue: Vec<QueuedTask>,
    pub pending: Vec<PendingReport>,
    pub recent_failures: Vec<FailureRecord>,
    pub summary: StatusSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requeued {
    pub worker: String,
    pub task_id: String,
    pub waited: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub requeued: Vec<Requeued>,
    pub stale: Vec<String>,
    pub stuck: Vec<String>,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.requeued.is_empty() && self.stale.is_empty() && self.stuck.is_empty()
    }
}

fn whole_secs(since: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(since).as_secs()
}

impl State {
    pub(crate) fn status_report(&self, now: Instant, thresholds: &HealthThresholds) -> StatusReport {
        let mut summary = StatusSummary::default();
        let mut workers: Vec<WorkerReport> = self
            .registry
            .workers()
            .map(|worker| {
                let pending = self.pending.get(&worker.name);
                let health = classify(worker, pending, now, thresholds);
                match worker.status {
                    WorkerStatus::Idle => summary.idle += 1,
                    WorkerStatus::Polling => summary.polling += 1,
                    WorkerStatus::Pending => summary.pending += 1,
                    WorkerStatus::Executing => summary.executing += 1,
                }
                match health {
                    Health::Stale => summary.stale += 1,
                    Health::Stuck => summary.stuck += 1,
                    Health::Healthy => {}
                }
                let idle_seconds = worker
                    .status
                    .is_available()
                    .then(|| whole_secs(worker.last_activity, now));
                let executing_seconds = match (worker.status, worker.task_started_at) {
                    (WorkerStatus::Executing, Some(started)) => Some(whole_secs(started, now)),
                    _ => None,
                };
                WorkerReport {
                    name: worker.name.clone(),
                    status: worker.status,
                    health,
                    current_task: worker.current_task.clone(),
                    title: worker
                        .current_task
                        .as_ref()
                        .and_then(|t| self.titles.get(t).cloned()),
                    registered_at: worker.registered_at,
                    last_activity: worker.last_seen_at,
                    idle_seconds,
                    executing_seconds,
                    pending_seconds: pending.map(|p| whole_secs(p.assigned_at, now)),
                }
            })
            .collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));

        let queue: Vec<QueuedTask> = self
            .queue
            .iter()
            .map(|task_id| QueuedTask {
                task_id: task_id.clone(),
                title: self.titles.get(task_id).cloned(),
            })
            .collect();

        let mut pending: Vec<PendingReport> = self
            .pending
            .iter()
            .map(|(worker, entry)| PendingReport {
                worker: worker.clone(),
                task_id: entry.task_id.clone(),
                assigned_at: entry.assigned_at_utc,
            })
            .collect();
        pending.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at).then_with(|| a.worker.cmp(&b.worker)));

        summary.workers = workers.len();
        summary.queued = queue.len();
        summary.active_tasks = self.active.len();

        StatusReport {
            workers,
            queue,
            pending,
            recent_failures: self.failures.iter().rev().cloned().collect(),
            summary,
        }
    }

    /// Reclaim hand-offs nobody acknowledged, then classify the rest.
    ///
    /// Reclaimed tasks go back to the front of the queue, oldest first, and
    /// the workers that let them lapse are skipped when the queue is drained
    /// in this same step.
    pub(crate) fn sweep(&mut self, now: Instant, thresholds: &HealthThresholds) -> SweepReport {
        let mut expired: Vec<(String, String, Instant)> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.assigned_at) > thresholds.pending_ack)
            .map(|(worker, entry)| (worker.clone(), entry.task_id.clone(), entry.assigned_at))
            .collect();
        // Newest first, so after the push_fronts the oldest sits at the head.
        expired.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| b.0.cmp(&a.0)));

        let mut report = SweepReport::default();
        for (worker, task_id, assigned_at) in expired {
            self.pending.remove(&worker);
            if let Some(w) = self.registry.get_mut(&worker) {
                w.release(WorkerStatus::Idle);
            }
            self.queue.push_front(task_id.clone());
            report.requeued.push(Requeued {
                worker,
                task_id,
                waited: now.saturating_duration_since(assigned_at),
            });
        }
        report.requeued.reverse();

        for worker in self.registry.workers() {
            match classify(worker, self.pending.get(&worker.name), now, thresholds) {
                Health::Stale => report.stale.push(worker.name.clone()),
                Health::Stuck => report.stuck.push(worker.name.clone()),
                Health::Healthy => {}
            }
        }
        report.stale.sort();
        report.stuck.sort();

        if !report.requeued.is_empty() {
            let lapsed: Vec<String> = report.requeued.iter().map(|r| r.worker.clone()).collect();
            self.drain_queue(now, &lapsed);
        }
        report
    }
}

/// Run [`Coordinator::sweep`] every `every` until `shutdown` flips to true.
pub fn spawn_health_monitor(
    coordinator: Coordinator,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        info!(interval_secs = every.as_secs(), "Health monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = coordinator.sweep().await;
                    log_sweep(&report);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Health monitor stopped");
    })
}

fn log_sweep(report: &SweepReport) {
    if report.is_quiet() {
        debug!("Health sweep: all workers healthy");
        return;
    }
    for requeued in &report.requeued {
        warn!(
            worker = %requeued.worker,
            task_id = %requeued.task_id,
            waited_secs = requeued.waited.as_secs(),
            "Task not acknowledged in time; returned to queue"
        );
    }
    for worker in &report.stuck {
        warn!(worker = %worker, "Worker appears stuck");
    }
    if !report.stale.is_empty() {
        info!(workers = ?report.stale, "Stale workers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            stale_after: Duration::from_secs(90),
            stuck_after: Duration::from_secs(300),
            pending_ack: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn classification_by_status() {
        let mut state = State::new();
        let t0 = Instant::now();
        state.registry.register("w", t0);
        let th = thresholds();

        let worker = state.registry.get("w").unwrap().clone();
        assert_eq!(classify(&worker, None, t0 + Duration::from_secs(90), &th), Health::Healthy);
        assert_eq!(classify(&worker, None, t0 + Duration::from_secs(91), &th), Health::Stale);

        let mut busy = worker.clone();
        busy.status = WorkerStatus::Executing;
        busy.task_started_at = Some(t0);
        assert_eq!(classify(&busy, None, t0 + Duration::from_secs(400), &th), Health::Stuck);
        assert_eq!(classify(&busy, None, t0 + Duration::from_secs(60), &th), Health::Healthy);
    }

    #[tokio::test]
    async fn sweep_requeues_lapsed_handoffs_oldest_first() {
        let mut state = State::new();
        let t0 = Instant::now();
        state.registry.register("a", t0);
        state.registry.register("b", t0);
        state.queue.push_back("bd-fresh".into());
        let placed = state.drain_queue(t0, &[]);
        assert_eq!(placed.len(), 1);
        state.queue.push_back("bd-later".into());
        state.drain_queue(t0 + Duration::from_secs(5), &[]);
        assert_eq!(state.pending.len(), 2);

        let report = state.sweep(t0 + Duration::from_secs(40), &thresholds());
        let order: Vec<&str> = report.requeued.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(order, vec!["bd-fresh", "bd-later"]);
        assert!(state.pending.is_empty());

        // Both workers lapsed, so nothing is redispatched to them this round.
        let queued: Vec<&String> = state.queue.iter().collect();
        assert_eq!(queued, vec!["bd-fresh", "bd-later"]);
        assert!(state
            .registry
            .workers()
            .all(|w| w.status == WorkerStatus::Idle && w.current_task.is_none()));
    }

    #[tokio::test]
    async fn sweep_hands_reclaimed_task_to_another_worker() {
        let mut state = State::new();
        let t0 = Instant::now();
        state.registry.register("slow", t0);
        state.queue.push_back("bd-1".into());
        state.drain_queue(t0, &[]);
        state.registry.register("spare", t0 + Duration::from_secs(35));

        let report = state.sweep(t0 + Duration::from_secs(35), &thresholds());
        assert_eq!(report.requeued.len(), 1);
        assert_eq!(state.pending["spare"].task_id, "bd-1");
        assert!(state.queue.is_empty());
    }

    #[tokio::test]
    async fn sweep_reports_stuck_executors_without_touching_them() {
        let mut state = State::new();
        let t0 = Instant::now();
        state.registry.register("w", t0);
        let worker = state.registry.get_mut("w").unwrap();
        worker.status = WorkerStatus::Executing;
        worker.current_task = Some("bd-1".into());
        worker.task_started_at = Some(t0);

        let report = state.sweep(t0 + Duration::from_secs(301), &thresholds());
        assert_eq!(report.stuck, vec!["w".to_string()]);
        assert!(report.requeued.is_empty());
        assert_eq!(state.registry.get("w").unwrap().status, WorkerStatus::Executing);
    }

    #[tokio::test]
    async fn status_report_counts_and_sorts() {
        let mut state = State::new();
        let t0 = Instant::now();
        state.registry.register("zeta", t0);
        state.registry.register("alpha", t0 + Duration::from_secs(1));
        state.titles.insert("bd-1".into(), "One".into());
        state.active.reserve("bd-1");
        state.queue.push_back("bd-1".into());
        state.drain_queue(t0, &[]);

        let report = state.status_report(t0 + Duration::from_secs(2), &thresholds());
        let names: Vec<&str> = report.workers.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(report.summary.workers, 2);
        assert_eq!(report.summary.pending, 1);
        assert_eq!(report.summary.idle, 1);
        assert_eq!(report.summary.active_tasks, 1);
        let zeta = &report.workers[1];
        assert_eq!(zeta.title.as_deref(), Some("One"));
        assert_eq!(zeta.pending_seconds, Some(2));
        assert_eq!(report.workers[0].idle_seconds, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_sweeps_on_its_interval_and_stops() {
        use crate::coordinator::CoordinatorSettings;
        use crate::tracker::MemoryTracker;
        use std::sync::Arc;

        let settings = CoordinatorSettings {
            health: HealthThresholds {
                pending_ack: Duration::from_secs(1),
                ..thresholds()
            },
            ..CoordinatorSettings::default()
        };
        let bus = Coordinator::new(Arc::new(MemoryTracker::permissive()), settings);
        bus.register("w").await.unwrap();
        bus.submit("bd-1").await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = spawn_health_monitor(bus.clone(), Duration::from_secs(5), rx);
        tokio::time::sleep(Duration::from_secs(6)).await;

        let report = bus.status().await;
        assert_eq!(report.queue.len(), 1);
        assert!(report.pending.is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
