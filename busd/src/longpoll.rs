//! Long-poll bookkeeping.
//!
//! A parked poll is a oneshot sender held in the coordinator state plus a
//! receiver raced against a timer by the calling request task. Nothing here
//! blocks a thread; the coordinator lock is never held while waiting.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Connection identifier assigned by the transport.
pub type ConnId = u64;

/// What a worker receives when a task is handed to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: String,
    pub title: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollReply {
    pub task: Option<Assignment>,
    pub timed_out: bool,
}

impl PollReply {
    pub fn assigned(assignment: Assignment) -> Self {
        Self {
            task: Some(assignment),
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            task: None,
            timed_out: true,
        }
    }
}

#[derive(Debug)]
pub struct BlockedPoller {
    poll_id: u64,
    conn: Option<ConnId>,
    sender: oneshot::Sender<Assignment>,
}

impl BlockedPoller {
    /// Hand the assignment to the waiting caller. Gives it back if the caller
    /// has already gone away.
    pub fn resolve(self, assignment: Assignment) -> Result<(), Assignment> {
        self.sender.send(assignment)
    }
}

/// Receiving half kept by the polling request.
#[derive(Debug)]
pub struct PollTicket {
    pub poll_id: u64,
    rx: oneshot::Receiver<Assignment>,
}

#[derive(Debug)]
pub enum WaitOutcome {
    Assigned(Assignment),
    /// Timer fired first. The ticket is returned so the caller can check,
    /// under the coordinator lock, whether a dispatch slipped in meanwhile.
    Elapsed(PollTicket),
    /// The sender was dropped: disconnect or shutdown.
    Cancelled,
}

impl PollTicket {
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(assignment)) => WaitOutcome::Assigned(assignment),
            Ok(Err(_)) => WaitOutcome::Cancelled,
            Err(_) => WaitOutcome::Elapsed(self),
        }
    }

    pub fn try_claim(&mut self) -> Option<Assignment> {
        self.rx.try_recv().ok()
    }
}

/// At most one blocked poller per worker name.
#[derive(Debug, Default)]
pub struct Waiters {
    by_worker: HashMap<String, BlockedPoller>,
    next_id: u64,
}

impl Waiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a poll for `worker`. `None` if one is already outstanding.
    pub fn park(&mut self, worker: &str, conn: Option<ConnId>) -> Option<PollTicket> {
        if self.by_worker.contains_key(worker) {
            return None;
        }
        self.next_id += 1;
        let (sender, rx) = oneshot::channel();
        let poll_id = self.next_id;
        self.by_worker.insert(
            worker.to_string(),
            BlockedPoller {
                poll_id,
                conn,
                sender,
            },
        );
        Some(PollTicket { poll_id, rx })
    }

    pub fn take(&mut self, worker: &str) -> Option<BlockedPoller> {
        self.by_worker.remove(worker)
    }

    /// Remove the poller only if it is still the one identified by `poll_id`.
    pub fn expire(&mut self, worker: &str, poll_id: u64) -> bool {
        match self.by_worker.get(worker) {
            Some(poller) if poller.poll_id == poll_id => {
                self.by_worker.remove(worker);
                true
            }
            _ => false,
        }
    }

    /// Drop every poller registered through `conn`; returns their worker names.
    pub fn drop_connection(&mut self, conn: ConnId) -> Vec<String> {
        let workers: Vec<String> = self
            .by_worker
            .iter()
            .filter(|(_, poller)| poller.conn == Some(conn))
            .map(|(worker, _)| worker.clone())
            .collect();
        for worker in &workers {
            self.by_worker.remove(worker);
        }
        workers
    }

    /// Drop all pollers (shutdown); returns their worker names.
    pub fn drain(&mut self) -> Vec<String> {
        self.by_worker.drain().map(|(worker, _)| worker).collect()
    }

    pub fn contains(&self, worker: &str) -> bool {
        self.by_worker.contains_key(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(task: &str) -> Assignment {
        Assignment {
            task_id: task.to_string(),
            title: None,
            assigned_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_park_is_refused() {
        let mut waiters = Waiters::new();
        assert!(waiters.park("w1", Some(1)).is_some());
        assert!(waiters.park("w1", Some(2)).is_none());
        assert!(waiters.contains("w1"));
    }

    #[tokio::test]
    async fn resolved_poll_receives_assignment() {
        let mut waiters = Waiters::new();
        let ticket = waiters.park("w1", None).unwrap();
        waiters
            .take("w1")
            .unwrap()
            .resolve(assignment("bd-1"))
            .unwrap();
        match ticket.wait(Duration::from_secs(1)).await {
            WaitOutcome::Assigned(a) => assert_eq!(a.task_id, "bd-1"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_ticket_can_still_claim_a_late_dispatch() {
        let mut waiters = Waiters::new();
        let ticket = waiters.park("w1", None).unwrap();
        let WaitOutcome::Elapsed(mut ticket) = ticket.wait(Duration::from_millis(50)).await else {
            panic!("expected timeout");
        };
        waiters
            .take("w1")
            .unwrap()
            .resolve(assignment("bd-2"))
            .unwrap();
        assert_eq!(ticket.try_claim().map(|a| a.task_id).as_deref(), Some("bd-2"));
    }

    #[tokio::test]
    async fn stale_expiry_does_not_remove_a_newer_poll() {
        let mut waiters = Waiters::new();
        let first = waiters.park("w1", None).unwrap();
        assert!(waiters.expire("w1", first.poll_id));
        let second = waiters.park("w1", None).unwrap();
        assert!(!waiters.expire("w1", first.poll_id));
        assert!(waiters.contains("w1"));
        assert_ne!(first.poll_id, second.poll_id);
    }

    #[tokio::test]
    async fn dropping_a_connection_cancels_its_polls() {
        let mut waiters = Waiters::new();
        let ticket = waiters.park("w1", Some(10)).unwrap();
        let _other = waiters.park("w2", Some(11)).unwrap();
        assert_eq!(waiters.drop_connection(10), vec!["w1".to_string()]);
        assert!(matches!(
            ticket.wait(Duration::from_secs(1)).await,
            WaitOutcome::Cancelled
        ));
        assert!(waiters.contains("w2"));
    }
}
