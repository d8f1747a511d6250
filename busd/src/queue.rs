use std::collections::{HashSet, VecDeque};

/// Pending task ids awaiting a worker, FIFO.
#[derive(Debug, Default)]
pub struct TaskQueue {
    items: VecDeque<String>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, task_id: String) {
        self.items.push_back(task_id);
    }

    /// Requeued work jumps ahead of fresh submissions.
    pub fn push_front(&mut self, task_id: String) {
        self.items.push_front(task_id);
    }

    pub fn pop_front(&mut self) -> Option<String> {
        self.items.pop_front()
    }

    pub fn position(&self, task_id: &str) -> Option<usize> {
        self.items.iter().position(|t| t == task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.position(task_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Ids that are queued, assigned, or mid-submission. Used to reject
/// duplicate submissions while a task is live.
#[derive(Debug, Default)]
pub struct ActiveTasks {
    ids: HashSet<String>,
}

impl ActiveTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the id is already live.
    pub fn reserve(&mut self, task_id: &str) -> bool {
        self.ids.insert(task_id.to_string())
    }

    pub fn release(&mut self, task_id: &str) -> bool {
        self.ids.remove(task_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }
}
