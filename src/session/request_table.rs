//! Pending request table and pre-session send queue

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::protocol::{RequestId, TaskRequest};

use super::handlers::RequestHandlers;

/// Callbacks for one transmitted request awaiting its terminal frame
pub struct PendingEntry {
    pub handlers: RequestHandlers,
    pub label: String,
    pub sent_at: Instant,
}

/// Outstanding requests keyed by request id
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<RequestId, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request_id: RequestId, entry: PendingEntry) -> Option<PendingEntry> {
        self.entries.insert(request_id, entry)
    }

    pub fn get_mut(&mut self, request_id: RequestId) -> Option<&mut PendingEntry> {
        self.entries.get_mut(&request_id)
    }

    pub fn remove(&mut self, request_id: RequestId) -> Option<PendingEntry> {
        self.entries.remove(&request_id)
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.entries.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return entries sent more than `timeout` before `now`
    pub fn drain_expired(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(RequestId, PendingEntry)> {
        let expired: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.sent_at) >= timeout)
            .map(|(request_id, _)| *request_id)
            .collect();

        let mut drained: Vec<(RequestId, PendingEntry)> = expired
            .into_iter()
            .filter_map(|request_id| {
                self.entries
                    .remove(&request_id)
                    .map(|entry| (request_id, entry))
            })
            .collect();
        drained.sort_by_key(|(request_id, _)| *request_id);
        drained
    }

    /// Remove every entry
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }
}

/// Request held back until the session is established; never stamped
pub struct QueuedTask {
    pub request: TaskRequest,
    pub handlers: Option<RequestHandlers>,
}

/// FIFO of requests issued before the session was ready
#[derive(Default)]
pub struct SendQueue {
    tasks: VecDeque<QueuedTask>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task, returning its zero-based position
    pub fn push(&mut self, task: QueuedTask) -> usize {
        self.tasks.push_back(task);
        self.tasks.len() - 1
    }

    /// Take every queued task, oldest first
    pub fn take_all(&mut self) -> VecDeque<QueuedTask> {
        std::mem::take(&mut self.tasks)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
