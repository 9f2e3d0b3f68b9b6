use std::collections::VecDeque;

use bytes::Bytes;

use crate::broker::job::{JobId, Priority};
use crate::broker::session::ConnId;

/// A named capability that workers declare and clients target. Created
/// lazily on first reference.
#[derive(Debug)]
pub struct Function {
    pub name: Bytes,
    /// Cap on unfinished jobs; 0 means unbounded.
    pub max_queue_size: u32,
    /// Jobs of this function still in existence, in any state.
    pub job_total: u32,
    /// Jobs of this function currently assigned to a worker.
    pub job_running: u32,
    /// Per-priority FIFO of queued jobs.
    queues: [VecDeque<JobId>; 3],
    /// Connections that declared CAN_DO for this function.
    pub workers: Vec<ConnId>,
}

impl Function {
    pub fn new(name: Bytes) -> Self {
        Self {
            name,
            max_queue_size: 0,
            job_total: 0,
            job_running: 0,
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            workers: Vec::new(),
        }
    }

    pub fn queued_jobs(&self, priority: Priority) -> usize {
        self.queues[priority.index()].len()
    }

    pub fn has_queued_jobs(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }

    pub fn push_job(&mut self, priority: Priority, job: JobId) {
        self.queues[priority.index()].push_back(job);
    }

    /// Pop the next queued job, scanning priorities high to low.
    pub fn pop_job(&mut self) -> Option<(JobId, Priority)> {
        for priority in Priority::ALL {
            if let Some(job) = self.queues[priority.index()].pop_front() {
                return Some((job, priority));
            }
        }
        None
    }

    pub fn add_worker(&mut self, conn: ConnId) {
        if !self.workers.contains(&conn) {
            self.workers.push(conn);
        }
    }

    pub fn remove_worker(&mut self, conn: ConnId) {
        self.workers.retain(|&id| id != conn);
    }
}
