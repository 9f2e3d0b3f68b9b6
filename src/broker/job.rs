use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::broker::session::ConnId;

pub type JobId = u64;

/// Maximum length of a generated job handle or client-supplied unique key.
pub const JOB_HANDLE_SIZE: usize = 64;
pub const UNIQUE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Dispatch order: high first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// A unit of work. Owned by the broker; queues, indexes and sessions refer to
/// it by `JobId`.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    /// Broker-issued identity, `<prefix>:<counter>`.
    pub handle: String,
    /// Client-supplied deduplication key; may be empty (no dedup) or `-`
    /// (dedup on payload bytes).
    pub unique: Bytes,
    /// Mixing hash the unique index chains this job under.
    pub unique_key: u32,
    pub function: Bytes,
    pub priority: Priority,
    pub data: Bytes,
    pub numerator: u32,
    pub denominator: u32,
    /// Connections that want progress and result frames for this job.
    pub clients: Vec<ConnId>,
    /// The worker currently running the job, if any.
    pub worker: Option<ConnId>,
    /// Set when the job has a record in the persistent queue.
    pub queued: bool,
    /// Abandoned by all foreground clients; reaped the next time dispatch
    /// touches it instead of being handed to a worker.
    pub ignore: bool,
}

impl Job {
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}
