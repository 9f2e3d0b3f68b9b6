pub mod file;

use bytes::Bytes;

use crate::broker::job::Priority;
use crate::error::Result;

pub use file::FileQueue;

/// What a persistent queue stores per job. Handles are not persisted; they
/// are regenerated from the broker's counter on replay.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub unique: Bytes,
    pub function: Bytes,
    pub data: Bytes,
    pub priority: Priority,
}

/// A pluggable persistent queue. The broker calls these synchronously from
/// job lifecycle transitions while holding its lock, so implementations must
/// not block on anything slower than local I/O.
///
/// `add` + `flush` form one commit boundary on submission; `done` releases a
/// record after terminal completion or rollback; `replay` runs once at
/// startup and feeds every stored record back into the broker.
pub trait QueueAdapter: Send + Sync {
    fn add(&self, record: &QueueRecord) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn done(&self, unique: &[u8], function: &[u8]) -> Result<()>;

    fn replay(&self, add: &mut dyn FnMut(QueueRecord) -> Result<()>) -> Result<()>;
}
