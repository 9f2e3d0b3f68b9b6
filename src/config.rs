use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 4730;
pub const DEFAULT_BACKLOG: u32 = 64;

/// Persistent queue backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum QueueKind {
    #[default]
    None,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Addresses to listen on. Plural so one socket per address family works.
    pub listen: Vec<SocketAddr>,
    pub backlog: u32,
    /// Worker threads for the runtime. 0 uses the runtime default.
    pub threads: usize,
    /// Accepted for compatibility; dispatch treats WORK_FAIL as terminal
    /// until a retry policy is defined.
    pub job_retries: u32,
    /// Sleeping workers woken per job submission. 0 wakes all of them.
    pub worker_wakeup: u32,
    /// Prefix for generated job handles; handles are `<prefix>:<counter>`.
    pub handle_prefix: String,
    pub queue: QueueKind,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            listen: vec![SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))],
            backlog: DEFAULT_BACKLOG,
            threads: 0,
            job_retries: 0,
            worker_wakeup: 0,
            handle_prefix: format!("H:{}", host),
            queue: QueueKind::None,
        }
    }
}

impl BrokerConfig {
    pub fn new(listen: Vec<SocketAddr>) -> Self {
        Self {
            listen,
            ..Default::default()
        }
    }

    pub fn with_handle_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.handle_prefix = prefix.into();
        self
    }

    pub fn with_worker_wakeup(mut self, count: u32) -> Self {
        self.worker_wakeup = count;
        self
    }
}
