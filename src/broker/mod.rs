pub mod function;
pub mod hash;
pub mod job;
pub mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::broker::function::Function;
use crate::broker::hash::mixing_hash;
use crate::broker::job::{Job, JobId, Priority, JOB_HANDLE_SIZE, UNIQUE_SIZE};
use crate::broker::session::{Capability, ConnId, Outbound, Session};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::protocol::packet::Packet;
use crate::queue::{QueueAdapter, QueueRecord};

/// Outcome of a job submission: the handle handed back to the client, and
/// whether the job was freshly created or deduplicated onto an existing one.
#[derive(Debug)]
pub struct Submitted {
    pub job: JobId,
    pub handle: String,
    pub created: bool,
}

/// Process-wide broker state: the function registry, all live jobs with
/// their handle and unique indexes, and the per-connection sessions. Every
/// protocol side effect is a method here, run under the broker lock.
pub struct Broker {
    handle_prefix: String,
    handle_count: u32,
    next_job_id: JobId,
    /// Set while reconstructing jobs from the persistent queue at startup;
    /// suppresses write-through so replayed jobs are not re-persisted.
    replay: bool,
    worker_wakeup: u32,
    queue: Option<Arc<dyn QueueAdapter>>,
    functions: HashMap<Bytes, Function>,
    jobs: HashMap<JobId, Job>,
    by_handle: HashMap<String, JobId>,
    /// Unique index: mixing hash of the dedup key to the chain of jobs
    /// stored under it. Chains are confirmed byte-exact before reuse.
    by_unique: HashMap<u32, Vec<JobId>>,
    sessions: HashMap<ConnId, Session>,
}

#[derive(Clone, Copy)]
enum DedupKey<'a> {
    Unique(&'a [u8]),
    Data(&'a [u8]),
}

impl Broker {
    pub fn new(config: &BrokerConfig, queue: Option<Arc<dyn QueueAdapter>>) -> Self {
        // Leave room in the handle cap for the separator and counter digits.
        let mut handle_prefix = config.handle_prefix.clone();
        let cap = JOB_HANDLE_SIZE - 12;
        if handle_prefix.len() > cap {
            let mut end = cap;
            while !handle_prefix.is_char_boundary(end) {
                end -= 1;
            }
            handle_prefix.truncate(end);
        }

        Self {
            handle_prefix,
            handle_count: 1,
            next_job_id: 1,
            replay: false,
            worker_wakeup: config.worker_wakeup,
            queue,
            functions: HashMap::new(),
            jobs: HashMap::new(),
            by_handle: HashMap::new(),
            by_unique: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Reconstruct jobs from the persistent queue. Runs once at startup,
    /// before any connection is accepted. Returns the number of jobs
    /// restored.
    pub fn replay_queue(&mut self) -> Result<usize> {
        let Some(queue) = self.queue.clone() else {
            return Ok(0);
        };

        self.replay = true;
        let mut count = 0usize;
        let result = queue.replay(&mut |record: QueueRecord| {
            self.job_add(
                record.function,
                record.unique,
                record.data,
                record.priority,
                None,
            )?;
            count += 1;
            Ok(())
        });
        self.replay = false;
        result?;

        if count > 0 {
            tracing::info!(jobs = count, "Restored jobs from the persistent queue");
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn add_session(
        &mut self,
        id: ConnId,
        peer: SocketAddr,
        sender: mpsc::UnboundedSender<Outbound>,
    ) {
        self.sessions.insert(id, Session::new(id, peer, sender));
    }

    /// Tear down a connection's session: withdraw worker capabilities,
    /// requeue in-flight assignments, and ignore-mark foreground jobs this
    /// was the last client of.
    pub fn remove_session(&mut self, conn: ConnId) {
        let Some(session) = self.sessions.remove(&conn) else {
            return;
        };

        for cap in &session.capabilities {
            if let Some(function) = self.functions.get_mut(&cap.function) {
                function.remove_worker(conn);
            }
        }
        for job_id in session.running.iter().copied() {
            tracing::debug!(conn, job = job_id, "Requeueing job from lost worker");
            self.enqueue_job(job_id);
        }

        for job_id in &session.client_jobs {
            if let Some(job) = self.jobs.get_mut(job_id) {
                job.clients.retain(|&c| c != conn);
                if job.clients.is_empty() {
                    job.ignore = true;
                }
            }
        }
    }

    pub fn send_to(&self, conn: ConnId, item: Outbound) {
        if let Some(session) = self.sessions.get(&conn) {
            session.send(item);
        }
    }

    pub fn set_client_id(&mut self, conn: ConnId, id: &[u8]) {
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.client_id = String::from_utf8_lossy(id).into_owned();
        }
    }

    /// Negotiate a per-connection option. Returns false for options the
    /// broker does not know.
    pub fn set_option(&mut self, conn: ConnId, option: &[u8]) -> bool {
        if option != b"exceptions" {
            return false;
        }
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.exceptions = true;
        }
        true
    }

    // ------------------------------------------------------------------
    // Worker capabilities
    // ------------------------------------------------------------------

    pub fn can_do(&mut self, conn: ConnId, function: Bytes, timeout: u32) {
        self.functions
            .entry(function.clone())
            .or_insert_with(|| Function::new(function.clone()))
            .add_worker(conn);

        if let Some(session) = self.sessions.get_mut(&conn) {
            match session
                .capabilities
                .iter_mut()
                .find(|c| c.function == function)
            {
                Some(cap) => cap.timeout = timeout,
                None => session.capabilities.push(Capability { function, timeout }),
            }
        }
    }

    pub fn cant_do(&mut self, conn: ConnId, function: &[u8]) {
        let running = match self.sessions.get_mut(&conn) {
            Some(session) => {
                session
                    .capabilities
                    .retain(|c| c.function.as_ref() != function);
                session.running.clone()
            }
            None => return,
        };

        if let Some(entry) = self.functions.get_mut(function) {
            entry.remove_worker(conn);
        }
        for job_id in running {
            if self
                .jobs
                .get(&job_id)
                .is_some_and(|j| j.function.as_ref() == function)
            {
                self.enqueue_job(job_id);
            }
        }
    }

    pub fn reset_abilities(&mut self, conn: ConnId) {
        let (capabilities, running) = match self.sessions.get_mut(&conn) {
            Some(session) => (
                std::mem::take(&mut session.capabilities),
                session.running.clone(),
            ),
            None => return,
        };

        for cap in capabilities {
            if let Some(function) = self.functions.get_mut(&cap.function) {
                function.remove_worker(conn);
            }
        }
        for job_id in running {
            self.enqueue_job(job_id);
        }
    }

    /// Mark a worker sleeping. If one of its functions already has queued
    /// work the NOOP goes out immediately, so a wake-up that raced the
    /// PRE_SLEEP is not lost.
    pub fn pre_sleep(&mut self, conn: ConnId) {
        let capabilities = {
            let Some(session) = self.sessions.get_mut(&conn) else {
                return;
            };
            session.sleeping = true;
            if session.noop_queued {
                return;
            }
            session
                .capabilities
                .iter()
                .map(|c| c.function.clone())
                .collect::<Vec<_>>()
        };

        let has_work = capabilities
            .iter()
            .any(|name| self.functions.get(name).is_some_and(Function::has_queued_jobs));
        if has_work {
            if let Some(session) = self.sessions.get_mut(&conn) {
                session.send_packet(Packet::noop());
                session.noop_queued = true;
            }
        }
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Create or deduplicate a job. `client` is the submitting connection
    /// for foreground submissions and `None` for background ones (and for
    /// replay). Fresh background jobs are written through to the persistent
    /// queue before they become takeable.
    pub fn job_add(
        &mut self,
        function: Bytes,
        unique: Bytes,
        data: Bytes,
        priority: Priority,
        client: Option<ConnId>,
    ) -> Result<Submitted> {
        self.functions
            .entry(function.clone())
            .or_insert_with(|| Function::new(function.clone()));

        // Unique keys are capped; overlong ones are truncated, and dedup
        // operates on the truncated bytes.
        let unique = if unique.len() > UNIQUE_SIZE {
            unique.slice(..UNIQUE_SIZE)
        } else {
            unique
        };

        let (unique_key, existing) = if unique.is_empty() {
            (mixing_hash(b""), None)
        } else if unique.as_ref() == b"-" {
            if data.is_empty() {
                (mixing_hash(b"-"), None)
            } else {
                let key = mixing_hash(&data);
                (key, self.find_dedup(key, &function, DedupKey::Data(&data)))
            }
        } else {
            let key = mixing_hash(&unique);
            (
                key,
                self.find_dedup(key, &function, DedupKey::Unique(&unique)),
            )
        };

        if let Some(job_id) = existing {
            let handle = self.jobs[&job_id].handle.clone();
            if let Some(conn) = client {
                self.register_client(job_id, conn);
            }
            tracing::debug!(handle = %handle, "Submission matched an existing job");
            return Ok(Submitted {
                job: job_id,
                handle,
                created: false,
            });
        }

        {
            let entry = self.functions.get(&function).expect("created above");
            if entry.max_queue_size > 0 && entry.job_total >= entry.max_queue_size {
                return Err(BrokerError::QueueFull(
                    String::from_utf8_lossy(&function).into_owned(),
                ));
            }
        }

        let id = self.next_job_id;
        self.next_job_id += 1;
        let handle = format!("{}:{}", self.handle_prefix, self.handle_count);
        self.handle_count = self.handle_count.wrapping_add(1);

        let mut job = Job {
            id,
            handle: handle.clone(),
            unique,
            unique_key,
            function: function.clone(),
            priority,
            data,
            numerator: 0,
            denominator: 0,
            clients: Vec::new(),
            worker: None,
            queued: false,
            ignore: false,
        };

        if self.replay {
            job.queued = true;
        } else if client.is_none() {
            // Background submissions become durable before they are
            // takeable; add + flush is one commit boundary.
            if let Some(queue) = self.queue.clone() {
                let record = QueueRecord {
                    unique: job.unique.clone(),
                    function: job.function.clone(),
                    data: job.data.clone(),
                    priority,
                };
                queue.add(&record)?;
                queue.flush()?;
                job.queued = true;
            }
        }

        self.jobs.insert(id, job);
        self.by_handle.insert(handle.clone(), id);
        self.by_unique.entry(unique_key).or_default().push(id);
        if let Some(entry) = self.functions.get_mut(&function) {
            entry.job_total += 1;
        }

        self.enqueue_job(id);
        if let Some(conn) = client {
            self.register_client(id, conn);
        }

        tracing::debug!(handle = %handle, priority = %priority, "Job created");
        Ok(Submitted {
            job: id,
            handle,
            created: true,
        })
    }

    fn find_dedup(&self, key: u32, function: &[u8], what: DedupKey<'_>) -> Option<JobId> {
        let chain = self.by_unique.get(&key)?;
        chain.iter().copied().find(|id| {
            let job = &self.jobs[id];
            if job.unique_key != key || job.function.as_ref() != function {
                return false;
            }
            match what {
                DedupKey::Unique(unique) => job.unique.as_ref() == unique,
                DedupKey::Data(data) => job.data.as_ref() == data,
            }
        })
    }

    /// Attach a connection as a client of a job so it receives the job's
    /// progress and result frames.
    pub fn register_client(&mut self, job_id: JobId, conn: ConnId) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            if !job.clients.contains(&conn) {
                job.clients.push(conn);
            }
        }
        if let Some(session) = self.sessions.get_mut(&conn) {
            if !session.client_jobs.contains(&job_id) {
                session.client_jobs.push(job_id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Put a job (back) on its function's priority FIFO and wake sleeping
    /// capable workers. Clears any worker assignment and progress counters.
    pub fn enqueue_job(&mut self, job_id: JobId) {
        let (function, priority, prev_worker) = {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                return;
            };
            job.numerator = 0;
            job.denominator = 0;
            (job.function.clone(), job.priority, job.worker.take())
        };

        if let Some(worker) = prev_worker {
            if let Some(entry) = self.functions.get_mut(&function) {
                entry.job_running -= 1;
            }
            if let Some(session) = self.sessions.get_mut(&worker) {
                session.running.retain(|&j| j != job_id);
            }
        }

        if let Some(entry) = self.functions.get_mut(&function) {
            entry.push_job(priority, job_id);
        }
        self.wake_workers(&function);
    }

    fn wake_workers(&mut self, function: &Bytes) {
        let workers = match self.functions.get(function) {
            Some(entry) => entry.workers.clone(),
            None => return,
        };

        let mut woken = 0u32;
        for conn in workers {
            if let Some(session) = self.sessions.get_mut(&conn) {
                if session.sleeping && !session.noop_queued {
                    session.send_packet(Packet::noop());
                    session.noop_queued = true;
                    woken += 1;
                    if self.worker_wakeup > 0 && woken >= self.worker_wakeup {
                        break;
                    }
                }
            }
        }
    }

    /// Hand the requesting worker the next eligible job: walk its
    /// capabilities in declaration order, priorities high to low. Abandoned
    /// jobs encountered on the way are reaped and the scan continues.
    pub fn grab_job(&mut self, conn: ConnId) -> Option<JobId> {
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.sleeping = false;
            session.noop_queued = false;
        }

        loop {
            let function = {
                let session = self.sessions.get(&conn)?;
                session
                    .capabilities
                    .iter()
                    .map(|c| &c.function)
                    .find(|name| {
                        self.functions
                            .get(name.as_ref())
                            .is_some_and(Function::has_queued_jobs)
                    })
                    .cloned()?
            };

            let (job_id, _) = self.functions.get_mut(&function)?.pop_job()?;

            let abandoned = self.jobs.get(&job_id).map_or(true, |j| j.ignore);
            if abandoned {
                self.free_job(job_id);
                continue;
            }

            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.worker = Some(conn);
            }
            if let Some(entry) = self.functions.get_mut(&function) {
                entry.job_running += 1;
            }
            if let Some(session) = self.sessions.get_mut(&conn) {
                session.running.push(job_id);
            }

            tracing::debug!(conn, job = job_id, "Job assigned");
            return Some(job_id);
        }
    }

    // ------------------------------------------------------------------
    // Worker progress and results
    // ------------------------------------------------------------------

    fn assigned_job(&self, conn: ConnId, handle: &[u8]) -> Result<JobId> {
        std::str::from_utf8(handle)
            .ok()
            .and_then(|h| self.by_handle.get(h))
            .copied()
            .filter(|id| self.jobs.get(id).is_some_and(|j| j.worker == Some(conn)))
            .ok_or_else(|| BrokerError::JobNotFound(String::from_utf8_lossy(handle).into_owned()))
    }

    /// Forward a WORK_DATA or WORK_WARNING frame to the job's clients.
    pub fn work_progress(&mut self, conn: ConnId, packet: &Packet) -> Result<()> {
        let job_id = self.assigned_job(conn, packet.arg(0))?;
        self.forward_to_clients(job_id, packet, false);
        Ok(())
    }

    /// Record and forward a WORK_STATUS frame.
    pub fn work_status(&mut self, conn: ConnId, packet: &Packet) -> Result<()> {
        let job_id = self.assigned_job(conn, packet.arg(0))?;
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.numerator = parse_counter(packet.arg(1));
            job.denominator = parse_counter(packet.arg(2));
        }
        self.forward_to_clients(job_id, packet, false);
        Ok(())
    }

    /// Forward a WORK_EXCEPTION frame to clients that negotiated the
    /// `exceptions` option. Not terminal; the worker follows up with
    /// WORK_COMPLETE or WORK_FAIL.
    pub fn work_exception(&mut self, conn: ConnId, packet: &Packet) -> Result<()> {
        let job_id = self.assigned_job(conn, packet.arg(0))?;
        self.forward_to_clients(job_id, packet, true);
        Ok(())
    }

    /// Terminal result (WORK_COMPLETE or WORK_FAIL): forward to clients,
    /// release the persistent queue record, and free the job.
    pub fn work_terminal(&mut self, conn: ConnId, packet: &Packet) -> Result<()> {
        let job_id = self.assigned_job(conn, packet.arg(0))?;
        self.forward_to_clients(job_id, packet, false);
        tracing::debug!(
            conn,
            job = job_id,
            result = %packet.command,
            "Job finished"
        );
        self.free_job(job_id);
        Ok(())
    }

    fn forward_to_clients(&self, job_id: JobId, packet: &Packet, exceptions_only: bool) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        for client in &job.clients {
            if let Some(session) = self.sessions.get(client) {
                if exceptions_only && !session.exceptions {
                    continue;
                }
                session.send_packet(packet.clone().into_response());
            }
        }
    }

    /// Drop a job from every structure it lives in and release its
    /// persistent queue record if it has one.
    pub fn free_job(&mut self, job_id: JobId) {
        let Some(job) = self.jobs.remove(&job_id) else {
            return;
        };

        if let Some(entry) = self.functions.get_mut(&job.function) {
            entry.job_total -= 1;
            if job.worker.is_some() {
                entry.job_running -= 1;
            }
        }
        if let Some(worker) = job.worker {
            if let Some(session) = self.sessions.get_mut(&worker) {
                session.running.retain(|&j| j != job_id);
            }
        }
        for client in &job.clients {
            if let Some(session) = self.sessions.get_mut(client) {
                session.client_jobs.retain(|&j| j != job_id);
            }
        }

        self.by_handle.remove(&job.handle);
        if let Some(chain) = self.by_unique.get_mut(&job.unique_key) {
            chain.retain(|&j| j != job_id);
            if chain.is_empty() {
                self.by_unique.remove(&job.unique_key);
            }
        }

        if job.queued {
            if let Some(queue) = &self.queue {
                if let Err(err) = queue.done(&job.unique, &job.function) {
                    tracing::error!(handle = %job.handle, error = %err, "Queue done failed");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookups and snapshots
    // ------------------------------------------------------------------

    pub fn job(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn job_by_handle(&self, handle: &str) -> Option<&Job> {
        self.by_handle.get(handle).and_then(|id| self.jobs.get(id))
    }

    pub fn function(&self, name: &[u8]) -> Option<&Function> {
        self.functions.get(name)
    }

    /// `(known, running, numerator, denominator)` for GET_STATUS.
    pub fn job_status(&self, handle: &[u8]) -> (bool, bool, u32, u32) {
        let job = std::str::from_utf8(handle)
            .ok()
            .and_then(|h| self.job_by_handle(h));
        match job {
            Some(job) => (true, job.is_running(), job.numerator, job.denominator),
            None => (false, false, 0, 0),
        }
    }

    pub fn running_jobs(&self) -> usize {
        self.jobs.values().filter(|j| j.worker.is_some()).count()
    }

    /// Per-function counters for the administrative `status` command,
    /// sorted by name for stable output.
    pub fn function_status(&self) -> Vec<(String, u32, u32, usize)> {
        let mut rows: Vec<_> = self
            .functions
            .values()
            .map(|f| {
                (
                    String::from_utf8_lossy(&f.name).into_owned(),
                    f.job_total,
                    f.job_running,
                    f.workers.len(),
                )
            })
            .collect();
        rows.sort();
        rows
    }

    /// Per-connection rows for the administrative `workers` command.
    pub fn worker_rows(&self) -> Vec<(ConnId, SocketAddr, String, Vec<String>)> {
        let mut rows: Vec<_> = self
            .sessions
            .values()
            .map(|session| {
                (
                    session.id,
                    session.peer,
                    session.client_id.clone(),
                    session
                        .capabilities
                        .iter()
                        .map(|c| String::from_utf8_lossy(&c.function).into_owned())
                        .collect(),
                )
            })
            .collect();
        rows.sort_by_key(|row| row.0);
        rows
    }

    pub fn set_max_queue(&mut self, function: Bytes, size: u32) {
        self.functions
            .entry(function.clone())
            .or_insert_with(|| Function::new(function))
            .max_queue_size = size;
    }
}

fn parse_counter(bytes: &[u8]) -> u32 {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}
