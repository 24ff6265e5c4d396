//! In-process work queues with broker semantics.
//!
//! Each named queue offers at-least-once delivery with priority-then-FIFO
//! ordering, delayed jobs, reservation leases that return to waiting after
//! a stall interval, idempotent completion/failure, and bounded retention
//! of settled jobs. The external broker named in configuration stays behind
//! this adapter; the bundled implementation serves the single-process
//! pipeline and the test suite.
//!
//! Timing uses `tokio::time::Instant` throughout so lease and delay
//! behavior is exercisable under paused test time.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Queue errors. Enqueue only fails when the broker is unavailable: for
/// the in-process binding that means a poisoned mutex, which is fatal.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{0}' is unavailable")]
    Unavailable(String),

    #[error("payload serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Options applied at enqueue time.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Higher runs first. Ties break FIFO.
    pub priority: i32,
    /// Retry budget the managed worker honors.
    pub max_attempts: u32,
    /// Base backoff for requeues, milliseconds.
    pub backoff_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_attempts: 3,
            backoff_ms: 1_000,
        }
    }
}

/// A leased job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    /// Zero on first delivery; incremented by each requeue.
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Waiting jobs carrying a non-default priority.
    pub prioritized: usize,
}

impl QueueCounts {
    /// Jobs that still represent pending work.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.waiting + self.active + self.delayed
    }
}

/// Snapshot of one active lease, for deadlock diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveLease {
    pub job_id: String,
    pub worker: String,
    pub age_ms: u64,
}

struct WaitingEntry {
    priority: i32,
    seq: u64,
    job: Job,
}

impl PartialEq for WaitingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for WaitingEntry {}
impl PartialOrd for WaitingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for WaitingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower seq (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct DelayedEntry {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for DelayedEntry {}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap turned min-heap: earliest due first.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Lease {
    job: Job,
    worker: String,
    leased_at: Instant,
}

#[derive(Default)]
struct QueueState {
    waiting: BinaryHeap<WaitingEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    active: HashMap<String, Lease>,
    completed: VecDeque<(String, Instant)>,
    completed_ids: HashSet<String>,
    failed: VecDeque<(String, String, Instant)>,
    failed_ids: HashSet<String>,
}

/// One named queue.
pub struct JobQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    seq: AtomicU64,
    stall_interval: Duration,
    retention_count: usize,
    retention_age: Duration,
}

impl JobQueue {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        stall_interval: Duration,
        retention_count: usize,
        retention_age: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            stall_interval,
            retention_count,
            retention_age,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a payload, returning the new job id.
    pub fn enqueue<T: Serialize>(
        &self,
        payload: &T,
        opts: JobOptions,
    ) -> Result<String, QueueError> {
        let payload = serde_json::to_value(payload)?;
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            queue: self.name.clone(),
            payload,
            priority: opts.priority,
            attempt: 0,
            max_attempts: opts.max_attempts,
            backoff_ms: opts.backoff_ms,
        };
        let id = job.id.clone();
        {
            let mut state = self.lock()?;
            let seq = self.next_seq();
            state.waiting.push(WaitingEntry {
                priority: job.priority,
                seq,
                job,
            });
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Reserve up to `n` jobs for `worker`, waiting at most `timeout`.
    ///
    /// Returns an empty vector on timeout: never blocks forever. Stalled
    /// leases and due delayed jobs are promoted before each attempt.
    pub async fn reserve(
        &self,
        worker: &str,
        n: usize,
        timeout: Duration,
    ) -> Result<Vec<Job>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let jobs = {
                let mut state = self.lock()?;
                self.promote_internal(&mut state, Instant::now());
                let mut jobs = Vec::new();
                while jobs.len() < n {
                    let Some(entry) = state.waiting.pop() else { break };
                    let job = entry.job;
                    state.active.insert(
                        job.id.clone(),
                        Lease {
                            job: job.clone(),
                            worker: worker.to_string(),
                            leased_at: Instant::now(),
                        },
                    );
                    jobs.push(job);
                }
                jobs
            };
            if !jobs.is_empty() {
                return Ok(jobs);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Wake on new work or when the remaining timeout elapses. A
            // delayed job may come due before anything is enqueued, so cap
            // the sleep at a short poll interval.
            let remaining = deadline - now;
            let wait = remaining.min(Duration::from_millis(250));
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    /// Mark a leased job completed. Idempotent: repeated calls (and calls
    /// for jobs re-leased after a stall) settle to the first outcome.
    pub fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if state.completed_ids.contains(job_id) || state.failed_ids.contains(job_id) {
            return Ok(());
        }
        state.active.remove(job_id);
        state.completed.push_back((job_id.to_string(), Instant::now()));
        state.completed_ids.insert(job_id.to_string());
        self.enforce_retention(&mut state);
        Ok(())
    }

    /// Mark a leased job failed. Terminal and idempotent.
    pub fn fail(&self, job_id: &str, reason: &str) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if state.completed_ids.contains(job_id) || state.failed_ids.contains(job_id) {
            return Ok(());
        }
        state.active.remove(job_id);
        state
            .failed
            .push_back((job_id.to_string(), reason.to_string(), Instant::now()));
        state.failed_ids.insert(job_id.to_string());
        self.enforce_retention(&mut state);
        Ok(())
    }

    /// Return a leased job to the queue after `delay`, bumping its attempt
    /// counter. A zero delay goes straight back to waiting.
    pub fn requeue(&self, job_id: &str, delay: Duration) -> Result<(), QueueError> {
        let mut notify = false;
        {
            let mut state = self.lock()?;
            if let Some(lease) = state.active.remove(job_id) {
                let mut job = lease.job;
                job.attempt += 1;
                let seq = self.next_seq();
                if delay.is_zero() {
                    state.waiting.push(WaitingEntry {
                        priority: job.priority,
                        seq,
                        job,
                    });
                    notify = true;
                } else {
                    state.delayed.push(DelayedEntry {
                        due: Instant::now() + delay,
                        seq,
                        job,
                    });
                }
            }
        }
        if notify {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Extend the lease on a long-running job.
    pub fn touch(&self, job_id: &str) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if let Some(lease) = state.active.get_mut(job_id) {
            lease.leased_at = Instant::now();
        }
        Ok(())
    }

    /// Promote due delayed jobs and reclaim stalled leases.
    pub fn promote(&self) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        self.promote_internal(&mut state, Instant::now());
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Current counters.
    pub fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut state = self.lock()?;
        self.promote_internal(&mut state, Instant::now());
        let prioritized = state
            .waiting
            .iter()
            .filter(|entry| entry.priority != 0)
            .count();
        Ok(QueueCounts {
            waiting: state.waiting.len(),
            active: state.active.len(),
            delayed: state.delayed.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            prioritized,
        })
    }

    /// Active leases with ages, for the deadlock diagnostic snapshot.
    pub fn active_leases(&self) -> Result<Vec<ActiveLease>, QueueError> {
        let state = self.lock()?;
        let now = Instant::now();
        let mut leases: Vec<ActiveLease> = state
            .active
            .values()
            .map(|lease| ActiveLease {
                job_id: lease.job.id.clone(),
                worker: lease.worker.clone(),
                age_ms: now.saturating_duration_since(lease.leased_at).as_millis() as u64,
            })
            .collect();
        leases.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        Ok(leases)
    }

    fn promote_internal(&self, state: &mut QueueState, now: Instant) {
        // Due delayed jobs.
        while let Some(entry) = state.delayed.peek() {
            if entry.due > now {
                break;
            }
            let entry = state.delayed.pop().expect("peeked entry");
            state.waiting.push(WaitingEntry {
                priority: entry.job.priority,
                seq: entry.seq,
                job: entry.job,
            });
        }
        // Stalled leases return to waiting for redelivery.
        let stalled: Vec<String> = state
            .active
            .iter()
            .filter(|(_, lease)| now.saturating_duration_since(lease.leased_at) >= self.stall_interval)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stalled {
            if let Some(lease) = state.active.remove(&id) {
                tracing::warn!(queue = %self.name, job_id = %id, "lease stalled, returning job to waiting");
                let seq = self.next_seq();
                let mut job = lease.job;
                job.attempt += 1;
                state.waiting.push(WaitingEntry {
                    priority: job.priority,
                    seq,
                    job,
                });
            }
        }
    }

    fn enforce_retention(&self, state: &mut QueueState) {
        let now = Instant::now();
        while state.completed.len() > self.retention_count
            || state
                .completed
                .front()
                .is_some_and(|(_, at)| now.saturating_duration_since(*at) > self.retention_age)
        {
            if let Some((id, _)) = state.completed.pop_front() {
                state.completed_ids.remove(&id);
            } else {
                break;
            }
        }
        while state.failed.len() > self.retention_count
            || state
                .failed
                .front()
                .is_some_and(|(_, _, at)| now.saturating_duration_since(*at) > self.retention_age)
        {
            if let Some((id, _, _)) = state.failed.pop_front() {
                state.failed_ids.remove(&id);
            } else {
                break;
            }
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Unavailable(self.name.clone()))
    }
}

/// All queues of one pipeline process.
pub struct QueueRegistry {
    queues: Vec<std::sync::Arc<JobQueue>>,
}

impl QueueRegistry {
    /// Create the given named queues with shared broker settings.
    #[must_use]
    pub fn new(
        names: &[&str],
        stall_interval: Duration,
        retention_count: usize,
        retention_age: Duration,
    ) -> Self {
        let queues = names
            .iter()
            .map(|name| {
                std::sync::Arc::new(JobQueue::new(
                    *name,
                    stall_interval,
                    retention_count,
                    retention_age,
                ))
            })
            .collect();
        Self { queues }
    }

    /// Look up a queue by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<std::sync::Arc<JobQueue>> {
        self.queues.iter().find(|q| q.name() == name).cloned()
    }

    /// Counts for every queue, in registration order.
    pub fn counts(&self) -> Result<Vec<(String, QueueCounts)>, QueueError> {
        self.queues
            .iter()
            .map(|q| q.counts().map(|c| (q.name().to_string(), c)))
            .collect()
    }

    /// True when no queue holds outstanding work.
    pub fn all_idle(&self) -> Result<bool, QueueError> {
        Ok(self
            .counts()?
            .iter()
            .all(|(_, counts)| counts.outstanding() == 0))
    }

    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name().to_string()).collect()
    }
}
