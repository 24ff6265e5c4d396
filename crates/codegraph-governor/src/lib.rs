//! Global concurrency governor.
//!
//! A single process-wide counting permit pool caps simultaneous calls to
//! the expensive collaborators (LLM, graph store) across every worker
//! type. Per-type sub-caps may sum beyond the global cap: the global cap
//! is authoritative. Waiters queue FIFO within their worker type; across
//! types, higher job priority is admitted first.
//!
//! A bare semaphore cannot express per-type FIFO, cross-type priority, or
//! protective rejection, so the pool is an explicit waiter queue behind a
//! mutex. The mutex is never held across an await: `acquire` registers a
//! oneshot waiter and awaits it outside the lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

/// Hard ceiling on the global cap, regardless of configuration.
pub const ABSOLUTE_MAX_PERMITS: usize = 100;

/// Governor errors.
#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("permit wait for '{worker_type}' timed out after {waited:?}")]
    Timeout {
        worker_type: String,
        waited: Duration,
    },

    #[error("protective mode rejects worker type '{worker_type}'")]
    Rejected { worker_type: String },
}

/// Governor tuning.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Global cap; clamped to [`ABSOLUTE_MAX_PERMITS`].
    pub max_global: usize,
    /// Static per-type caps. Types not listed get `default_type_cap`.
    pub type_caps: HashMap<String, usize>,
    pub default_type_cap: usize,
    /// Adaptive scaling never goes below this.
    pub min_worker_concurrency: usize,
    /// Worker types refused outright while protective mode is engaged.
    pub reject_in_protective: Vec<String>,
    pub scale_up_factor: f64,
    pub scale_down_factor: f64,
    pub cpu_scale_down_pct: f32,
    pub cpu_scale_up_pct: f32,
    pub memory_scale_down_pct: f32,
    pub memory_scale_up_pct: f32,
    pub adaptive_interval: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_global: ABSOLUTE_MAX_PERMITS,
            type_caps: HashMap::new(),
            default_type_cap: 10,
            min_worker_concurrency: 1,
            reject_in_protective: Vec::new(),
            scale_up_factor: 1.3,
            scale_down_factor: 0.7,
            cpu_scale_down_pct: 90.0,
            cpu_scale_up_pct: 75.0,
            memory_scale_down_pct: 90.0,
            memory_scale_up_pct: 80.0,
            adaptive_interval: Duration::from_secs(10),
        }
    }
}

struct Waiter {
    id: u64,
    priority: i32,
    seq: u64,
    tx: oneshot::Sender<()>,
}

struct TypeState {
    static_cap: usize,
    /// Cap after adaptive scaling; protective halving applies on top.
    effective_cap: usize,
    outstanding: usize,
    waiters: VecDeque<Waiter>,
}

struct GovState {
    outstanding_total: usize,
    types: HashMap<String, TypeState>,
    protective: bool,
}

/// The governor. One per process, created at startup and passed to every
/// managed worker as an explicit dependency.
pub struct Governor {
    config: GovernorConfig,
    state: Mutex<GovState>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

/// An admission to the permit pool. Release is idempotent and runs on
/// drop, so a cancelled or panicking job can never leak capacity.
pub struct Permit {
    governor: Arc<Governor>,
    worker_type: String,
    released: AtomicBool,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("worker_type", &self.worker_type)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl Permit {
    /// Return the permit to the pool. Safe to call more than once.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.governor.release_internal(&self.worker_type);
        }
    }

    #[must_use]
    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GovernorStats {
    pub outstanding_total: usize,
    pub max_global: usize,
    pub protective: bool,
    pub per_type: Vec<TypeStats>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TypeStats {
    pub worker_type: String,
    pub outstanding: usize,
    pub effective_cap: usize,
    pub waiting: usize,
}

impl Governor {
    #[must_use]
    pub fn new(mut config: GovernorConfig) -> Arc<Self> {
        config.max_global = config.max_global.min(ABSOLUTE_MAX_PERMITS).max(1);
        Arc::new(Self {
            config,
            state: Mutex::new(GovState {
                outstanding_total: 0,
                types: HashMap::new(),
                protective: false,
            }),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn max_global(&self) -> usize {
        self.config.max_global
    }

    /// Acquire a permit for `worker_type`, waiting at most `timeout`.
    pub async fn acquire(
        self: &Arc<Self>,
        worker_type: &str,
        priority: i32,
        timeout: Duration,
    ) -> Result<Permit, GovernorError> {
        let (waiter_id, rx) = {
            let mut state = self.lock();
            if state.protective
                && self
                    .config
                    .reject_in_protective
                    .iter()
                    .any(|t| t == worker_type)
            {
                return Err(GovernorError::Rejected {
                    worker_type: worker_type.to_string(),
                });
            }

            self.ensure_type(&mut state, worker_type);
            if self.can_grant(&state, worker_type) {
                self.grant_direct(&mut state, worker_type);
                return Ok(self.permit(worker_type));
            }

            let (tx, rx) = oneshot::channel();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            state
                .types
                .get_mut(worker_type)
                .expect("type ensured above")
                .waiters
                .push_back(Waiter {
                    id,
                    priority,
                    seq,
                    tx,
                });
            (id, rx)
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(self.permit(worker_type)),
            // Sender dropped can only mean the governor went away.
            Ok(Err(_)) => Err(GovernorError::Timeout {
                worker_type: worker_type.to_string(),
                waited: timeout,
            }),
            Err(_) => {
                let mut state = self.lock();
                let still_queued = state
                    .types
                    .get_mut(worker_type)
                    .map(|ts| {
                        let before = ts.waiters.len();
                        ts.waiters.retain(|w| w.id != waiter_id);
                        ts.waiters.len() != before
                    })
                    .unwrap_or(false);
                drop(state);
                if still_queued {
                    Err(GovernorError::Timeout {
                        worker_type: worker_type.to_string(),
                        waited: timeout,
                    })
                } else {
                    // Granted in the race window between timeout and lock:
                    // the permit is ours, counts already reflect it.
                    Ok(self.permit(worker_type))
                }
            }
        }
    }

    /// Engage or release protective mode (multiple breakers OPEN). While
    /// engaged, per-type caps are halved and listed types are refused.
    pub fn set_protective(&self, engaged: bool) {
        let mut state = self.lock();
        if state.protective != engaged {
            tracing::warn!(engaged, "governor protective mode changed");
            state.protective = engaged;
        }
        if !engaged {
            self.grant_waiters(&mut state);
        }
    }

    /// Feed a utilization sample into adaptive cap scaling. Factored out
    /// of the sampling task so tests can drive it directly.
    pub fn apply_utilization(&self, cpu_pct: f32, memory_pct: f32) {
        let scale = if cpu_pct >= self.config.cpu_scale_down_pct
            || memory_pct >= self.config.memory_scale_down_pct
        {
            Some(self.config.scale_down_factor)
        } else if cpu_pct <= self.config.cpu_scale_up_pct
            && memory_pct <= self.config.memory_scale_up_pct
        {
            Some(self.config.scale_up_factor)
        } else {
            None
        };
        let Some(factor) = scale else { return };

        let mut state = self.lock();
        for ts in state.types.values_mut() {
            let scaled = (ts.effective_cap as f64) * factor;
            // Scale-up rounds upward so a cap of 1 can actually recover.
            let scaled = if factor > 1.0 {
                scaled.ceil() as usize
            } else {
                scaled.round() as usize
            };
            ts.effective_cap = scaled
                .max(self.config.min_worker_concurrency)
                .min(ts.static_cap);
        }
        if factor > 1.0 {
            self.grant_waiters(&mut state);
        }
    }

    /// The cap a worker of this type should currently shape itself to.
    #[must_use]
    pub fn effective_cap(&self, worker_type: &str) -> usize {
        let mut state = self.lock();
        self.ensure_type(&mut state, worker_type);
        let ts = &state.types[worker_type];
        current_cap(ts, state.protective)
    }

    #[must_use]
    pub fn stats(&self) -> GovernorStats {
        let state = self.lock();
        let mut per_type: Vec<TypeStats> = state
            .types
            .iter()
            .map(|(name, ts)| TypeStats {
                worker_type: name.clone(),
                outstanding: ts.outstanding,
                effective_cap: current_cap(ts, state.protective),
                waiting: ts.waiters.len(),
            })
            .collect();
        per_type.sort_by(|a, b| a.worker_type.cmp(&b.worker_type));
        GovernorStats {
            outstanding_total: state.outstanding_total,
            max_global: self.config.max_global,
            protective: state.protective,
            per_type,
        }
    }

    /// Run the adaptive sampling loop until `shutdown` resolves. Samples
    /// process CPU and memory via sysinfo on the configured interval.
    pub async fn run_adaptive(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut system = sysinfo::System::new();
        let mut interval = tokio::time::interval(self.config.adaptive_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    system.refresh_cpu_usage();
                    system.refresh_memory();
                    let cpu = system.global_cpu_usage();
                    let total = system.total_memory();
                    let memory = if total == 0 {
                        0.0
                    } else {
                        (system.used_memory() as f32 / total as f32) * 100.0
                    };
                    tracing::debug!(cpu, memory, "adaptive utilization sample");
                    self.apply_utilization(cpu, memory);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // ── internals ──────────────────────────────────────────────────────

    fn permit(self: &Arc<Self>, worker_type: &str) -> Permit {
        Permit {
            governor: Arc::clone(self),
            worker_type: worker_type.to_string(),
            released: AtomicBool::new(false),
        }
    }

    fn ensure_type(&self, state: &mut GovState, worker_type: &str) {
        if !state.types.contains_key(worker_type) {
            let static_cap = self
                .config
                .type_caps
                .get(worker_type)
                .copied()
                .unwrap_or(self.config.default_type_cap)
                .max(1);
            state.types.insert(
                worker_type.to_string(),
                TypeState {
                    static_cap,
                    effective_cap: static_cap,
                    outstanding: 0,
                    waiters: VecDeque::new(),
                },
            );
        }
    }

    fn can_grant(&self, state: &GovState, worker_type: &str) -> bool {
        if state.outstanding_total >= self.config.max_global {
            return false;
        }
        let ts = &state.types[worker_type];
        ts.outstanding < current_cap(ts, state.protective)
    }

    fn grant_direct(&self, state: &mut GovState, worker_type: &str) {
        state.outstanding_total += 1;
        state
            .types
            .get_mut(worker_type)
            .expect("type ensured")
            .outstanding += 1;
    }

    fn release_internal(&self, worker_type: &str) {
        let mut state = self.lock();
        state.outstanding_total = state.outstanding_total.saturating_sub(1);
        if let Some(ts) = state.types.get_mut(worker_type) {
            ts.outstanding = ts.outstanding.saturating_sub(1);
        }
        self.grant_waiters(&mut state);
    }

    /// Admit as many queued waiters as capacity allows. Within a type the
    /// queue is FIFO; across types the head waiter with the highest
    /// priority (then earliest arrival) wins each slot.
    fn grant_waiters(&self, state: &mut GovState) {
        loop {
            if state.outstanding_total >= self.config.max_global {
                return;
            }
            let protective = state.protective;
            let candidate = state
                .types
                .iter()
                .filter(|(_, ts)| {
                    !ts.waiters.is_empty() && ts.outstanding < current_cap(ts, protective)
                })
                .map(|(name, ts)| {
                    let head = ts.waiters.front().expect("non-empty checked");
                    (name.clone(), head.priority, head.seq)
                })
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.2.cmp(&a.2)));

            let Some((name, _, _)) = candidate else { return };
            let ts = state.types.get_mut(&name).expect("candidate exists");
            let waiter = ts.waiters.pop_front().expect("candidate non-empty");
            ts.outstanding += 1;
            state.outstanding_total += 1;
            if waiter.tx.send(()).is_err() {
                // Receiver gave up (timeout raced the grant and removed
                // itself: or dropped the future). Take the slot back.
                let ts = state.types.get_mut(&name).expect("still exists");
                ts.outstanding = ts.outstanding.saturating_sub(1);
                state.outstanding_total -= 1;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GovState> {
        self.state.lock().expect("governor mutex poisoned")
    }
}

fn current_cap(ts: &TypeState, protective: bool) -> usize {
    if protective {
        (ts.effective_cap / 2).max(1)
    } else {
        ts.effective_cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(max_global: usize, caps: &[(&str, usize)]) -> Arc<Governor> {
        let mut type_caps = HashMap::new();
        for (name, cap) in caps {
            type_caps.insert((*name).to_string(), *cap);
        }
        Governor::new(GovernorConfig {
            max_global,
            type_caps,
            ..GovernorConfig::default()
        })
    }

    #[tokio::test]
    async fn global_cap_is_hard_capped_at_one_hundred() {
        let gov = Governor::new(GovernorConfig {
            max_global: 500,
            ..GovernorConfig::default()
        });
        assert_eq!(gov.max_global(), 100);
    }

    #[tokio::test]
    async fn grants_up_to_type_cap_then_queues() {
        let gov = governor(10, &[("file-analysis", 2)]);
        let a = gov
            .acquire("file-analysis", 0, Duration::from_millis(10))
            .await
            .unwrap();
        let _b = gov
            .acquire("file-analysis", 0, Duration::from_millis(10))
            .await
            .unwrap();

        let err = gov
            .acquire("file-analysis", 0, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, GovernorError::Timeout { .. }));

        a.release();
        gov.acquire("file-analysis", 0, Duration::from_millis(20))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn global_cap_is_authoritative_over_type_caps() {
        // Type caps sum to 4, global allows 2.
        let gov = governor(2, &[("a", 2), ("b", 2)]);
        let _p1 = gov.acquire("a", 0, Duration::from_millis(10)).await.unwrap();
        let _p2 = gov.acquire("b", 0, Duration::from_millis(10)).await.unwrap();
        let err = gov.acquire("a", 0, Duration::from_millis(20)).await;
        assert!(err.is_err());
        assert_eq!(gov.stats().outstanding_total, 2);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let gov = governor(2, &[("a", 2)]);
        let p = gov.acquire("a", 0, Duration::from_millis(10)).await.unwrap();
        p.release();
        p.release();
        assert_eq!(gov.stats().outstanding_total, 0);
        // Double release never un-counts somebody else's permit.
        let _q = gov.acquire("a", 0, Duration::from_millis(10)).await.unwrap();
        p.release();
        assert_eq!(gov.stats().outstanding_total, 1);
    }

    #[tokio::test]
    async fn waiters_wake_in_priority_then_fifo_order() {
        let gov = governor(1, &[("a", 1), ("b", 1)]);
        let first = gov.acquire("a", 0, Duration::from_millis(10)).await.unwrap();

        let gov2 = Arc::clone(&gov);
        let low = tokio::spawn(async move {
            gov2.acquire("a", 1, Duration::from_secs(5)).await.map(|p| {
                let t = std::time::Instant::now();
                drop(p);
                t
            })
        });
        // Give the low-priority waiter time to enqueue first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let gov3 = Arc::clone(&gov);
        let high = tokio::spawn(async move {
            gov3.acquire("b", 9, Duration::from_secs(5)).await.map(|p| {
                let t = std::time::Instant::now();
                drop(p);
                t
            })
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        first.release();
        let high_at = high.await.unwrap().unwrap();
        let low_at = low.await.unwrap().unwrap();
        assert!(high_at <= low_at, "higher priority should be admitted first");
    }

    #[tokio::test]
    async fn protective_mode_halves_caps_and_rejects_listed_types() {
        let gov = Governor::new(GovernorConfig {
            max_global: 100,
            type_caps: HashMap::from([
                ("file-analysis".to_string(), 8),
                ("directory-aggregation".to_string(), 4),
            ]),
            reject_in_protective: vec!["directory-aggregation".to_string()],
            ..GovernorConfig::default()
        });

        assert_eq!(gov.effective_cap("file-analysis"), 8);
        gov.set_protective(true);
        assert_eq!(gov.effective_cap("file-analysis"), 4);

        let err = gov
            .acquire("directory-aggregation", 0, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, GovernorError::Rejected { .. }));

        gov.set_protective(false);
        assert_eq!(gov.effective_cap("file-analysis"), 8);
        gov.acquire("directory-aggregation", 0, Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn adaptive_scaling_respects_floor_and_static_cap() {
        let gov = governor(100, &[("a", 10)]);
        assert_eq!(gov.effective_cap("a"), 10);

        // High CPU scales down repeatedly, but never below the floor.
        for _ in 0..10 {
            gov.apply_utilization(95.0, 50.0);
        }
        assert_eq!(gov.effective_cap("a"), 1);

        // Calm samples scale back up, but never beyond the static cap.
        for _ in 0..10 {
            gov.apply_utilization(10.0, 10.0);
        }
        assert_eq!(gov.effective_cap("a"), 10);

        // Between the watermarks nothing changes.
        gov.apply_utilization(80.0, 85.0);
        assert_eq!(gov.effective_cap("a"), 10);
    }

    #[tokio::test]
    async fn pool_never_exceeds_global_cap_under_load() {
        use std::sync::atomic::AtomicUsize;
        let gov = governor(10, &[("a", 10), ("b", 10)]);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..200 {
            let gov = Arc::clone(&gov);
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let worker_type = if i % 2 == 0 { "a" } else { "b" };
            handles.push(tokio::spawn(async move {
                let Ok(permit) = gov
                    .acquire(worker_type, 0, Duration::from_secs(10))
                    .await
                else {
                    return;
                };
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                permit.release();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 10);
        assert_eq!(gov.stats().outstanding_total, 0);
    }
}
