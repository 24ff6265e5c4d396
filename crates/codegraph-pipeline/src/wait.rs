//! The completion wait loop: quiescence, deadlock detection, the
//! failure-rate circuit, the absolute wait ceiling, and the memory guard.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use codegraph_queue::{ActiveLease, QueueRegistry};
use codegraph_store::Store;
use codegraph_types::RunId;

use crate::memory::{judge_memory, process_rss_mb, MemoryVerdict};

/// Tuning for one wait.
#[derive(Debug, Clone)]
pub struct WaitSettings {
    pub sample_interval: Duration,
    /// Consecutive all-idle samples required for quiescence.
    pub quiescence_samples: u32,
    /// Consecutive unchanged samples (with work active) that flag a
    /// deadlock.
    pub deadlock_samples: u32,
    pub max_wait: Duration,
    /// Rolling failure-rate threshold, applied after the first ten
    /// terminal jobs.
    pub failure_rate_limit: f64,
    pub memory_limit_mb: u64,
}

/// Why the wait ended.
#[derive(Debug)]
pub enum WaitOutcome {
    /// All queues drained and the outbox settled for K samples.
    Quiescent,
    /// Progress counters froze with work still active.
    Deadlocked(DeadlockDiagnostic),
    /// The absolute ceiling elapsed with work still outstanding.
    MaxWaitExceeded,
    /// More than the allowed share of terminal jobs failed.
    FailureRateExceeded { rate: f64 },
    /// The process crossed its memory ceiling.
    MemoryAbort { rss_mb: f64 },
}

/// What was stuck, recorded before aborting the wait.
#[derive(Debug, Clone, Serialize)]
pub struct DeadlockDiagnostic {
    pub unchanged_samples: u32,
    /// Active leases per queue, oldest first.
    pub queues: Vec<(String, Vec<ActiveLease>)>,
}

#[derive(PartialEq, Eq, Clone, Copy, Default)]
struct ProgressTuple {
    active: usize,
    waiting: usize,
    completed: usize,
    failed: usize,
}

/// Sample queue and outbox state until one of the exit conditions fires.
pub async fn wait_for_completion(
    queues: &Arc<QueueRegistry>,
    store: &Arc<Store>,
    run_id: &RunId,
    settings: &WaitSettings,
    mut on_sample: impl FnMut(),
) -> WaitOutcome {
    let started = tokio::time::Instant::now();
    let mut idle_streak = 0u32;
    let mut frozen_streak = 0u32;
    let mut last_tuple = ProgressTuple::default();
    let mut warned_memory = false;

    loop {
        tokio::time::sleep(settings.sample_interval).await;
        on_sample();

        let counts = match queues.counts() {
            Ok(counts) => counts,
            Err(e) => {
                tracing::error!(error = %e, "queue sampling failed");
                continue;
            }
        };
        let tuple = counts.iter().fold(ProgressTuple::default(), |acc, (_, c)| {
            ProgressTuple {
                active: acc.active + c.active,
                waiting: acc.waiting + c.waiting + c.delayed,
                completed: acc.completed + c.completed,
                failed: acc.failed + c.failed,
            }
        });
        let outbox_pending = store.pending_outbox_count().unwrap_or(u64::MAX);

        // Memory guard.
        if let Some(rss) = process_rss_mb() {
            match judge_memory(rss, settings.memory_limit_mb) {
                MemoryVerdict::Ok => warned_memory = false,
                MemoryVerdict::Warn => {
                    if !warned_memory {
                        tracing::warn!(rss_mb = rss, limit_mb = settings.memory_limit_mb, "memory above 80% of ceiling");
                        warned_memory = true;
                    }
                }
                MemoryVerdict::Abort => {
                    tracing::error!(rss_mb = rss, limit_mb = settings.memory_limit_mb, "memory ceiling exceeded");
                    return WaitOutcome::MemoryAbort { rss_mb: rss };
                }
            }
        }

        // Failure-rate circuit, after the first ten terminal jobs.
        if let Ok(stats) = store.run_stats(run_id) {
            let terminal = stats.jobs_completed + stats.jobs_failed;
            let rate = stats.failure_rate();
            if terminal > 10 && rate > settings.failure_rate_limit {
                tracing::error!(rate, terminal, "failure rate exceeded, aborting wait");
                return WaitOutcome::FailureRateExceeded { rate };
            }
        }

        // Quiescence: nothing outstanding anywhere, including the outbox.
        if tuple.active == 0 && tuple.waiting == 0 && outbox_pending == 0 {
            idle_streak += 1;
            if idle_streak >= settings.quiescence_samples {
                return WaitOutcome::Quiescent;
            }
        } else {
            idle_streak = 0;
        }

        // Deadlock: identical counters across samples with work active.
        if tuple == last_tuple && tuple.active > 0 {
            frozen_streak += 1;
            if frozen_streak >= settings.deadlock_samples {
                let mut diagnostic = DeadlockDiagnostic {
                    unchanged_samples: frozen_streak,
                    queues: Vec::new(),
                };
                for name in queues.queue_names() {
                    if let Some(queue) = queues.get(&name) {
                        if let Ok(leases) = queue.active_leases() {
                            if !leases.is_empty() {
                                diagnostic.queues.push((name, leases));
                            }
                        }
                    }
                }
                tracing::error!(samples = frozen_streak, "pipeline deadlock detected");
                return WaitOutcome::Deadlocked(diagnostic);
            }
        } else {
            frozen_streak = 0;
            last_tuple = tuple;
        }

        if started.elapsed() >= settings.max_wait {
            tracing::warn!("absolute wait ceiling reached");
            return WaitOutcome::MaxWaitExceeded;
        }
    }
}
