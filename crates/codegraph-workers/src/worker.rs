//! The managed worker wrapper.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::Instant;

use codegraph_breaker::CircuitBreaker;
use codegraph_governor::{Governor, GovernorError};
use codegraph_queue::{Job, JobQueue};
use codegraph_store::Store;
use codegraph_types::{ErrorEvent, FailureKind, RunId, WorkerType};

/// Per-worker operational settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_type: WorkerType,
    /// Hard per-job deadline; also the permit-wait budget.
    pub job_timeout: Duration,
    /// Base requeue delay; doubles per attempt with ±20% jitter.
    pub retry_delay: Duration,
    /// Reservation wait per loop lap; doubles as the cap-reshaping
    /// heartbeat.
    pub heartbeat: Duration,
}

impl WorkerConfig {
    #[must_use]
    pub fn new(worker_type: WorkerType) -> Self {
        Self {
            worker_type,
            job_timeout: Duration::from_secs(120),
            retry_delay: Duration::from_secs(1),
            heartbeat: Duration::from_secs(5),
        }
    }
}

/// One queue's job semantics.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Process one job. Outputs go through the store; the return value
    /// only states success or a tagged failure.
    async fn handle(&self, job: &Job) -> Result<(), FailureKind>;
}

/// Wraps a handler with permits, breaker, deadline, retry, and metrics.
pub struct ManagedWorker<H: JobHandler> {
    handler: Arc<H>,
    queue: Arc<JobQueue>,
    governor: Arc<Governor>,
    breaker: Arc<CircuitBreaker>,
    store: Arc<Store>,
    config: WorkerConfig,
}

impl<H: JobHandler> ManagedWorker<H> {
    pub fn new(
        handler: H,
        queue: Arc<JobQueue>,
        governor: Arc<Governor>,
        breaker: Arc<CircuitBreaker>,
        store: Arc<Store>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Arc::new(handler),
            queue,
            governor,
            breaker,
            store,
            config,
        })
    }

    /// Run until `shutdown` flips true, then drain in-flight jobs.
    ///
    /// Each heartbeat the worker re-reads its effective cap from the
    /// governor and reshapes reservation parallelism to match, so
    /// adaptive scaling and protective mode take hold without restarts.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let worker_id = format!("{}", self.config.worker_type);
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            // Opportunistically reap finished jobs without blocking.
            while in_flight.try_join_next().is_some() {}

            let cap = self.governor.effective_cap(&worker_id);
            let slots = cap.saturating_sub(in_flight.len());
            if slots == 0 {
                tokio::select! {
                    _ = in_flight.join_next() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let reserved = tokio::select! {
                reserved = self.queue.reserve(&worker_id, slots, self.config.heartbeat) => reserved,
                _ = shutdown.changed() => continue,
            };
            let jobs = match reserved {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::error!(worker = %worker_id, error = %e, "reservation failed");
                    tokio::time::sleep(self.config.heartbeat).await;
                    continue;
                }
            };

            for job in jobs {
                let this = Arc::clone(&self);
                in_flight.spawn(async move {
                    this.process_job(job).await;
                });
            }
        }

        // Graceful drain; the supervisor bounds total shutdown time.
        while in_flight.join_next().await.is_some() {}
    }

    /// The per-job algorithm: permit → breaker-wrapped handler under a
    /// hard deadline → complete, requeue with backoff, or fail.
    pub async fn process_job(&self, job: Job) {
        let started = Instant::now();
        let worker_type = self.config.worker_type;
        let type_key = worker_type.to_string();

        let permit = match self
            .governor
            .acquire(&type_key, job.priority, self.config.job_timeout)
            .await
        {
            Ok(permit) => permit,
            Err(e) => {
                // No capacity is not a job failure; back off and retry.
                tracing::debug!(job_id = %job.id, error = %e, "permit unavailable");
                let retryable = matches!(e, GovernorError::Timeout { .. })
                    || matches!(e, GovernorError::Rejected { .. });
                if retryable && job.attempt < job.max_attempts {
                    let _ = self.queue.requeue(&job.id, self.backoff_delay(&job));
                } else {
                    self.fail_terminally(
                        &job,
                        FailureKind::System(format!("permit unavailable: {e}")),
                        started.elapsed(),
                    );
                }
                return;
            }
        };

        let handler = Arc::clone(&self.handler);
        let job_for_handler = job.clone();
        let outcome = tokio::time::timeout(
            self.config.job_timeout,
            self.breaker
                .execute(move || async move { handler.handle(&job_for_handler).await }),
        )
        .await;

        // Permit returns to the pool before any requeue, so a retried job
        // cannot double-count against the global cap.
        permit.release();

        let duration = started.elapsed();
        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = self.queue.complete(&job.id) {
                    tracing::error!(job_id = %job.id, error = %e, "completion failed");
                }
                if let Some(run_id) = job_run_id(&job) {
                    let _ = self.store.record_job_completed(&run_id);
                }
                tracing::debug!(
                    worker = %type_key,
                    job_id = %job.id,
                    duration_ms = duration.as_millis() as u64,
                    "job complete"
                );
            }
            Ok(Err(kind)) => self.handle_failure(&job, kind, duration),
            Err(_) => self.handle_failure(
                &job,
                FailureKind::Timeout(self.config.job_timeout),
                duration,
            ),
        }
    }

    fn handle_failure(&self, job: &Job, kind: FailureKind, duration: Duration) {
        if kind.is_retryable() && job.attempt < job.max_attempts {
            // Rate limits carry the provider's own backoff; exponential
            // growth is for failures with no better signal.
            let delay = match &kind {
                FailureKind::RateLimited {
                    retry_after_ms: Some(ms),
                } => Duration::from_millis(*ms),
                _ => self.backoff_delay(job),
            };
            tracing::warn!(
                worker = %self.config.worker_type,
                job_id = %job.id,
                attempt = job.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %kind,
                "retryable failure, requeueing"
            );
            if let Err(e) = self.queue.requeue(&job.id, delay) {
                tracing::error!(job_id = %job.id, error = %e, "requeue failed");
            }
        } else {
            self.fail_terminally(job, kind, duration);
        }
    }

    fn fail_terminally(&self, job: &Job, kind: FailureKind, duration: Duration) {
        let run_id = job_run_id(job).unwrap_or_else(|| RunId::from_string("unknown"));
        let event = ErrorEvent::new(
            run_id.clone(),
            self.config.worker_type,
            job.id.clone(),
            kind.clone(),
            duration,
            job.attempt,
        );
        tracing::error!(
            worker = %self.config.worker_type,
            job_id = %job.id,
            correlation_id = %event.correlation_id,
            category = %kind.category(),
            severity = %kind.severity(),
            error = %kind,
            "job failed terminally"
        );
        if let Err(e) = self.queue.fail(&job.id, &kind.to_string()) {
            tracing::error!(job_id = %job.id, error = %e, "fail-marking failed");
        }
        let _ = self.store.record_job_failed(&run_id);
    }

    /// `retryDelay · 2^attempt`, jittered ±20%. The base comes from the
    /// job's enqueue-time backoff option, falling back to worker config.
    fn backoff_delay(&self, job: &Job) -> Duration {
        let base = if job.backoff_ms > 0 {
            Duration::from_millis(job.backoff_ms)
        } else {
            self.config.retry_delay
        };
        let delay = base.saturating_mul(2u32.saturating_pow(job.attempt.min(16)));
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        delay.mul_f64(jitter)
    }
}

/// Every pipeline payload carries its run id at the top level.
fn job_run_id(job: &Job) -> Option<RunId> {
    job.payload
        .get("run_id")
        .and_then(|v| v.as_str())
        .map(RunId::from_string)
}
