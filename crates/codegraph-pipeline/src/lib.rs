//! Pipeline supervisor.
//!
//! Owns a complete run: build the adapters, start the outbox publisher
//! and the managed workers, seed discovery, wait for quiescence (with
//! deadlock detection, a failure-rate circuit, and a memory guard),
//! build the external graph from validated relationships, and report.
//!
//! Every collaborator is an explicit dependency created here at startup
//! and handed to the components that need it: no globals, no cyclic
//! ownership. Workers, the publisher, and the monitors all stop through
//! one shared shutdown signal.

pub mod health;
pub mod memory;
pub mod probes;
pub mod status;
pub mod wait;

pub use health::{DependencyProbe, HealthMonitor, HealthStatus};
pub use status::{PipelinePhase, PipelineReport, PipelineSnapshot, StatusBoard};
pub use wait::{DeadlockDiagnostic, WaitOutcome, WaitSettings};

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use codegraph_breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker};
use codegraph_config::{Config, ConfigError};
use codegraph_discovery::{DiscoveryConfig, DiscoveryError, DiscoveryStats, FileDiscoveryAgent};
use codegraph_governor::{Governor, GovernorConfig};
use codegraph_graph::{GraphStore, InMemoryGraphStore};
use codegraph_identity::SemanticIdentityService;
use codegraph_llm::{HttpLlmBackend, LlmBackend, StubLlmBackend};
use codegraph_outbox::{OutboxConfig, OutboxPublisher};
use codegraph_queue::QueueRegistry;
use codegraph_reconcile::ConfidenceScorer;
use codegraph_store::{Store, StoreError};
use codegraph_types::{
    FileStatus, GraphIngestionJob, RelationshipStatus, RunId, WorkerType, PIPELINE_QUEUES,
    QUEUE_DIRECTORY_AGGREGATION, QUEUE_DIRECTORY_RESOLUTION, QUEUE_FILE_ANALYSIS,
    QUEUE_GRAPH_INGESTION, QUEUE_RECONCILIATION, QUEUE_RELATIONSHIP_RESOLUTION, QUEUE_VALIDATION,
};
use codegraph_workers::handlers::{
    DirectoryAggregationHandler, FileAnalysisHandler, GraphIngestionHandler, LlmParams,
    ReconciliationHandler, RelationshipResolutionHandler, ValidationHandler,
};
use codegraph_workers::{JobHandler, ManagedWorker, WorkerConfig};

/// Fatal initialization errors. Runtime degradations (deadlock, failure
/// rate, memory) end in a report with `success = false` instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("initialization failed: {0}")]
    Init(String),
}

/// The supervisor. Collaborator overrides exist for deployments that
/// bind a real graph driver or a different LLM provider, and for tests.
pub struct PipelineSupervisor {
    config: Config,
    llm_override: Option<Arc<dyn LlmBackend>>,
    graph_override: Option<Arc<dyn GraphStore>>,
}

impl PipelineSupervisor {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            llm_override: None,
            graph_override: None,
        }
    }

    #[must_use]
    pub fn with_llm(mut self, llm: Arc<dyn LlmBackend>) -> Self {
        self.llm_override = Some(llm);
        self
    }

    #[must_use]
    pub fn with_graph(mut self, graph: Arc<dyn GraphStore>) -> Self {
        self.graph_override = Some(graph);
        self
    }

    /// Run the pipeline to completion.
    pub async fn run(self) -> Result<PipelineReport, PipelineError> {
        let started = std::time::Instant::now();
        let config = self.config;
        config.validate()?;

        let run_id = match &config.pipeline.run_id_override {
            Some(id) => RunId::from_string(id.clone()),
            None => RunId::generate(),
        };
        tracing::info!(run_id = %run_id, target = %config.pipeline.target_dir, "pipeline starting");

        // ── adapters ──────────────────────────────────────────────────
        let data_dir = config.pipeline.data_dir.clone();
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| PipelineError::Init(format!("data dir {data_dir}: {e}")))?;
        let store = Arc::new(Store::open(data_dir.join("codegraph.db").as_std_path())?);

        let queues = Arc::new(QueueRegistry::new(
            &PIPELINE_QUEUES,
            Duration::from_secs(config.broker.stall_interval_secs),
            config.broker.retention_count,
            Duration::from_secs(config.broker.retention_age_secs),
        ));

        let governor = Governor::new(governor_config(&config));

        let llm_breaker = Arc::new(CircuitBreaker::new(breaker_config("llm", &config)));
        let graph_breaker = Arc::new(CircuitBreaker::with_classifier(
            breaker_config("graph", &config),
            codegraph_breaker::graph_classifier,
        ));
        let broker_breaker = Arc::new(CircuitBreaker::new(breaker_config("broker", &config)));
        let breakers = Arc::new(BreakerRegistry::new(vec![
            Arc::clone(&llm_breaker),
            Arc::clone(&graph_breaker),
            Arc::clone(&broker_breaker),
        ]));
        breakers.load_all(data_dir.as_std_path());

        let llm: Arc<dyn LlmBackend> = match self.llm_override {
            Some(llm) => llm,
            None if config.pipeline.test_mode => Arc::new(StubLlmBackend::new()),
            None => Arc::new(
                HttpLlmBackend::new(
                    config.llm.endpoint.clone(),
                    config.llm.api_key.clone(),
                    config.llm.model.clone(),
                    Duration::from_secs(config.llm.request_timeout_secs),
                )
                .map_err(|e| PipelineError::Init(e.to_string()))?,
            ),
        };
        let graph: Arc<dyn GraphStore> = match self.graph_override {
            Some(graph) => graph,
            None => Arc::new(InMemoryGraphStore::new()),
        };

        let identity = Arc::new(SemanticIdentityService::new());
        if config.pipeline.clear_previous_run {
            store.clear_run(&run_id)?;
        } else {
            identity.import_existing(store.semantic_ids(&run_id)?);
        }

        let board = Arc::new(StatusBoard::new(run_id.as_str()));
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

        // ── background services ───────────────────────────────────────
        let publisher = OutboxPublisher::new(
            Arc::clone(&store),
            Arc::clone(&queues),
            OutboxConfig {
                poll_interval: Duration::from_millis(config.outbox.poll_interval_ms),
                claim_batch_size: config.outbox.claim_batch_size,
                job_attempts: config.worker.retry_attempts,
                job_backoff_ms: config.worker.retry_delay_ms,
            },
        );
        tasks.push(tokio::spawn(publisher.run(shutdown_rx.clone())));

        if !config.pipeline.high_performance {
            tasks.push(tokio::spawn(
                Arc::clone(&governor).run_adaptive(shutdown_rx.clone()),
            ));
        }

        let monitor = Arc::new(HealthMonitor::new(
            vec![
                Arc::new(probes::StoreProbe {
                    store: Arc::clone(&store),
                }),
                Arc::new(probes::GraphProbe {
                    graph: Arc::clone(&graph),
                }),
                Arc::new(probes::BrokerProbe {
                    queues: Arc::clone(&queues),
                }),
            ],
            Duration::from_secs(15),
            Duration::from_secs(5),
        ));
        tasks.push(tokio::spawn(Arc::clone(&monitor).run(shutdown_rx.clone())));

        // Protective mode: engaged while two or more circuits are open.
        {
            let governor = Arc::clone(&governor);
            let breakers = Arc::clone(&breakers);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    governor.set_protective(breakers.open_count() >= 2);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }));
        }

        // ── workers ───────────────────────────────────────────────────
        let target_root = config.pipeline.target_dir.clone();
        let llm_params = LlmParams {
            model: config.llm.model.clone(),
            timeout: Duration::from_secs(config.llm.request_timeout_secs),
            max_tokens: config.llm.max_tokens,
            temperature: config.llm.temperature,
        };
        let scorer = ConfidenceScorer::new(config.reconcile.clone());

        let mut spawn_worker = |handler: WorkerSpec, queue_name: &str, breaker: &Arc<CircuitBreaker>| {
            let queue = queues.get(queue_name).expect("pipeline queue registered");
            let worker_config = WorkerConfig {
                worker_type: handler.worker_type(),
                job_timeout: Duration::from_secs(config.worker.job_timeout_secs),
                retry_delay: Duration::from_millis(config.worker.retry_delay_ms),
                heartbeat: Duration::from_secs(config.worker.heartbeat_secs),
            };
            let task = handler.spawn(
                queue,
                Arc::clone(&governor),
                Arc::clone(breaker),
                Arc::clone(&store),
                worker_config,
                shutdown_rx.clone(),
            );
            tasks.push(task);
        };

        spawn_worker(
            WorkerSpec::FileAnalysis(FileAnalysisHandler {
                store: Arc::clone(&store),
                llm: Arc::clone(&llm),
                identity: Arc::clone(&identity),
                target_root: target_root.clone(),
                params: llm_params.clone(),
            }),
            QUEUE_FILE_ANALYSIS,
            &llm_breaker,
        );
        spawn_worker(
            WorkerSpec::Validation(ValidationHandler {
                store: Arc::clone(&store),
                identity: Arc::clone(&identity),
            }),
            QUEUE_VALIDATION,
            &broker_breaker,
        );
        spawn_worker(
            WorkerSpec::DirectoryAggregation(DirectoryAggregationHandler {
                store: Arc::clone(&store),
                llm: Arc::clone(&llm),
                params: llm_params.clone(),
            }),
            QUEUE_DIRECTORY_AGGREGATION,
            &llm_breaker,
        );
        for queue_name in [QUEUE_RELATIONSHIP_RESOLUTION, QUEUE_DIRECTORY_RESOLUTION] {
            spawn_worker(
                WorkerSpec::RelationshipResolution(RelationshipResolutionHandler {
                    store: Arc::clone(&store),
                    llm: Arc::clone(&llm),
                    target_root: target_root.clone(),
                    params: llm_params.clone(),
                }),
                queue_name,
                &llm_breaker,
            );
        }
        spawn_worker(
            WorkerSpec::Reconciliation(ReconciliationHandler {
                store: Arc::clone(&store),
                scorer: scorer.clone(),
            }),
            QUEUE_RECONCILIATION,
            &broker_breaker,
        );
        spawn_worker(
            WorkerSpec::GraphIngestion(GraphIngestionHandler {
                store: Arc::clone(&store),
                graph: Arc::clone(&graph),
            }),
            QUEUE_GRAPH_INGESTION,
            &graph_breaker,
        );

        // ── discovery ─────────────────────────────────────────────────
        publish_phase(&board, &run_id, PipelinePhase::Discovery, &queues, &store);
        let analysis_queue = queues
            .get(QUEUE_FILE_ANALYSIS)
            .expect("file-analysis queue registered");
        let discovery_stats = {
            let agent =
                FileDiscoveryAgent::new(&store, &analysis_queue, discovery_config(&config))?;
            agent.discover(&run_id, &target_root)?
        };
        board.push_log(format!(
            "discovery: {} jobs, {} unchanged, {} filtered",
            discovery_stats.jobs_enqueued,
            discovery_stats.skipped_unchanged,
            discovery_stats.skipped_filtered
        ));

        // ── analysis wait ─────────────────────────────────────────────
        publish_phase(&board, &run_id, PipelinePhase::Analysis, &queues, &store);
        let wait_settings = wait_settings(&config);
        let outcome = wait::wait_for_completion(&queues, &store, &run_id, &wait_settings, || {
            publish_phase(&board, &run_id, PipelinePhase::Analysis, &queues, &store);
        })
        .await;

        let mut deadlocked = false;
        let mut memory_aborted = false;
        let mut proceed_to_graph = false;
        match outcome {
            WaitOutcome::Quiescent => proceed_to_graph = true,
            WaitOutcome::Deadlocked(diagnostic) => {
                deadlocked = true;
                store.mark_deadlocked(&run_id)?;
                match serde_json::to_string(&diagnostic) {
                    Ok(json) => tracing::error!(diagnostic = %json, "deadlock diagnostic"),
                    Err(_) => tracing::error!(?diagnostic, "deadlock diagnostic"),
                }
                board.push_log("deadlock detected; aborting analysis wait".to_string());
            }
            WaitOutcome::MaxWaitExceeded => {
                // Surrender to graph build with what completed, provided
                // the failure rate stayed acceptable.
                let rate = store.run_stats(&run_id)?.failure_rate();
                proceed_to_graph = rate < wait_settings.failure_rate_limit;
                board.push_log(format!(
                    "max wait exceeded (failure rate {:.1}%); {}",
                    rate * 100.0,
                    if proceed_to_graph {
                        "building graph from completed work"
                    } else {
                        "aborting"
                    }
                ));
            }
            WaitOutcome::FailureRateExceeded { rate } => {
                board.push_log(format!("failure rate {:.1}% exceeded limit", rate * 100.0));
            }
            WaitOutcome::MemoryAbort { rss_mb } => {
                memory_aborted = true;
                board.push_log(format!("memory ceiling exceeded at {rss_mb:.0} MB"));
            }
        }

        // ── graph build ───────────────────────────────────────────────
        let mut graph_built = false;
        if proceed_to_graph {
            publish_phase(&board, &run_id, PipelinePhase::GraphBuild, &queues, &store);
            let batches = enqueue_graph_jobs(&store, &queues, &run_id, &config)?;
            if batches > 0 {
                let outcome = wait::wait_for_completion(
                    &queues,
                    &store,
                    &run_id,
                    &wait_settings,
                    || {
                        publish_phase(&board, &run_id, PipelinePhase::GraphBuild, &queues, &store);
                    },
                )
                .await;
                graph_built = matches!(outcome, WaitOutcome::Quiescent);
            } else {
                graph_built = true;
            }
        }

        // ── shutdown ──────────────────────────────────────────────────
        let _ = shutdown_tx.send(true);
        let drain = drain_tasks(tasks);
        if tokio::time::timeout(
            Duration::from_secs(config.pipeline.shutdown_timeout_secs),
            drain,
        )
        .await
        .is_err()
        {
            tracing::warn!("shutdown timeout elapsed with tasks still running");
        }
        breakers.persist_all(data_dir.as_std_path());

        // ── report ────────────────────────────────────────────────────
        let success = graph_built && !deadlocked && !memory_aborted;
        let report = build_report(
            &store,
            &run_id,
            started.elapsed(),
            &discovery_stats,
            success,
            deadlocked,
            memory_aborted,
        )?;
        publish_phase(
            &board,
            &run_id,
            if success {
                PipelinePhase::Finished
            } else {
                PipelinePhase::Failed
            },
            &queues,
            &store,
        );
        write_report(&data_dir, &report);
        tracing::info!(run_id = %run_id, success, "pipeline finished");
        Ok(report)
    }
}

/// Await a set of join handles sequentially; used under an outer timeout.
async fn drain_tasks(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}

/// Handler dispatch for worker spawning. `ManagedWorker` is generic over
/// its handler, so each variant monomorphizes its own worker.
enum WorkerSpec {
    FileAnalysis(FileAnalysisHandler),
    Validation(ValidationHandler),
    DirectoryAggregation(DirectoryAggregationHandler),
    RelationshipResolution(RelationshipResolutionHandler),
    Reconciliation(ReconciliationHandler),
    GraphIngestion(GraphIngestionHandler),
}

impl WorkerSpec {
    fn worker_type(&self) -> WorkerType {
        match self {
            WorkerSpec::FileAnalysis(_) => WorkerType::FileAnalysis,
            WorkerSpec::Validation(_) => WorkerType::Validation,
            WorkerSpec::DirectoryAggregation(_) => WorkerType::DirectoryAggregation,
            WorkerSpec::RelationshipResolution(_) => WorkerType::RelationshipResolution,
            WorkerSpec::Reconciliation(_) => WorkerType::Reconciliation,
            WorkerSpec::GraphIngestion(_) => WorkerType::GraphIngestion,
        }
    }

    fn spawn(
        self,
        queue: Arc<codegraph_queue::JobQueue>,
        governor: Arc<Governor>,
        breaker: Arc<CircuitBreaker>,
        store: Arc<Store>,
        config: WorkerConfig,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        fn go<H: JobHandler>(
            handler: H,
            queue: Arc<codegraph_queue::JobQueue>,
            governor: Arc<Governor>,
            breaker: Arc<CircuitBreaker>,
            store: Arc<Store>,
            config: WorkerConfig,
            shutdown: tokio::sync::watch::Receiver<bool>,
        ) -> tokio::task::JoinHandle<()> {
            let worker = ManagedWorker::new(handler, queue, governor, breaker, store, config);
            tokio::spawn(worker.run(shutdown))
        }
        match self {
            WorkerSpec::FileAnalysis(h) => go(h, queue, governor, breaker, store, config, shutdown),
            WorkerSpec::Validation(h) => go(h, queue, governor, breaker, store, config, shutdown),
            WorkerSpec::DirectoryAggregation(h) => {
                go(h, queue, governor, breaker, store, config, shutdown)
            }
            WorkerSpec::RelationshipResolution(h) => {
                go(h, queue, governor, breaker, store, config, shutdown)
            }
            WorkerSpec::Reconciliation(h) => {
                go(h, queue, governor, breaker, store, config, shutdown)
            }
            WorkerSpec::GraphIngestion(h) => {
                go(h, queue, governor, breaker, store, config, shutdown)
            }
        }
    }
}

fn governor_config(config: &Config) -> GovernorConfig {
    GovernorConfig {
        max_global: config.concurrency.max_global,
        type_caps: config.concurrency.type_caps.clone().into_iter().collect(),
        default_type_cap: 10,
        min_worker_concurrency: config.concurrency.min_worker_concurrency,
        reject_in_protective: vec![QUEUE_DIRECTORY_AGGREGATION.to_string()],
        scale_up_factor: config.concurrency.scale_up_factor,
        scale_down_factor: config.concurrency.scale_down_factor,
        cpu_scale_down_pct: config.concurrency.cpu_scale_down_pct,
        cpu_scale_up_pct: config.concurrency.cpu_scale_up_pct,
        memory_scale_down_pct: config.concurrency.memory_scale_down_pct,
        memory_scale_up_pct: config.concurrency.memory_scale_up_pct,
        adaptive_interval: Duration::from_secs(config.concurrency.adaptive_interval_secs),
    }
}

fn breaker_config(name: &str, config: &Config) -> BreakerConfig {
    BreakerConfig {
        name: name.to_string(),
        failure_threshold: config.breaker.failure_threshold,
        reset_timeout: Duration::from_millis(config.breaker.reset_timeout_ms),
        base_retry_delay: Duration::from_millis(config.breaker.base_retry_delay_ms),
        max_retry_delay: Duration::from_millis(config.breaker.max_retry_delay_ms),
        retry_multiplier: config.breaker.retry_multiplier,
        partial_recovery_threshold: config.breaker.partial_recovery_threshold,
        partial_recovery_window: config.breaker.partial_recovery_window,
    }
}

fn discovery_config(config: &Config) -> DiscoveryConfig {
    DiscoveryConfig {
        allowed_extensions: config.discovery.allowed_extensions.clone(),
        denied_globs: config.discovery.denied_globs.clone(),
        max_file_size: config.discovery.max_file_size,
        job_attempts: config.worker.retry_attempts,
        job_backoff_ms: config.worker.retry_delay_ms,
    }
}

fn wait_settings(config: &Config) -> WaitSettings {
    WaitSettings {
        sample_interval: Duration::from_secs(config.pipeline.sample_interval_secs),
        quiescence_samples: config.pipeline.quiescence_samples,
        deadlock_samples: config.pipeline.deadlock_samples,
        max_wait: Duration::from_secs(config.pipeline.max_wait_secs),
        failure_rate_limit: 0.5,
        memory_limit_mb: config.pipeline.memory_limit_mb,
    }
}

fn publish_phase(
    board: &Arc<StatusBoard>,
    run_id: &RunId,
    phase: PipelinePhase,
    queues: &Arc<QueueRegistry>,
    store: &Arc<Store>,
) {
    let mut snapshot = PipelineSnapshot::initial(run_id.as_str());
    snapshot.phase = phase;
    snapshot.queues = queues.counts().unwrap_or_default();
    snapshot.outbox_pending = store.pending_outbox_count().unwrap_or(0);
    board.publish(snapshot);
}

/// Batch validated relationships into graph-ingestion jobs.
fn enqueue_graph_jobs(
    store: &Arc<Store>,
    queues: &Arc<QueueRegistry>,
    run_id: &RunId,
    config: &Config,
) -> Result<usize, PipelineError> {
    const BATCH: usize = 100;
    let validated = store.relationships_by_status(run_id, RelationshipStatus::Validated)?;
    if validated.is_empty() {
        return Ok(0);
    }
    let queue = queues
        .get(QUEUE_GRAPH_INGESTION)
        .ok_or_else(|| PipelineError::Init("graph-ingestion queue missing".to_string()))?;
    let mut batches = 0;
    for chunk in validated.chunks(BATCH) {
        let job = GraphIngestionJob {
            run_id: run_id.clone(),
            relationship_ids: chunk.iter().map(|r| r.id).collect(),
        };
        queue
            .enqueue(
                &job,
                codegraph_queue::JobOptions {
                    priority: 0,
                    max_attempts: config.worker.retry_attempts,
                    backoff_ms: config.worker.retry_delay_ms,
                },
            )
            .map_err(|e| PipelineError::Init(e.to_string()))?;
        batches += 1;
    }
    store.record_jobs_created(run_id, batches as u64)?;
    Ok(batches)
}

fn build_report(
    store: &Arc<Store>,
    run_id: &RunId,
    duration: Duration,
    discovery: &DiscoveryStats,
    success: bool,
    deadlocked: bool,
    memory_aborted: bool,
) -> Result<PipelineReport, PipelineError> {
    let stats = store.run_stats(run_id)?;
    Ok(PipelineReport {
        run_id: run_id.as_str().to_string(),
        success,
        duration_ms: duration.as_millis() as u64,
        files_discovered: store.file_count(run_id, None)?,
        files_processed: store.file_count(run_id, Some(FileStatus::Processed))?,
        files_failed: store.file_count(run_id, Some(FileStatus::Failed))?,
        pois_extracted: store.poi_count(run_id)?,
        relationships_validated: store
            .relationship_count_by_status(run_id, RelationshipStatus::Validated)?,
        relationships_discarded: store
            .relationship_count_by_status(run_id, RelationshipStatus::Discarded)?,
        deadlocked: deadlocked || stats.deadlocked,
        memory_aborted,
        failure_rate: stats.failure_rate(),
        jobs_completed: stats.jobs_completed,
        jobs_failed: stats.jobs_failed,
        by_extension: discovery.by_extension.clone(),
    })
}

/// Best-effort atomic write of `run-report.json` under the data dir.
fn write_report(data_dir: &Utf8PathBuf, report: &PipelineReport) {
    let write = || -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut temp = tempfile::NamedTempFile::new_in(data_dir.as_std_path())?;
        use std::io::Write;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(data_dir.join("run-report.json").as_std_path())
            .map_err(|e| e.error)?;
        Ok(())
    };
    if let Err(e) = write() {
        tracing::warn!(error = %e, "run report write failed");
    }
}
