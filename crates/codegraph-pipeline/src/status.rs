//! Status snapshots and the final report.
//!
//! The supervisor publishes snapshots through a watch channel; any status
//! surface (CLI progress, an HTTP/WebSocket layer) reads the latest one
//! without ever blocking the supervisor. A bounded ring of recent log
//! lines rides along for the "last N lines" view.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use codegraph_governor::GovernorStats;
use codegraph_queue::QueueCounts;

/// How many recent log lines a snapshot carries.
const LOG_RING_CAPACITY: usize = 50;

/// Pipeline phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelinePhase {
    Initializing,
    Discovery,
    Analysis,
    GraphBuild,
    Finished,
    Failed,
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelinePhase::Initializing => "initializing",
            PipelinePhase::Discovery => "discovery",
            PipelinePhase::Analysis => "analysis",
            PipelinePhase::GraphBuild => "graph-build",
            PipelinePhase::Finished => "finished",
            PipelinePhase::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time pipeline state, cheap to clone.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub run_id: String,
    pub phase: PipelinePhase,
    pub queues: Vec<(String, QueueCounts)>,
    pub outbox_pending: u64,
    pub governor: Option<GovernorStats>,
    pub breakers: Vec<(String, String)>,
    pub recent_log: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineSnapshot {
    #[must_use]
    pub fn initial(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase: PipelinePhase::Initializing,
            queues: Vec::new(),
            outbox_pending: 0,
            governor: None,
            breakers: Vec::new(),
            recent_log: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Publisher side of the status surface.
pub struct StatusBoard {
    tx: tokio::sync::watch::Sender<PipelineSnapshot>,
    log_ring: Mutex<VecDeque<String>>,
}

impl StatusBoard {
    #[must_use]
    pub fn new(run_id: &str) -> Self {
        let (tx, _) = tokio::sync::watch::channel(PipelineSnapshot::initial(run_id));
        Self {
            tx,
            log_ring: Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
        }
    }

    /// Non-blocking read handle for status consumers.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<PipelineSnapshot> {
        self.tx.subscribe()
    }

    /// Append a line to the bounded log ring.
    pub fn push_log(&self, line: impl Into<String>) {
        let mut ring = self.log_ring.lock().expect("log ring poisoned");
        if ring.len() >= LOG_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(line.into());
    }

    /// Publish a snapshot, stamping it with the current log ring.
    pub fn publish(&self, mut snapshot: PipelineSnapshot) {
        snapshot.recent_log = {
            let ring = self.log_ring.lock().expect("log ring poisoned");
            ring.iter().cloned().collect()
        };
        snapshot.updated_at = Utc::now();
        let _ = self.tx.send(snapshot);
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn latest(&self) -> PipelineSnapshot {
        self.tx.borrow().clone()
    }
}

/// The compact final report the CLI prints and the data directory keeps.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub success: bool,
    pub duration_ms: u64,
    pub files_discovered: u64,
    pub files_processed: u64,
    pub files_failed: u64,
    pub pois_extracted: u64,
    pub relationships_validated: u64,
    pub relationships_discarded: u64,
    pub deadlocked: bool,
    pub memory_aborted: bool,
    pub failure_rate: f64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub by_extension: std::collections::BTreeMap<String, u64>,
}

impl PipelineReport {
    /// Process exit code this report maps to.
    #[must_use]
    pub fn exit_code(&self) -> codegraph_types::ExitCode {
        if self.success {
            codegraph_types::ExitCode::SUCCESS
        } else if self.memory_aborted {
            codegraph_types::ExitCode::MEMORY_LIMIT
        } else {
            codegraph_types::ExitCode::FATAL
        }
    }

    /// One-paragraph human rendering for the CLI.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "run {run} {verdict} in {secs:.1}s | files: {fp}/{fd} processed ({ff} failed), \
             POIs: {pois}, relationships: {rv} validated / {rd} discarded, \
             jobs: {jc} completed / {jf} failed (failure rate {rate:.1}%){deadlock}{memory}",
            run = self.run_id,
            verdict = if self.success { "succeeded" } else { "FAILED" },
            secs = self.duration_ms as f64 / 1000.0,
            fp = self.files_processed,
            fd = self.files_discovered,
            ff = self.files_failed,
            pois = self.pois_extracted,
            rv = self.relationships_validated,
            rd = self.relationships_discarded,
            jc = self.jobs_completed,
            jf = self.jobs_failed,
            rate = self.failure_rate * 100.0,
            deadlock = if self.deadlocked { " [DEADLOCKED]" } else { "" },
            memory = if self.memory_aborted { " [MEMORY LIMIT]" } else { "" },
        )
    }
}
