//! Typed payloads for the pipeline's queue jobs.
//!
//! Payloads travel as JSON through the queue adapter. Handlers are
//! idempotent by construction: file analysis keys on `(run, file)`,
//! reconciliation on the relationship fingerprint: so at-least-once
//! delivery and outbox replay are safe.

use serde::{Deserialize, Serialize};

use crate::model::{ResolutionLevel, RunId};

/// Analyze one file and extract its POIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAnalysisJob {
    pub run_id: RunId,
    pub file_id: i64,
    pub path: String,
    pub content_hash: String,
}

/// Summarize one directory after its files' POIs have landed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryAggregationJob {
    pub run_id: RunId,
    pub directory: String,
}

/// Resolve relationships for a set of POIs at a given scope.
///
/// File-level jobs carry the POIs of one file; directory-level jobs carry
/// the POIs of a directory and travel on the `directory-resolution` queue.
/// Both are handled by the relationship-resolution worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipResolutionJob {
    pub run_id: RunId,
    /// File path or directory path, depending on `level`.
    pub scope: String,
    pub level: ResolutionLevel,
    pub poi_ids: Vec<i64>,
}

/// Validate POIs and backfill missing semantic ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationJob {
    pub run_id: RunId,
    pub file_id: i64,
    pub poi_ids: Vec<i64>,
}

/// Reconcile all evidence for one relationship fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationJob {
    pub run_id: RunId,
    pub fingerprint: String,
}

/// Write a batch of reconciled relationships to the external graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphIngestionJob {
    pub run_id: RunId,
    pub relationship_ids: Vec<i64>,
}

/// Union of all job payloads, tagged by queue semantics.
///
/// The queue adapter stores payloads as opaque JSON; this enum exists for
/// handlers that need to decode without knowing their queue name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "kebab-case")]
pub enum JobPayload {
    FileAnalysis(FileAnalysisJob),
    DirectoryAggregation(DirectoryAggregationJob),
    RelationshipResolution(RelationshipResolutionJob),
    Validation(ValidationJob),
    Reconciliation(ReconciliationJob),
    GraphIngestion(GraphIngestionJob),
}
