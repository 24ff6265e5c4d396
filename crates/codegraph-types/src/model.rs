//! Core entities: runs, files, POIs, relationships, evidence, and outbox rows.
//!
//! All derived records carry the [`RunId`] of the analysis invocation that
//! produced them; cleanup is by run. Enum wire forms match the persisted
//! string forms exactly (lowercase for POI kinds, SCREAMING_SNAKE_CASE for
//! relationship kinds and statuses), so a round-trip through the store or an
//! outbox payload never re-spells a value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Queue fed by the discovery agent; one job per accepted file.
pub const QUEUE_FILE_ANALYSIS: &str = "file-analysis";
/// Queue for directory-scoped relationship resolution jobs.
pub const QUEUE_DIRECTORY_RESOLUTION: &str = "directory-resolution";
/// Queue for directory summary aggregation jobs.
pub const QUEUE_DIRECTORY_AGGREGATION: &str = "directory-aggregation";
/// Queue for file-scoped relationship resolution jobs.
pub const QUEUE_RELATIONSHIP_RESOLUTION: &str = "relationship-resolution";
/// Queue for POI validation and semantic-id backfill jobs.
pub const QUEUE_VALIDATION: &str = "validation";
/// Queue for per-fingerprint evidence reconciliation jobs.
pub const QUEUE_RECONCILIATION: &str = "reconciliation";
/// Queue for reconciled-relationship batches bound for the graph store.
pub const QUEUE_GRAPH_INGESTION: &str = "graph-ingestion";

/// Every queue the pipeline owns, in rough upstream-to-downstream order.
///
/// Quiescence and deadlock detection iterate this list; adding a queue
/// without registering it here would exempt it from both.
pub const PIPELINE_QUEUES: [&str; 7] = [
    QUEUE_FILE_ANALYSIS,
    QUEUE_DIRECTORY_RESOLUTION,
    QUEUE_DIRECTORY_AGGREGATION,
    QUEUE_RELATIONSHIP_RESOLUTION,
    QUEUE_VALIDATION,
    QUEUE_RECONCILIATION,
    QUEUE_GRAPH_INGESTION,
];

/// Globally-unique identifier for one analysis invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Adopt an externally-supplied run id (e.g. `RUN_ID_OVERRIDE`).
    #[must_use]
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker types known to the governor and the managed-worker layer.
///
/// The string form doubles as the governor's sub-cap key and the queue name
/// the worker reserves from (except `RelationshipResolution`, which serves
/// both the file-level and the directory-level resolution queues).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum WorkerType {
    FileAnalysis,
    DirectoryAggregation,
    RelationshipResolution,
    Validation,
    Reconciliation,
    GraphIngestion,
}

/// Processing status of a discovered file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processed,
    Failed,
}

/// A file accepted by discovery, keyed by content hash for unchanged-skip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub run_id: RunId,
    pub path: String,
    pub content_hash: String,
    pub status: FileStatus,
}

/// Kind of a Point of Interest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PoiKind {
    Function,
    Class,
    Method,
    Property,
    Variable,
    Constant,
    Import,
    Export,
    Interface,
    Enum,
    Type,
}

/// A named code element extracted from a file.
///
/// Uniqueness within a run: `(run, semantic_id)` and
/// `(run, file, name, kind, start_line)`. The semantic id may be empty until
/// the validation worker backfills it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poi {
    pub id: i64,
    pub run_id: RunId,
    pub file_id: i64,
    pub file_path: String,
    pub name: String,
    pub kind: PoiKind,
    pub start_line: u32,
    pub end_line: u32,
    pub description: String,
    pub exported: bool,
    pub semantic_id: String,
}

/// Kind of a relationship edge between two POIs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipKind {
    Calls,
    Uses,
    Imports,
    Inherits,
    Composes,
    UsesConfig,
}

/// Lifecycle status of a relationship. Terminal states are final for the run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipStatus {
    Pending,
    Validated,
    Discarded,
}

impl RelationshipStatus {
    /// Whether this status is terminal. Terminal statuses are monotone:
    /// later evidence must not re-open them.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, RelationshipStatus::Pending)
    }
}

/// Scope at which a relationship was resolved. Ordered: later, wider
/// resolutions overwrite narrower ones (`file < directory < global`).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResolutionLevel {
    File,
    Directory,
    Global,
}

/// A candidate edge in the knowledge graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: i64,
    pub run_id: RunId,
    pub source_poi_id: i64,
    pub target_poi_id: i64,
    pub kind: RelationshipKind,
    pub fingerprint: String,
    pub confidence: f64,
    pub status: RelationshipStatus,
    pub resolution_level: ResolutionLevel,
}

/// Stable hash of `(from, to, kind)` used to aggregate evidence for a single
/// logical relationship, regardless of which observation produced it.
///
/// `from` and `to` are semantic ids. The hex form is truncated to 16 chars;
/// at pipeline scale (tens of thousands of edges per run) collisions are not
/// a practical concern and the short form keeps queue payloads readable.
#[must_use]
pub fn relationship_fingerprint(from: &str, to: &str, kind: RelationshipKind) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(from.as_bytes());
    hasher.update(b"|");
    hasher.update(to.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.to_string().as_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

/// Per-relationship confidence factor breakdown carried on evidence payloads.
///
/// Reconciliation treats evidence uniformly; the breakdown exists for the
/// prompt-enhancement path that re-queries low-confidence edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactorBreakdown {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syntax: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_ref: Option<f64>,
}

/// One independent observation supporting (or undermining) a relationship.
///
/// Evidence is append-only until reconciliation and kept afterwards for
/// audit. `synthetic` observations (inferred rather than directly observed)
/// are down-weighted by the scorer when they carry no explicit confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePayload {
    pub from: String,
    pub to: String,
    pub kind: RelationshipKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub synthetic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factors: Option<FactorBreakdown>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub resolution_level: ResolutionLevel,
}

/// Aggregated LLM summary for one directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySummary {
    pub run_id: RunId,
    pub directory: String,
    pub summary: String,
    pub poi_count: u32,
}

/// Kinds of outbox events the pipeline produces.
///
/// Consumers read events of the same kind in id order; kinds interleave
/// freely with each other.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum OutboxEventKind {
    /// A file-analysis batch of POIs committed.
    PoiBatch,
    /// A directory summary committed.
    DirResolved,
    /// A batch of relationship evidence committed.
    RelEvidence,
}

/// Status of an outbox row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    InProgress,
    Processed,
    Failed,
}

/// A durable side-effect row, written in the same transaction as the
/// business data it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: i64,
    pub run_id: RunId,
    pub kind: OutboxEventKind,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
}

/// Rolling counters for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub jobs_created: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    pub deadlocked: bool,
}

impl RunStats {
    /// Failure rate across terminal jobs, in [0,1]. Zero until any job
    /// reaches a terminal state.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let terminal = self.jobs_completed + self.jobs_failed;
        if terminal == 0 {
            0.0
        } else {
            self.jobs_failed as f64 / terminal as f64
        }
    }
}
