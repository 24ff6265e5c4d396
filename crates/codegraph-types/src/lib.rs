//! Shared data model and failure taxonomy for the codegraph pipeline.
//!
//! Every crate in the workspace speaks the types defined here: runs, files,
//! POIs, relationships, evidence, outbox events, queue job payloads, and the
//! structured error events that flow out of workers. Keeping the model in a
//! leaf crate avoids back-pointers between the supervisor, workers, and
//! adapters: components reference rows by id, never by owner.

pub mod error;
pub mod exit_codes;
pub mod job;
pub mod model;

pub use error::{
    CodegraphError, ErrorCategory, ErrorEvent, FailureKind, Severity,
};
pub use exit_codes::ExitCode;
pub use job::{
    DirectoryAggregationJob, FileAnalysisJob, GraphIngestionJob, JobPayload,
    ReconciliationJob, RelationshipResolutionJob, ValidationJob,
};
pub use model::{
    relationship_fingerprint, DirectorySummary, EvidencePayload, FactorBreakdown, FileRecord,
    FileStatus, OutboxEvent, OutboxEventKind, OutboxStatus, Poi, PoiKind, Relationship,
    RelationshipKind, RelationshipStatus, ResolutionLevel, RunId, RunStats, WorkerType,
    PIPELINE_QUEUES, QUEUE_DIRECTORY_AGGREGATION, QUEUE_DIRECTORY_RESOLUTION,
    QUEUE_FILE_ANALYSIS, QUEUE_GRAPH_INGESTION, QUEUE_RECONCILIATION,
    QUEUE_RELATIONSHIP_RESOLUTION, QUEUE_VALIDATION,
};
