//! Failure taxonomy and structured error events.
//!
//! The pipeline never branches on concrete error types across crate
//! boundaries. Adapters map their internal errors into a [`FailureKind`];
//! the managed worker decides retry vs. fail from the kind's category, and
//! the supervisor decides fatal vs. continue from the aggregate failure
//! rate. This mirrors the tagged-result discipline the rest of the
//! workspace follows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::model::{RunId, WorkerType};

/// High-level error category, used for grouping and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Broker, store, or graph connectivity. Recoverable via breaker.
    Infrastructure,
    /// LLM 429s and request timeouts. Recoverable via backoff; never counts
    /// toward breaker failure thresholds.
    ApiRateLimit,
    /// Malformed LLM output or schema violation. The evidence is dropped.
    Validation,
    /// Worker handler bug or inconsistent job data. Retried, then failed.
    Processing,
    /// Memory pressure or hard timeout. The supervisor escalates.
    System,
    /// Bad configuration or auth. Fails the run.
    Configuration,
}

/// Severity attached to an error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// The tagged failure kind that drives retry decisions.
///
/// Retry is driven by the kind, not by downcasting error types: a handler
/// returns a `FailureKind` and the managed worker consults
/// [`is_retryable`](Self::is_retryable) and
/// [`counts_toward_breaker`](Self::counts_toward_breaker).
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureKind {
    /// A dependency (broker, store, graph) is unreachable or erroring.
    #[error("infrastructure failure in {service}: {message}")]
    Infrastructure { service: String, message: String },

    /// The service asked us to slow down. Carries the advised backoff when
    /// the provider supplied one.
    #[error("rate limited{}", retry_after_ms.map(|ms| format!(" (retry after {ms}ms)")).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },

    /// The breaker for this service is OPEN; the call failed fast.
    #[error("circuit open for {service}")]
    CircuitOpen { service: String },

    /// The handler's output failed schema or semantic validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A handler bug or inconsistent job data.
    #[error("processing failure: {0}")]
    Processing(String),

    /// The job exceeded its hard deadline.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    /// Memory pressure or another process-level condition.
    #[error("system failure: {0}")]
    System(String),

    /// Bad configuration or authentication. Not recoverable.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl FailureKind {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            FailureKind::Infrastructure { .. } | FailureKind::CircuitOpen { .. } => {
                ErrorCategory::Infrastructure
            }
            FailureKind::RateLimited { .. } => ErrorCategory::ApiRateLimit,
            FailureKind::Validation(_) => ErrorCategory::Validation,
            FailureKind::Processing(_) => ErrorCategory::Processing,
            FailureKind::Timeout(_) | FailureKind::System(_) => ErrorCategory::System,
            FailureKind::Configuration(_) => ErrorCategory::Configuration,
        }
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            FailureKind::Infrastructure { .. } => Severity::Critical,
            FailureKind::RateLimited { .. }
            | FailureKind::CircuitOpen { .. }
            | FailureKind::Validation(_)
            | FailureKind::Processing(_) => Severity::Medium,
            FailureKind::Timeout(_) | FailureKind::System(_) => Severity::High,
            FailureKind::Configuration(_) => Severity::Critical,
        }
    }

    /// Whether the managed worker should requeue the job (up to its retry
    /// budget) instead of failing it outright.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::Infrastructure { .. }
            | FailureKind::RateLimited { .. }
            | FailureKind::CircuitOpen { .. }
            | FailureKind::Processing(_)
            | FailureKind::Timeout(_) => true,
            FailureKind::Validation(_) | FailureKind::System(_) | FailureKind::Configuration(_) => {
                false
            }
        }
    }

    /// Whether this failure counts toward a breaker's consecutive-failure
    /// threshold. Rate limits and auth/config errors back off but never
    /// open a circuit.
    #[must_use]
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            FailureKind::Infrastructure { .. }
                | FailureKind::Processing(_)
                | FailureKind::Timeout(_)
        )
    }
}

/// Structured error event emitted when a job fails.
///
/// Carries enough correlation context to reconstruct the failure without
/// scraping logs. `parent_correlation_id` points at the event that caused
/// this one, forming a chain rather than a cyclic owner graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub correlation_id: String,
    pub run_id: RunId,
    pub worker_type: WorkerType,
    pub job_id: String,
    pub kind: FailureKind,
    pub duration_ms: u64,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_correlation_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorEvent {
    /// Build an event with a fresh correlation id.
    #[must_use]
    pub fn new(
        run_id: RunId,
        worker_type: WorkerType,
        job_id: impl Into<String>,
        kind: FailureKind,
        duration: Duration,
        retry_count: u32,
    ) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            run_id,
            worker_type,
            job_id: job_id.into(),
            kind,
            duration_ms: duration.as_millis() as u64,
            retry_count,
            parent_correlation_id: None,
            occurred_at: Utc::now(),
        }
    }

    /// Chain this event to the one that caused it.
    #[must_use]
    pub fn caused_by(mut self, parent: &ErrorEvent) -> Self {
        self.parent_correlation_id = Some(parent.correlation_id.clone());
        self
    }
}

/// Library-level error type for operations that sit above a single adapter.
#[derive(Debug, Error)]
pub enum CodegraphError {
    #[error(transparent)]
    Failure(#[from] FailureKind),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_retryable_but_never_counts() {
        let kind = FailureKind::RateLimited {
            retry_after_ms: Some(500),
        };
        assert!(kind.is_retryable());
        assert!(!kind.counts_toward_breaker());
        assert_eq!(kind.category(), ErrorCategory::ApiRateLimit);
    }

    #[test]
    fn validation_is_dropped_not_retried() {
        let kind = FailureKind::Validation("unparseable LLM output".to_string());
        assert!(!kind.is_retryable());
        assert!(!kind.counts_toward_breaker());
    }

    #[test]
    fn infrastructure_counts_and_retries() {
        let kind = FailureKind::Infrastructure {
            service: "graph".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(kind.is_retryable());
        assert!(kind.counts_toward_breaker());
        assert_eq!(kind.severity(), Severity::Critical);
    }

    #[test]
    fn configuration_fails_the_run() {
        let kind = FailureKind::Configuration("missing LLM_API_KEY".to_string());
        assert!(!kind.is_retryable());
        assert_eq!(kind.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn error_event_chains_by_correlation_id() {
        let run = RunId::from_string("run-1");
        let parent = ErrorEvent::new(
            run.clone(),
            WorkerType::FileAnalysis,
            "job-1",
            FailureKind::Timeout(Duration::from_secs(30)),
            Duration::from_secs(30),
            0,
        );
        let child = ErrorEvent::new(
            run,
            WorkerType::FileAnalysis,
            "job-1",
            FailureKind::Processing("requeue exhausted".to_string()),
            Duration::from_millis(5),
            3,
        )
        .caused_by(&parent);
        assert_eq!(
            child.parent_correlation_id.as_deref(),
            Some(parent.correlation_id.as_str())
        );
    }
}
