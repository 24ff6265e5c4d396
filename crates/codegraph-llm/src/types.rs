//! Core types for the LLM backend abstraction.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use codegraph_types::{FailureKind, PoiKind, RelationshipKind, ResolutionLevel};

/// LLM backend errors.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limited{}", retry_after.map(|d| format!(", retry after {d:?}")).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    #[error("unparseable response: {0}")]
    Parse(String),
}

impl LlmError {
    /// Map to the shared failure taxonomy for retry decisions.
    #[must_use]
    pub fn to_failure(&self) -> FailureKind {
        match self {
            LlmError::RateLimited { retry_after } => FailureKind::RateLimited {
                retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
            },
            LlmError::Auth(msg) | LlmError::Misconfiguration(msg) => {
                FailureKind::Configuration(msg.clone())
            }
            LlmError::Http { status, message } => FailureKind::Infrastructure {
                service: "llm".to_string(),
                message: format!("HTTP {status}: {message}"),
            },
            LlmError::Timeout(d) => FailureKind::Timeout(*d),
            LlmError::Transport(msg) => FailureKind::Infrastructure {
                service: "llm".to_string(),
                message: msg.clone(),
            },
            LlmError::Parse(msg) => FailureKind::Validation(msg.clone()),
        }
    }
}

/// A POI included in a relationship-resolution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoiBrief {
    pub semantic_id: String,
    pub name: String,
    pub kind: PoiKind,
    pub file_path: String,
}

/// What the backend is being asked to do.
#[derive(Debug, Clone)]
pub enum LlmTask {
    /// Extract POIs from one file.
    ExtractPois { path: String, content: String },
    /// Observe relationships among the given POIs. `source` carries the
    /// file text at file level; directory/global passes summaries only.
    ResolveRelationships {
        scope: String,
        level: ResolutionLevel,
        pois: Vec<PoiBrief>,
        source: Option<String>,
    },
    /// Summarize a directory from its POI names.
    SummarizeDirectory {
        directory: String,
        poi_names: Vec<String>,
    },
}

impl LlmTask {
    /// Short label for logging and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            LlmTask::ExtractPois { .. } => "extract-pois",
            LlmTask::ResolveRelationships { .. } => "resolve-relationships",
            LlmTask::SummarizeDirectory { .. } => "summarize-directory",
        }
    }
}

/// Input to one backend invocation.
#[derive(Debug, Clone)]
pub struct LlmInvocation {
    pub run_id: String,
    pub task: LlmTask,
    pub model: String,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Provider-specific extras.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl LlmInvocation {
    #[must_use]
    pub fn new(run_id: impl Into<String>, task: LlmTask) -> Self {
        Self {
            run_id: run_id.into(),
            task,
            model: String::new(),
            timeout: Duration::from_secs(90),
            max_tokens: 4096,
            temperature: 0.1,
            metadata: HashMap::new(),
        }
    }
}

/// Raw result of one backend invocation.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub raw: String,
    pub provider: String,
    pub model_used: String,
    pub duration: Duration,
}

/// A POI as reported by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedPoi {
    pub name: String,
    pub kind: PoiKind,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub exported: bool,
}

/// Typed report from a POI extraction call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoiReport {
    pub pois: Vec<ExtractedPoi>,
}

/// A relationship observation as reported by the model. `from` and `to`
/// may be semantic ids or bare names: the outbox publisher resolves them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedRelationship {
    pub from: String,
    pub to: String,
    pub kind: RelationshipKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Typed report from a relationship-resolution call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipReport {
    pub relationships: Vec<ObservedRelationship>,
}

/// A provider of language-model analysis.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Run one invocation and return the raw response text.
    async fn invoke(&self, invocation: &LlmInvocation) -> Result<LlmResponse, LlmError>;

    /// Provider name for logs and reports.
    fn provider(&self) -> &str;
}
