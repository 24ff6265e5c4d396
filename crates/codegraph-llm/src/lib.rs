//! LLM backend abstraction.
//!
//! Every analysis task goes through the [`LlmBackend`] trait, so the
//! orchestration layer never knows which provider is behind it. Two
//! backends ship with the pipeline: an HTTP messages backend for an
//! Anthropic-style endpoint, and a deterministic stub that extracts POIs
//! by coarse pattern matching: the hermetic binding behind `--test-mode`
//! and the integration suite.
//!
//! Invocations carry a structured [`LlmTask`], not a pre-rendered prompt:
//! the HTTP backend renders prompts from the task, while the stub computes
//! its answer from the same structure. Responses are parsed into typed
//! reports; anything unparseable surfaces as a validation failure, which
//! the worker layer drops without retry.

mod http_backend;
mod parse;
mod prompts;
mod stub;
mod types;

pub use http_backend::HttpLlmBackend;
pub use parse::{parse_poi_report, parse_relationship_report, parse_summary};
pub use stub::StubLlmBackend;
pub use types::{
    ExtractedPoi, LlmBackend, LlmError, LlmInvocation, LlmResponse, LlmTask, ObservedRelationship,
    PoiBrief, PoiReport, RelationshipReport,
};
