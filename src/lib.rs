//! codegraph: LLM-driven code knowledge-graph pipeline.
//!
//! The root crate wires the workspace together: CLI parsing, logging
//! setup, and the façade re-exports integration consumers use. All
//! behavior lives in the `codegraph-*` member crates.

pub mod cli;
pub mod logging;

pub use codegraph_breaker as breaker;
pub use codegraph_config as config;
pub use codegraph_discovery as discovery;
pub use codegraph_governor as governor;
pub use codegraph_graph as graph;
pub use codegraph_identity as identity;
pub use codegraph_llm as llm;
pub use codegraph_outbox as outbox;
pub use codegraph_pipeline as pipeline;
pub use codegraph_queue as queue;
pub use codegraph_reconcile as reconcile;
pub use codegraph_store as store;
pub use codegraph_types as types;
pub use codegraph_workers as workers;

pub use codegraph_pipeline::{PipelineReport, PipelineSupervisor};
pub use codegraph_types::ExitCode;
