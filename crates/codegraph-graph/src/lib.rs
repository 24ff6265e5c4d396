//! Graph store contract.
//!
//! The external graph database is a collaborator: the pipeline only needs
//! connectivity verification and idempotent batch ingestion, so that is
//! the whole trait. A Neo4j/Bolt binding slots behind it in deployments;
//! the bundled [`InMemoryGraphStore`] serves `--test-mode` and the
//! integration suite, including failure injection for breaker tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use codegraph_types::{FailureKind, PoiKind, RelationshipKind};

/// Graph store errors.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph connectivity: {0}")]
    Connectivity(String),

    #[error("graph query failed: {0}")]
    Query(String),

    #[error("graph connection pool exhausted")]
    PoolExhausted,

    #[error("graph transaction deadlock")]
    Deadlock,
}

impl GraphError {
    /// Map to the shared taxonomy. Pool exhaustion and deadlocks keep
    /// their identifying text so the graph breaker's classifier can tag
    /// them as non-counting.
    #[must_use]
    pub fn to_failure(&self) -> FailureKind {
        FailureKind::Infrastructure {
            service: "graph".to_string(),
            message: self.to_string(),
        }
    }
}

/// A node bound for the knowledge graph.
#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub semantic_id: String,
    pub name: String,
    pub kind: PoiKind,
    pub file_path: String,
}

/// An edge bound for the knowledge graph.
#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub from_semantic_id: String,
    pub to_semantic_id: String,
    pub kind: RelationshipKind,
    pub confidence: f64,
}

/// Result of one ingestion batch.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IngestStats {
    pub nodes_written: usize,
    pub edges_written: usize,
}

/// The collaborator contract.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Cheap connectivity check, used by the health monitor and breaker
    /// probes.
    async fn verify_connectivity(&self) -> Result<(), GraphError>;

    /// Idempotently merge a batch of nodes and edges. Re-ingesting the
    /// same batch must not duplicate anything: keys are semantic ids.
    async fn ingest_batch(
        &self,
        nodes: &[GraphNode],
        edges: &[GraphEdge],
    ) -> Result<IngestStats, GraphError>;
}

#[derive(Default)]
struct InMemoryState {
    nodes: HashMap<String, GraphNode>,
    edges: HashMap<(String, String, RelationshipKind), GraphEdge>,
    fail_next: Vec<GraphError>,
}

/// In-memory graph store.
#[derive(Default)]
pub struct InMemoryGraphStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryGraphStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue errors to be returned by upcoming operations, oldest first.
    pub fn inject_failures(&self, errors: Vec<GraphError>) {
        let mut state = self.state.lock().expect("graph state poisoned");
        state.fail_next.extend(errors);
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.state.lock().expect("graph state poisoned").nodes.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.state.lock().expect("graph state poisoned").edges.len()
    }

    /// Edge lookup for assertions.
    #[must_use]
    pub fn has_edge(&self, from: &str, to: &str, kind: RelationshipKind) -> bool {
        self.state
            .lock()
            .expect("graph state poisoned")
            .edges
            .contains_key(&(from.to_string(), to.to_string(), kind))
    }

    fn take_injected(&self) -> Option<GraphError> {
        let mut state = self.state.lock().expect("graph state poisoned");
        if state.fail_next.is_empty() {
            None
        } else {
            Some(state.fail_next.remove(0))
        }
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn verify_connectivity(&self) -> Result<(), GraphError> {
        match self.take_injected() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn ingest_batch(
        &self,
        nodes: &[GraphNode],
        edges: &[GraphEdge],
    ) -> Result<IngestStats, GraphError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let mut state = self.state.lock().expect("graph state poisoned");
        let mut stats = IngestStats::default();
        for node in nodes {
            if state
                .nodes
                .insert(node.semantic_id.clone(), node.clone())
                .is_none()
            {
                stats.nodes_written += 1;
            }
        }
        for edge in edges {
            let key = (
                edge.from_semantic_id.clone(),
                edge.to_semantic_id.clone(),
                edge.kind,
            );
            if state.edges.insert(key, edge.clone()).is_none() {
                stats.edges_written += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> GraphNode {
        GraphNode {
            semantic_id: id.to_string(),
            name: id.to_string(),
            kind: PoiKind::Function,
            file_path: "util.js".to_string(),
        }
    }

    fn edge(from: &str, to: &str) -> GraphEdge {
        GraphEdge {
            from_semantic_id: from.to_string(),
            to_semantic_id: to.to_string(),
            kind: RelationshipKind::Calls,
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn ingestion_is_idempotent_by_semantic_id() {
        let store = InMemoryGraphStore::new();
        let nodes = vec![node("a"), node("b")];
        let edges = vec![edge("a", "b")];

        let first = store.ingest_batch(&nodes, &edges).await.unwrap();
        assert_eq!(first.nodes_written, 2);
        assert_eq!(first.edges_written, 1);

        let replay = store.ingest_batch(&nodes, &edges).await.unwrap();
        assert_eq!(replay.nodes_written, 0);
        assert_eq!(replay.edges_written, 0);
        assert_eq!(store.node_count(), 2);
        assert_eq!(store.edge_count(), 1);
        assert!(store.has_edge("a", "b", RelationshipKind::Calls));
    }

    #[tokio::test]
    async fn injected_failures_surface_then_clear() {
        let store = InMemoryGraphStore::new();
        store.inject_failures(vec![GraphError::PoolExhausted]);

        let err = store.verify_connectivity().await.unwrap_err();
        let kind = err.to_failure();
        match kind {
            FailureKind::Infrastructure { message, .. } => {
                assert!(message.contains("pool exhausted"));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        store.verify_connectivity().await.unwrap();
    }
}
