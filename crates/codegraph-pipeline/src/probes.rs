//! Dependency probes for the health monitor and the breakers.

use std::sync::Arc;

use async_trait::async_trait;

use codegraph_graph::GraphStore;
use codegraph_queue::QueueRegistry;
use codegraph_store::Store;

use crate::health::DependencyProbe;

/// Store probe: write + read + delete inside one transaction.
pub struct StoreProbe {
    pub store: Arc<Store>,
}

#[async_trait]
impl DependencyProbe for StoreProbe {
    fn name(&self) -> &str {
        "store"
    }
    async fn probe(&self) -> Result<(), String> {
        self.store.health_check().map_err(|e| e.to_string())
    }
}

/// Graph probe: connectivity verification.
pub struct GraphProbe {
    pub graph: Arc<dyn GraphStore>,
}

#[async_trait]
impl DependencyProbe for GraphProbe {
    fn name(&self) -> &str {
        "graph"
    }
    async fn probe(&self) -> Result<(), String> {
        self.graph
            .verify_connectivity()
            .await
            .map_err(|e| e.to_string())
    }
}

/// Broker probe: a counts round-trip over every queue.
pub struct BrokerProbe {
    pub queues: Arc<QueueRegistry>,
}

#[async_trait]
impl DependencyProbe for BrokerProbe {
    fn name(&self) -> &str {
        "broker"
    }
    async fn probe(&self) -> Result<(), String> {
        self.queues.counts().map(|_| ()).map_err(|e| e.to_string())
    }
}

/// Adapter: the graph connectivity check doubles as the graph breaker's
/// half-open health probe.
pub struct GraphBreakerProbe {
    pub graph: Arc<dyn GraphStore>,
}

#[async_trait]
impl codegraph_breaker::HealthProbe for GraphBreakerProbe {
    async fn check(&self) -> bool {
        self.graph.verify_connectivity().await.is_ok()
    }
}
