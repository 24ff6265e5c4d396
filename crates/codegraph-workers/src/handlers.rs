//! The six pipeline job handlers.
//!
//! Every handler follows the same contract: decode the payload, do the
//! work through the store (business writes and their outbox rows commit
//! in one transaction), and return a tagged failure kind on error. The
//! managed worker owns permits, breakers, deadlines, and retries: none
//! of that appears here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;

use codegraph_graph::{GraphEdge, GraphNode, GraphStore};
use codegraph_identity::SemanticIdentityService;
use codegraph_llm::{
    parse_poi_report, parse_relationship_report, parse_summary, LlmBackend, LlmInvocation,
    LlmTask, PoiBrief,
};
use codegraph_queue::Job;
use codegraph_reconcile::ConfidenceScorer;
use codegraph_store::{ops, NewPoi, Store};
use codegraph_types::{
    relationship_fingerprint, DirectoryAggregationJob, EvidencePayload, FileAnalysisJob,
    FailureKind, FileStatus, GraphIngestionJob, OutboxEventKind, ReconciliationJob,
    RelationshipResolutionJob, ResolutionLevel, ValidationJob,
};

use crate::worker::JobHandler;
use crate::{payload_failure, store_failure};

/// LLM invocation parameters shared by the analysis handlers.
#[derive(Debug, Clone)]
pub struct LlmParams {
    pub model: String,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl LlmParams {
    fn invocation(&self, run_id: &str, task: LlmTask) -> LlmInvocation {
        let mut invocation = LlmInvocation::new(run_id, task);
        invocation.model = self.model.clone();
        invocation.timeout = self.timeout;
        invocation.max_tokens = self.max_tokens;
        invocation.temperature = self.temperature;
        invocation
    }
}

fn decode<T: serde::de::DeserializeOwned>(job: &Job) -> Result<T, FailureKind> {
    serde_json::from_value(job.payload.clone()).map_err(payload_failure)
}

/// Derive the outbox directory key for a file path.
fn directory_of(path: &str) -> String {
    match Utf8PathBuf::from(path).parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.as_str().to_string(),
        _ => ".".to_string(),
    }
}

// ── file-analysis ──────────────────────────────────────────────────────

/// Extracts POIs from one file via the LLM and commits them together with
/// a `poi-batch` outbox row.
pub struct FileAnalysisHandler {
    pub store: Arc<Store>,
    pub llm: Arc<dyn LlmBackend>,
    pub identity: Arc<SemanticIdentityService>,
    pub target_root: Utf8PathBuf,
    pub params: LlmParams,
}

#[async_trait]
impl JobHandler for FileAnalysisHandler {
    async fn handle(&self, job: &Job) -> Result<(), FailureKind> {
        let payload: FileAnalysisJob = decode(job)?;
        let abs = self.target_root.join(&payload.path);
        let content = std::fs::read_to_string(&abs)
            .map_err(|e| FailureKind::Processing(format!("read {abs}: {e}")))?;

        let invocation = self.params.invocation(
            payload.run_id.as_str(),
            LlmTask::ExtractPois {
                path: payload.path.clone(),
                content,
            },
        );
        let response = self
            .llm
            .invoke(&invocation)
            .await
            .map_err(|e| e.to_failure())?;

        let report = match parse_poi_report(&response.raw) {
            Ok(report) => report,
            Err(e) => {
                // Malformed model output is terminal for this file.
                self.store
                    .set_file_status(payload.file_id, FileStatus::Failed)
                    .map_err(store_failure)?;
                return Err(e.to_failure());
            }
        };

        let new_pois: Vec<NewPoi> = report
            .pois
            .iter()
            .map(|poi| NewPoi {
                name: poi.name.clone(),
                kind: poi.kind,
                start_line: poi.start_line,
                end_line: poi.end_line.max(poi.start_line),
                description: poi.description.clone(),
                exported: poi.exported,
                semantic_id: self
                    .identity
                    .generate(&payload.path, &poi.name, poi.kind),
            })
            .collect();

        let run_id = payload.run_id.clone();
        let directory = directory_of(&payload.path);
        let path = payload.path.clone();
        let file_id = payload.file_id;
        self.store
            .in_transaction(move |tx| {
                let poi_ids = ops::insert_pois(tx, &run_id, file_id, &path, &new_pois)?;
                ops::insert_outbox(
                    tx,
                    &run_id,
                    OutboxEventKind::PoiBatch,
                    &serde_json::json!({
                        "run_id": run_id,
                        "file_id": file_id,
                        "path": path,
                        "directory": directory,
                        "poi_ids": poi_ids,
                    }),
                )?;
                Ok(())
            })
            .map_err(store_failure)?;

        self.store
            .set_file_status(payload.file_id, FileStatus::Processed)
            .map_err(store_failure)?;
        Ok(())
    }
}

// ── validation ─────────────────────────────────────────────────────────

/// Checks POI rows and backfills missing semantic ids.
pub struct ValidationHandler {
    pub store: Arc<Store>,
    pub identity: Arc<SemanticIdentityService>,
}

#[async_trait]
impl JobHandler for ValidationHandler {
    async fn handle(&self, job: &Job) -> Result<(), FailureKind> {
        let payload: ValidationJob = decode(job)?;
        let pois = self
            .store
            .pois_by_ids(&payload.poi_ids)
            .map_err(store_failure)?;
        for poi in pois {
            if poi.name.trim().is_empty() {
                tracing::warn!(poi_id = poi.id, file = %poi.file_path, "dropping unnamed POI");
                continue;
            }
            if poi.semantic_id.is_empty() {
                let semantic_id =
                    self.identity
                        .generate(&poi.file_path, &poi.name, poi.kind);
                self.store
                    .update_poi_semantic_id(poi.id, &semantic_id)
                    .map_err(store_failure)?;
            }
        }
        Ok(())
    }
}

// ── directory-aggregation ──────────────────────────────────────────────

/// Summarizes a directory and commits the summary with a `dir-resolved`
/// outbox row.
pub struct DirectoryAggregationHandler {
    pub store: Arc<Store>,
    pub llm: Arc<dyn LlmBackend>,
    pub params: LlmParams,
}

#[async_trait]
impl JobHandler for DirectoryAggregationHandler {
    async fn handle(&self, job: &Job) -> Result<(), FailureKind> {
        let payload: DirectoryAggregationJob = decode(job)?;
        let pois = self
            .store
            .pois_for_directory(&payload.run_id, &payload.directory)
            .map_err(store_failure)?;
        if pois.is_empty() {
            return Ok(());
        }

        let names: Vec<String> = pois.iter().map(|p| p.name.clone()).collect();
        let invocation = self.params.invocation(
            payload.run_id.as_str(),
            LlmTask::SummarizeDirectory {
                directory: payload.directory.clone(),
                poi_names: names,
            },
        );
        let response = self
            .llm
            .invoke(&invocation)
            .await
            .map_err(|e| e.to_failure())?;
        let summary = parse_summary(&response.raw).map_err(|e| e.to_failure())?;

        let run_id = payload.run_id.clone();
        let directory = payload.directory.clone();
        let poi_count = pois.len() as u32;
        self.store
            .in_transaction(move |tx| {
                ops::upsert_directory_summary(tx, &run_id, &directory, &summary, poi_count)?;
                ops::insert_outbox(
                    tx,
                    &run_id,
                    OutboxEventKind::DirResolved,
                    &serde_json::json!({
                        "run_id": run_id,
                        "directory": directory,
                    }),
                )?;
                Ok(())
            })
            .map_err(store_failure)?;
        Ok(())
    }
}

// ── relationship-resolution ────────────────────────────────────────────

/// Observes relationships among a set of POIs and commits the evidence
/// rows together with a `rel-evidence` outbox row.
pub struct RelationshipResolutionHandler {
    pub store: Arc<Store>,
    pub llm: Arc<dyn LlmBackend>,
    pub target_root: Utf8PathBuf,
    pub params: LlmParams,
}

#[async_trait]
impl JobHandler for RelationshipResolutionHandler {
    async fn handle(&self, job: &Job) -> Result<(), FailureKind> {
        let payload: RelationshipResolutionJob = decode(job)?;
        let pois = self
            .store
            .pois_by_ids(&payload.poi_ids)
            .map_err(store_failure)?;
        if pois.len() < 2 {
            return Ok(());
        }

        let briefs: Vec<PoiBrief> = pois
            .iter()
            .map(|poi| PoiBrief {
                // Validation may not have backfilled yet; the publisher
                // resolves bare names as a fallback.
                semantic_id: if poi.semantic_id.is_empty() {
                    poi.name.clone()
                } else {
                    poi.semantic_id.clone()
                },
                name: poi.name.clone(),
                kind: poi.kind,
                file_path: poi.file_path.clone(),
            })
            .collect();

        let source = if payload.level == ResolutionLevel::File {
            std::fs::read_to_string(self.target_root.join(&payload.scope)).ok()
        } else {
            None
        };

        let invocation = self.params.invocation(
            payload.run_id.as_str(),
            LlmTask::ResolveRelationships {
                scope: payload.scope.clone(),
                level: payload.level,
                pois: briefs,
                source,
            },
        );
        let response = self
            .llm
            .invoke(&invocation)
            .await
            .map_err(|e| e.to_failure())?;
        let report = parse_relationship_report(&response.raw).map_err(|e| e.to_failure())?;
        if report.relationships.is_empty() {
            return Ok(());
        }

        let run_id = payload.run_id.clone();
        let level = payload.level;
        let scope = payload.scope.clone();
        self.store
            .in_transaction(move |tx| {
                let mut batch = Vec::with_capacity(report.relationships.len());
                for observed in &report.relationships {
                    let fingerprint =
                        relationship_fingerprint(&observed.from, &observed.to, observed.kind);
                    let evidence = EvidencePayload {
                        from: observed.from.clone(),
                        to: observed.to.clone(),
                        kind: observed.kind,
                        confidence: observed.confidence,
                        synthetic: false,
                        factors: None,
                        reason: observed.reason.clone(),
                        resolution_level: level,
                    };
                    ops::insert_evidence(tx, &run_id, &fingerprint, &evidence)?;
                    batch.push(serde_json::json!({
                        "from": observed.from,
                        "to": observed.to,
                        "kind": observed.kind,
                        "fingerprint": fingerprint,
                    }));
                }
                ops::insert_outbox(
                    tx,
                    &run_id,
                    OutboxEventKind::RelEvidence,
                    &serde_json::json!({
                        "run_id": run_id,
                        "scope": scope,
                        "level": level,
                        "relationships": batch,
                    }),
                )?;
                Ok(())
            })
            .map_err(store_failure)?;
        Ok(())
    }
}

// ── reconciliation ─────────────────────────────────────────────────────

/// Fuses all evidence for one fingerprint and moves the relationship to
/// its terminal status. Terminal rows are left untouched on replay.
pub struct ReconciliationHandler {
    pub store: Arc<Store>,
    pub scorer: ConfidenceScorer,
}

#[async_trait]
impl JobHandler for ReconciliationHandler {
    async fn handle(&self, job: &Job) -> Result<(), FailureKind> {
        let payload: ReconciliationJob = decode(job)?;
        let evidence = self
            .store
            .evidence_for(&payload.run_id, &payload.fingerprint)
            .map_err(store_failure)?;
        let fused = self.scorer.fuse(&evidence);
        let status = fused.decision(self.scorer.config());

        let updated = self
            .store
            .update_relationship_by_fingerprint(
                &payload.run_id,
                &payload.fingerprint,
                status,
                fused.score,
            )
            .map_err(store_failure)?;
        if updated {
            tracing::debug!(
                fingerprint = %payload.fingerprint,
                score = fused.score,
                conflict = fused.conflict,
                samples = fused.sample_count,
                status = %status,
                "relationship reconciled"
            );
        } else {
            tracing::debug!(
                fingerprint = %payload.fingerprint,
                "relationship already terminal, evidence replay ignored"
            );
        }
        Ok(())
    }
}

// ── graph-ingestion ────────────────────────────────────────────────────

/// Writes a batch of reconciled relationships to the external graph.
pub struct GraphIngestionHandler {
    pub store: Arc<Store>,
    pub graph: Arc<dyn GraphStore>,
}

#[async_trait]
impl JobHandler for GraphIngestionHandler {
    async fn handle(&self, job: &Job) -> Result<(), FailureKind> {
        let payload: GraphIngestionJob = decode(job)?;
        let relationships = self
            .store
            .relationships_by_ids(&payload.relationship_ids)
            .map_err(store_failure)?;
        if relationships.is_empty() {
            return Ok(());
        }

        let mut poi_ids: Vec<i64> = relationships
            .iter()
            .flat_map(|rel| [rel.source_poi_id, rel.target_poi_id])
            .collect();
        poi_ids.sort_unstable();
        poi_ids.dedup();
        let pois = self.store.pois_by_ids(&poi_ids).map_err(store_failure)?;

        let by_id: std::collections::HashMap<i64, &codegraph_types::Poi> =
            pois.iter().map(|p| (p.id, p)).collect();
        let node_key = |poi: &codegraph_types::Poi| {
            if poi.semantic_id.is_empty() {
                poi.name.clone()
            } else {
                poi.semantic_id.clone()
            }
        };

        let nodes: Vec<GraphNode> = pois
            .iter()
            .map(|poi| GraphNode {
                semantic_id: node_key(poi),
                name: poi.name.clone(),
                kind: poi.kind,
                file_path: poi.file_path.clone(),
            })
            .collect();
        let edges: Vec<GraphEdge> = relationships
            .iter()
            .filter_map(|rel| {
                let from = by_id.get(&rel.source_poi_id)?;
                let to = by_id.get(&rel.target_poi_id)?;
                Some(GraphEdge {
                    from_semantic_id: node_key(from),
                    to_semantic_id: node_key(to),
                    kind: rel.kind,
                    confidence: rel.confidence,
                })
            })
            .collect();

        let stats = self
            .graph
            .ingest_batch(&nodes, &edges)
            .await
            .map_err(|e| e.to_failure())?;
        tracing::debug!(
            nodes = stats.nodes_written,
            edges = stats.edges_written,
            "graph batch ingested"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codegraph_reconcile::ReconcilerConfig;
    use codegraph_store::ops;
    use codegraph_types::{PoiKind, RelationshipKind, RelationshipStatus, RunId};

    fn job_with(payload: serde_json::Value) -> Job {
        Job {
            id: "job-1".to_string(),
            queue: "test".to_string(),
            payload,
            priority: 0,
            attempt: 0,
            max_attempts: 3,
            backoff_ms: 10,
        }
    }

    fn seed_poi_pair(store: &Store, run: &RunId) -> (i64, i64, String) {
        let file_id = store.upsert_file(run, "util.js", "h1").unwrap();
        let fp = relationship_fingerprint("util_func_a", "util_func_b", RelationshipKind::Calls);
        let fp_clone = fp.clone();
        let ids = store
            .in_transaction(move |tx| {
                let ids = ops::insert_pois(
                    tx,
                    run,
                    file_id,
                    "util.js",
                    &[
                        NewPoi {
                            name: "a".to_string(),
                            kind: PoiKind::Function,
                            start_line: 1,
                            end_line: 1,
                            description: String::new(),
                            exported: false,
                            semantic_id: "util_func_a".to_string(),
                        },
                        NewPoi {
                            name: "b".to_string(),
                            kind: PoiKind::Function,
                            start_line: 2,
                            end_line: 2,
                            description: String::new(),
                            exported: false,
                            semantic_id: "util_func_b".to_string(),
                        },
                    ],
                )?;
                ops::upsert_relationship(
                    tx,
                    run,
                    ids[0],
                    ids[1],
                    RelationshipKind::Calls,
                    &fp_clone,
                    codegraph_types::ResolutionLevel::File,
                )?;
                Ok(ids)
            })
            .unwrap();
        (ids[0], ids[1], fp)
    }

    fn evidence(confidence: f64) -> EvidencePayload {
        EvidencePayload {
            from: "util_func_a".to_string(),
            to: "util_func_b".to_string(),
            kind: RelationshipKind::Calls,
            confidence: Some(confidence),
            synthetic: false,
            factors: None,
            reason: None,
            resolution_level: codegraph_types::ResolutionLevel::File,
        }
    }

    #[tokio::test]
    async fn reconciliation_fuses_and_validates() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let run = RunId::from_string("r1");
        let (_, _, fp) = seed_poi_pair(&store, &run);
        {
            let fp = fp.clone();
            let run = run.clone();
            store
                .in_transaction(move |tx| {
                    ops::insert_evidence(tx, &run, &fp, &evidence(0.7))?;
                    ops::insert_evidence(tx, &run, &fp, &evidence(0.8))?;
                    ops::insert_evidence(tx, &run, &fp, &evidence(0.75))?;
                    Ok(())
                })
                .unwrap();
        }

        let handler = ReconciliationHandler {
            store: Arc::clone(&store),
            scorer: ConfidenceScorer::new(ReconcilerConfig::default()),
        };
        handler
            .handle(&job_with(serde_json::json!({
                "run_id": "r1",
                "fingerprint": fp,
            })))
            .await
            .unwrap();

        let rel = store.relationship_by_fingerprint(&run, &fp).unwrap().unwrap();
        assert_eq!(rel.status, RelationshipStatus::Validated);
        assert!((rel.confidence - 0.9497).abs() < 1e-3);
    }

    #[tokio::test]
    async fn reconciliation_replay_leaves_terminal_rows() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let run = RunId::from_string("r1");
        let (_, _, fp) = seed_poi_pair(&store, &run);
        {
            let fp = fp.clone();
            let run = run.clone();
            store
                .in_transaction(move |tx| {
                    ops::insert_evidence(tx, &run, &fp, &evidence(0.9)).map(|_| ())
                })
                .unwrap();
        }
        let handler = ReconciliationHandler {
            store: Arc::clone(&store),
            scorer: ConfidenceScorer::new(ReconcilerConfig::default()),
        };
        let job = job_with(serde_json::json!({"run_id": "r1", "fingerprint": fp}));
        handler.handle(&job).await.unwrap();
        let first = store.relationship_by_fingerprint(&run, &fp).unwrap().unwrap();

        // Contradictory late evidence, then replay: status unchanged.
        {
            let fp = fp.clone();
            let run = run.clone();
            store
                .in_transaction(move |tx| {
                    ops::insert_evidence(tx, &run, &fp, &evidence(0.0)).map(|_| ())
                })
                .unwrap();
        }
        handler.handle(&job).await.unwrap();
        let second = store.relationship_by_fingerprint(&run, &fp).unwrap().unwrap();
        assert_eq!(first.status, second.status);
        assert_eq!(first.confidence, second.confidence);
    }

    #[tokio::test]
    async fn validation_backfills_missing_semantic_ids() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let run = RunId::from_string("r1");
        let file_id = store.upsert_file(&run, "util.js", "h1").unwrap();
        let ids = store
            .in_transaction(move |tx| {
                ops::insert_pois(
                    tx,
                    &run,
                    file_id,
                    "util.js",
                    &[NewPoi {
                        name: "parseQuery".to_string(),
                        kind: PoiKind::Function,
                        start_line: 1,
                        end_line: 1,
                        description: String::new(),
                        exported: false,
                        semantic_id: String::new(),
                    }],
                )
            })
            .unwrap();

        let handler = ValidationHandler {
            store: Arc::clone(&store),
            identity: Arc::new(SemanticIdentityService::new()),
        };
        handler
            .handle(&job_with(serde_json::json!({
                "run_id": "r1",
                "file_id": file_id,
                "poi_ids": ids,
            })))
            .await
            .unwrap();

        let run = RunId::from_string("r1");
        let poi = store.pois_by_ids(&ids).unwrap().remove(0);
        assert_eq!(poi.semantic_id, "util_func_parse_query");
        assert!(store.poi_by_semantic_id(&run, "util_func_parse_query").unwrap().is_some());
    }

    #[tokio::test]
    async fn graph_ingestion_writes_nodes_and_edges() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let run = RunId::from_string("r1");
        let (_, _, fp) = seed_poi_pair(&store, &run);
        store
            .update_relationship_by_fingerprint(&run, &fp, RelationshipStatus::Validated, 0.93)
            .unwrap();
        let rel = store.relationship_by_fingerprint(&run, &fp).unwrap().unwrap();

        let graph = Arc::new(codegraph_graph::InMemoryGraphStore::new());
        let handler = GraphIngestionHandler {
            store: Arc::clone(&store),
            graph: Arc::clone(&graph) as Arc<dyn GraphStore>,
        };
        let job = job_with(serde_json::json!({
            "run_id": "r1",
            "relationship_ids": [rel.id],
        }));
        handler.handle(&job).await.unwrap();
        assert_eq!(graph.node_count(), 2);
        assert!(graph.has_edge("util_func_a", "util_func_b", RelationshipKind::Calls));

        // Replay is idempotent.
        handler.handle(&job).await.unwrap();
        assert_eq!(graph.edge_count(), 1);
    }

    #[tokio::test]
    async fn file_analysis_commits_pois_with_outbox_row() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("util.js"), "function add(a,b){return a+b}").unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        let run = RunId::from_string("r1");
        let file_id = store.upsert_file(&run, "util.js", "h1").unwrap();

        let handler = FileAnalysisHandler {
            store: Arc::clone(&store),
            llm: Arc::new(codegraph_llm::StubLlmBackend::new()),
            identity: Arc::new(SemanticIdentityService::new()),
            target_root: Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            params: LlmParams {
                model: "stub".to_string(),
                timeout: Duration::from_secs(5),
                max_tokens: 1024,
                temperature: 0.0,
            },
        };
        handler
            .handle(&job_with(serde_json::json!({
                "run_id": "r1",
                "file_id": file_id,
                "path": "util.js",
                "content_hash": "h1",
            })))
            .await
            .unwrap();

        assert_eq!(store.poi_count(&run).unwrap(), 1);
        assert!(store.poi_by_semantic_id(&run, "util_func_add").unwrap().is_some());
        let events = store.claim_outbox_batch(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, OutboxEventKind::PoiBatch);
        assert_eq!(events[0].payload["directory"], ".");
        assert_eq!(store.file_count(&run, Some(FileStatus::Processed)).unwrap(), 1);
    }

    #[tokio::test]
    async fn relationship_resolution_emits_evidence_and_outbox() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("util.js"),
            "function mul(a,b){return a*b}\nfunction square(x){return mul(x,x)}\n",
        )
        .unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        let run = RunId::from_string("r1");
        let file_id = store.upsert_file(&run, "util.js", "h1").unwrap();
        let ids = store
            .in_transaction(move |tx| {
                ops::insert_pois(
                    tx,
                    &run,
                    file_id,
                    "util.js",
                    &[
                        NewPoi {
                            name: "mul".to_string(),
                            kind: PoiKind::Function,
                            start_line: 1,
                            end_line: 1,
                            description: String::new(),
                            exported: false,
                            semantic_id: "util_func_mul".to_string(),
                        },
                        NewPoi {
                            name: "square".to_string(),
                            kind: PoiKind::Function,
                            start_line: 2,
                            end_line: 2,
                            description: String::new(),
                            exported: false,
                            semantic_id: "util_func_square".to_string(),
                        },
                    ],
                )
            })
            .unwrap();

        let handler = RelationshipResolutionHandler {
            store: Arc::clone(&store),
            llm: Arc::new(codegraph_llm::StubLlmBackend::new()),
            target_root: Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            params: LlmParams {
                model: "stub".to_string(),
                timeout: Duration::from_secs(5),
                max_tokens: 1024,
                temperature: 0.0,
            },
        };
        handler
            .handle(&job_with(serde_json::json!({
                "run_id": "r1",
                "scope": "util.js",
                "level": "file",
                "poi_ids": ids,
            })))
            .await
            .unwrap();

        let run = RunId::from_string("r1");
        let fp = relationship_fingerprint("util_func_square", "util_func_mul", RelationshipKind::Calls);
        let evidence_rows = store.evidence_for(&run, &fp).unwrap();
        assert_eq!(evidence_rows.len(), 1);
        assert_eq!(evidence_rows[0].confidence, Some(0.8));

        let events = store.claim_outbox_batch(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, OutboxEventKind::RelEvidence);
        assert_eq!(events[0].payload["relationships"][0]["fingerprint"], fp);
    }

    #[test]
    fn directory_of_handles_root_and_nested() {
        assert_eq!(directory_of("util.js"), ".");
        assert_eq!(directory_of("src/util.js"), "src");
        assert_eq!(directory_of("src/lib/util.js"), "src/lib");
    }
}
