//! End-to-end pipeline runs against the deterministic stub backend.
//!
//! These tests exercise the full job flow: discovery, file analysis,
//! outbox fan-out, validation, relationship resolution, reconciliation,
//! graph build: with real queues, a real SQLite store on disk, and the
//! stub LLM, then assert on the report and the persisted rows.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use codegraph::config::Config;
use codegraph::PipelineSupervisor;
use codegraph_graph::InMemoryGraphStore;
use codegraph_store::Store;
use codegraph_types::{RelationshipKind, RunId};

fn fast_config(target: &Utf8Path, data_dir: &Utf8Path, run_id: &str) -> Config {
    let mut config = Config::default();
    config.pipeline.target_dir = target.to_owned();
    config.pipeline.data_dir = data_dir.to_owned();
    config.pipeline.run_id_override = Some(run_id.to_string());
    config.pipeline.test_mode = true;
    config.pipeline.sample_interval_secs = 1;
    config.pipeline.quiescence_samples = 2;
    config.pipeline.max_wait_secs = 60;
    config.pipeline.shutdown_timeout_secs = 10;
    config.worker.heartbeat_secs = 1;
    config.worker.job_timeout_secs = 10;
    config.outbox.poll_interval_ms = 100;
    config
}

fn utf8(path: &std::path::Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_file_run_extracts_a_single_poi() {
    let target = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(target.path().join("util.js"), "function add(a,b){return a+b}").unwrap();

    let config = fast_config(&utf8(target.path()), &utf8(data.path()), "e2e-one-file");
    let report = PipelineSupervisor::new(config).run().await.unwrap();

    assert!(report.success, "report: {report:?}");
    assert_eq!(report.exit_code().as_i32(), 0);
    assert_eq!(report.files_discovered, 1);
    assert_eq!(report.files_processed, 1);
    assert_eq!(report.files_failed, 0);
    assert_eq!(report.pois_extracted, 1);
    assert_eq!(report.relationships_validated, 0);
    assert!(!report.deadlocked);
    assert_eq!(report.by_extension["js"], 1);

    // The POI landed with the expected semantic id.
    let store = Store::open(&data.path().join("codegraph.db")).unwrap();
    let run = RunId::from_string("e2e-one-file");
    let poi = store
        .poi_by_semantic_id(&run, "util_func_add")
        .unwrap()
        .expect("util_func_add exists");
    assert_eq!(poi.name, "add");
    assert_eq!(poi.start_line, 1);

    // Quiescence left nothing pending in the outbox.
    assert_eq!(store.pending_outbox_count().unwrap(), 0);

    // The final report was persisted.
    let raw = std::fs::read_to_string(data.path().join("run-report.json")).unwrap();
    assert!(raw.contains("\"e2e-one-file\""));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn call_relationship_flows_to_the_graph() {
    let target = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(
        target.path().join("util.js"),
        "function mul(a,b){return a*b}\nfunction square(x){return mul(x,x)}\n",
    )
    .unwrap();

    let graph = Arc::new(InMemoryGraphStore::new());
    let config = fast_config(&utf8(target.path()), &utf8(data.path()), "e2e-calls");
    let report = PipelineSupervisor::new(config)
        .with_graph(Arc::clone(&graph) as Arc<dyn codegraph_graph::GraphStore>)
        .run()
        .await
        .unwrap();

    assert!(report.success, "report: {report:?}");
    assert_eq!(report.pois_extracted, 2);
    assert_eq!(report.relationships_validated, 1);
    assert_eq!(report.relationships_discarded, 0);

    assert_eq!(graph.node_count(), 2);
    assert!(graph.has_edge("util_func_square", "util_func_mul", RelationshipKind::Calls));

    // Single observation, confidence 0.8, no convergence bonus.
    let store = Store::open(&data.path().join("codegraph.db")).unwrap();
    let run = RunId::from_string("e2e-calls");
    let validated = store
        .relationships_by_status(&run, codegraph_types::RelationshipStatus::Validated)
        .unwrap();
    assert_eq!(validated.len(), 1);
    assert!((validated[0].confidence - 0.8).abs() < 1e-6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unchanged_rerun_processes_nothing() {
    let target = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(target.path().join("util.js"), "function add(a,b){return a+b}").unwrap();

    let first = PipelineSupervisor::new(fast_config(
        &utf8(target.path()),
        &utf8(data.path()),
        "e2e-rerun-1",
    ))
    .run()
    .await
    .unwrap();
    assert!(first.success);
    assert_eq!(first.files_discovered, 1);

    // Same target, same hashes: discovery seeds zero analysis jobs.
    let second = PipelineSupervisor::new(fast_config(
        &utf8(target.path()),
        &utf8(data.path()),
        "e2e-rerun-2",
    ))
    .run()
    .await
    .unwrap();
    assert!(second.success);
    assert_eq!(second.files_discovered, 0);
    assert_eq!(second.pois_extracted, 0);
    assert_eq!(second.jobs_completed, 0);
}
