//! Transactional outbox publisher.
//!
//! A single polling task per process claims committed outbox rows in id
//! order, resolves any symbolic POI references they carry, enqueues the
//! downstream jobs, and marks each row PROCESSED or FAILED. Enqueueing
//! more than once is acceptable: every downstream handler is idempotent
//! by fingerprint: so the publisher prefers replay over loss.
//!
//! Reference resolution tries `(run, semantic_id)` first and falls back
//! to `(run, name)`. A reference that resolves neither way marks the row
//! FAILED with a reason and skips that relationship; the rest of the
//! batch still publishes.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use codegraph_queue::{JobOptions, QueueError, QueueRegistry};
use codegraph_store::{ops, Store, StoreError};
use codegraph_types::{
    DirectoryAggregationJob, OutboxEvent, OutboxEventKind, OutboxStatus, Poi, ReconciliationJob,
    RelationshipKind, RelationshipResolutionJob, ResolutionLevel, RunId, ValidationJob,
    QUEUE_DIRECTORY_AGGREGATION, QUEUE_DIRECTORY_RESOLUTION, QUEUE_RECONCILIATION,
    QUEUE_RELATIONSHIP_RESOLUTION, QUEUE_VALIDATION,
};

/// Publisher errors. Event-level problems never surface here: they mark
/// the row FAILED instead; these are infrastructure faults.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("queue '{0}' is not registered")]
    MissingQueue(String),
}

/// Publisher tuning.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub poll_interval: Duration,
    pub claim_batch_size: usize,
    /// Retry budget stamped onto downstream jobs.
    pub job_attempts: u32,
    /// Base backoff stamped onto downstream jobs, milliseconds.
    pub job_backoff_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            claim_batch_size: 50,
            job_attempts: 3,
            job_backoff_ms: 1_000,
        }
    }
}

/// Counters for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub processed: usize,
    pub failed: usize,
    pub jobs_enqueued: usize,
}

#[derive(Debug, Deserialize)]
struct PoiBatchPayload {
    run_id: RunId,
    file_id: i64,
    path: String,
    directory: String,
    poi_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct DirResolvedPayload {
    run_id: RunId,
    directory: String,
}

#[derive(Debug, Deserialize)]
struct RelEvidencePayload {
    run_id: RunId,
    level: ResolutionLevel,
    relationships: Vec<RelRef>,
}

#[derive(Debug, Deserialize)]
struct RelRef {
    from: String,
    to: String,
    kind: RelationshipKind,
    fingerprint: String,
}

/// The publisher. One instance per process.
pub struct OutboxPublisher {
    store: Arc<Store>,
    queues: Arc<QueueRegistry>,
    config: OutboxConfig,
}

impl OutboxPublisher {
    #[must_use]
    pub fn new(store: Arc<Store>, queues: Arc<QueueRegistry>, config: OutboxConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            queues,
            config,
        })
    }

    /// Poll until shutdown. Claims orphaned IN_PROGRESS rows from a
    /// previous crash before the first pass.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        match self.store.recover_in_progress_outbox() {
            Ok(0) => {}
            Ok(n) => tracing::info!(rows = n, "recovered orphaned outbox claims"),
            Err(e) => tracing::error!(error = %e, "outbox recovery failed"),
        }
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.drain() {
                Ok(stats) if stats.processed + stats.failed > 0 => {
                    tracing::debug!(
                        processed = stats.processed,
                        failed = stats.failed,
                        jobs = stats.jobs_enqueued,
                        "outbox drained"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "outbox drain failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One synchronous drain pass: claim, publish, mark. Exposed for
    /// tests and for the supervisor's final sweep before quiescence
    /// checks.
    pub fn drain(&self) -> Result<DrainStats, PublishError> {
        let mut stats = DrainStats::default();
        loop {
            let batch = self.store.claim_outbox_batch(self.config.claim_batch_size)?;
            if batch.is_empty() {
                return Ok(stats);
            }
            let mut events = batch.into_iter();
            while let Some(event) = events.next() {
                let id = event.id;
                match self.publish_event(&event) {
                    Ok(enqueued) => {
                        self.store.mark_outbox(id, OutboxStatus::Processed, None)?;
                        stats.processed += 1;
                        stats.jobs_enqueued += enqueued;
                    }
                    Err(EventFault::Skip(reason)) => {
                        tracing::warn!(event_id = id, reason = %reason, "outbox event failed");
                        self.store
                            .mark_outbox(id, OutboxStatus::Failed, Some(&reason))?;
                        stats.failed += 1;
                    }
                    Err(EventFault::Infra(e)) => {
                        // Release this claim and every unprocessed sibling;
                        // the next pass retries them in id order.
                        self.store.mark_outbox(id, OutboxStatus::Pending, None)?;
                        for remaining in events {
                            self.store
                                .mark_outbox(remaining.id, OutboxStatus::Pending, None)?;
                        }
                        return Err(e);
                    }
                }
            }
        }
    }

    fn publish_event(&self, event: &OutboxEvent) -> Result<usize, EventFault> {
        match event.kind {
            OutboxEventKind::PoiBatch => self.publish_poi_batch(event),
            OutboxEventKind::DirResolved => self.publish_dir_resolved(event),
            OutboxEventKind::RelEvidence => self.publish_rel_evidence(event),
        }
    }

    fn publish_poi_batch(&self, event: &OutboxEvent) -> Result<usize, EventFault> {
        let payload: PoiBatchPayload = decode(event)?;
        let mut enqueued = 0;

        if !payload.poi_ids.is_empty() {
            self.enqueue(
                QUEUE_VALIDATION,
                &ValidationJob {
                    run_id: payload.run_id.clone(),
                    file_id: payload.file_id,
                    poi_ids: payload.poi_ids.clone(),
                },
            )?;
            enqueued += 1;

            self.enqueue(
                QUEUE_RELATIONSHIP_RESOLUTION,
                &RelationshipResolutionJob {
                    run_id: payload.run_id.clone(),
                    scope: payload.path.clone(),
                    level: ResolutionLevel::File,
                    poi_ids: payload.poi_ids.clone(),
                },
            )?;
            enqueued += 1;
        }

        self.enqueue(
            QUEUE_DIRECTORY_AGGREGATION,
            &DirectoryAggregationJob {
                run_id: payload.run_id.clone(),
                directory: payload.directory.clone(),
            },
        )?;
        enqueued += 1;

        self.store
            .record_jobs_created(&payload.run_id, enqueued as u64)
            .map_err(|e| EventFault::Infra(e.into()))?;
        Ok(enqueued)
    }

    fn publish_dir_resolved(&self, event: &OutboxEvent) -> Result<usize, EventFault> {
        let payload: DirResolvedPayload = decode(event)?;
        let pois = self
            .store
            .pois_for_directory(&payload.run_id, &payload.directory)
            .map_err(|e| EventFault::Infra(e.into()))?;
        if pois.len() < 2 {
            return Ok(0);
        }
        self.enqueue(
            QUEUE_DIRECTORY_RESOLUTION,
            &RelationshipResolutionJob {
                run_id: payload.run_id.clone(),
                scope: payload.directory.clone(),
                level: ResolutionLevel::Directory,
                poi_ids: pois.iter().map(|p| p.id).collect(),
            },
        )?;
        self.store
            .record_jobs_created(&payload.run_id, 1)
            .map_err(|e| EventFault::Infra(e.into()))?;
        Ok(1)
    }

    fn publish_rel_evidence(&self, event: &OutboxEvent) -> Result<usize, EventFault> {
        let payload: RelEvidencePayload = decode(event)?;
        let mut enqueued = 0;
        let mut unresolved: Vec<String> = Vec::new();
        let mut seen_fingerprints = std::collections::HashSet::new();

        for rel in &payload.relationships {
            let Some(source) = self.resolve_poi(&payload.run_id, &rel.from)? else {
                unresolved.push(rel.from.clone());
                continue;
            };
            let Some(target) = self.resolve_poi(&payload.run_id, &rel.to)? else {
                unresolved.push(rel.to.clone());
                continue;
            };

            let run_id = payload.run_id.clone();
            let fingerprint = rel.fingerprint.clone();
            let kind = rel.kind;
            let level = payload.level;
            let (source_id, target_id) = (source.id, target.id);
            self.store
                .in_transaction(move |tx| {
                    ops::upsert_relationship(
                        tx,
                        &run_id,
                        source_id,
                        target_id,
                        kind,
                        &fingerprint,
                        level,
                    )
                    .map(|_| ())
                })
                .map_err(|e| EventFault::Infra(e.into()))?;

            if seen_fingerprints.insert(rel.fingerprint.clone()) {
                self.enqueue(
                    QUEUE_RECONCILIATION,
                    &ReconciliationJob {
                        run_id: payload.run_id.clone(),
                        fingerprint: rel.fingerprint.clone(),
                    },
                )?;
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            self.store
                .record_jobs_created(&payload.run_id, enqueued as u64)
                .map_err(|e| EventFault::Infra(e.into()))?;
        }
        if unresolved.is_empty() {
            Ok(enqueued)
        } else {
            Err(EventFault::Skip(format!(
                "unresolved POI references: {}",
                unresolved.join(", ")
            )))
        }
    }

    /// `(run, semantic_id)` first, `(run, name)` as fallback.
    fn resolve_poi(
        &self,
        run_id: &RunId,
        reference: &str,
    ) -> Result<Option<Poi>, EventFault> {
        if let Some(poi) = self
            .store
            .poi_by_semantic_id(run_id, reference)
            .map_err(|e| EventFault::Infra(e.into()))?
        {
            return Ok(Some(poi));
        }
        self.store
            .poi_by_name(run_id, None, reference)
            .map_err(|e| EventFault::Infra(e.into()))
    }

    fn enqueue<T: serde::Serialize>(&self, queue: &str, job: &T) -> Result<(), EventFault> {
        let q = self
            .queues
            .get(queue)
            .ok_or_else(|| EventFault::Infra(PublishError::MissingQueue(queue.to_string())))?;
        q.enqueue(
            job,
            JobOptions {
                priority: 0,
                max_attempts: self.config.job_attempts,
                backoff_ms: self.config.job_backoff_ms,
            },
        )
        .map_err(|e| EventFault::Infra(e.into()))?;
        Ok(())
    }
}

/// Event-level outcome split: a `Skip` marks the row FAILED and moves on;
/// an `Infra` aborts the pass and re-queues the claim.
enum EventFault {
    Skip(String),
    Infra(PublishError),
}

fn decode<T: serde::de::DeserializeOwned>(event: &OutboxEvent) -> Result<T, EventFault> {
    serde_json::from_value(event.payload.clone())
        .map_err(|e| EventFault::Skip(format!("undecodable payload: {e}")))
}
