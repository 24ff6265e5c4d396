//! SQLite store adapter.
//!
//! Single write connection behind a mutex (single-writer discipline with a
//! 10-second busy wait), WAL journaling with NORMAL synchronous durability,
//! and enforced cascade ownership: POIs die with their file, relationships
//! with their endpoint POIs, everything with its run.
//!
//! Writes that must commit together go through [`Store::in_transaction`]
//! combined with the helpers in [`ops`]: the outbox invariant (an outbox
//! row commits in the same transaction as the business data it describes)
//! is structural here, not a convention handlers have to remember.

mod schema;

pub use schema::SCHEMA_VERSION;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use thiserror::Error;

use codegraph_types::{
    EvidencePayload, FileStatus, OutboxEvent, OutboxEventKind, OutboxStatus, Poi, PoiKind,
    Relationship, RelationshipKind, RelationshipStatus, ResolutionLevel, RunId, RunStats,
};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("payload serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store mutex poisoned")]
    Poisoned,
}

/// A POI that has not been assigned a row id yet.
#[derive(Debug, Clone)]
pub struct NewPoi {
    pub name: String,
    pub kind: PoiKind,
    pub start_line: u32,
    pub end_line: u32,
    pub description: String,
    pub exported: bool,
    /// May be empty; the validation worker backfills it.
    pub semantic_id: String,
}

/// The store: one write connection, serialized access.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (and migrate) a file-backed store.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Corrupt(format!("cannot create data dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        schema::apply_pragmas(&conn, true)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory store (tests and `--test-mode` dry runs).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::apply_pragmas(&conn, false)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file path (`None` for in-memory).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
    ///
    /// The connection mutex is held for the duration: callers must not
    /// await inside `f` (the closure is sync, so the compiler enforces it).
    pub fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn)
    }

    // ── files ──────────────────────────────────────────────────────────

    /// Insert (or refresh) a discovered file, returning its row id.
    pub fn upsert_file(
        &self,
        run_id: &RunId,
        path: &str,
        content_hash: &str,
    ) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO files (run_id, path, content_hash, status)
                 VALUES (?1, ?2, ?3, 'pending')
                 ON CONFLICT (run_id, path) DO UPDATE SET
                     content_hash = excluded.content_hash,
                     status = 'pending'",
                params![run_id.as_str(), path, content_hash],
            )?;
            let id = conn.query_row(
                "SELECT id FROM files WHERE run_id = ?1 AND path = ?2",
                params![run_id.as_str(), path],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn set_file_status(&self, file_id: i64, status: FileStatus) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE files SET status = ?1 WHERE id = ?2",
                params![status.to_string(), file_id],
            )?;
            Ok(())
        })
    }

    /// Most recent content hash recorded for a path, across all runs.
    /// Discovery uses this for the unchanged-skip check.
    pub fn latest_hash_for_path(&self, path: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT content_hash FROM files WHERE path = ?1 ORDER BY id DESC LIMIT 1",
                    params![path],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn file_count(&self, run_id: &RunId, status: Option<FileStatus>) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = match status {
                Some(status) => conn.query_row(
                    "SELECT COUNT(*) FROM files WHERE run_id = ?1 AND status = ?2",
                    params![run_id.as_str(), status.to_string()],
                    |row| row.get(0),
                )?,
                None => conn.query_row(
                    "SELECT COUNT(*) FROM files WHERE run_id = ?1",
                    params![run_id.as_str()],
                    |row| row.get(0),
                )?,
            };
            Ok(count as u64)
        })
    }

    // ── POIs ───────────────────────────────────────────────────────────

    pub fn pois_for_file(&self, run_id: &RunId, file_id: i64) -> Result<Vec<Poi>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, file_id, file_path, name, kind, start_line, end_line,
                        description, exported, semantic_id
                 FROM pois WHERE run_id = ?1 AND file_id = ?2 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str(), file_id], map_poi)?;
            collect_rows(rows)
        })
    }

    pub fn pois_by_ids(&self, ids: &[i64]) -> Result<Vec<Poi>, StoreError> {
        self.with_conn(|conn| {
            let mut out = Vec::with_capacity(ids.len());
            let mut stmt = conn.prepare(
                "SELECT id, run_id, file_id, file_path, name, kind, start_line, end_line,
                        description, exported, semantic_id
                 FROM pois WHERE id = ?1",
            )?;
            for id in ids {
                if let Some(poi) = stmt.query_row(params![id], map_poi).optional()? {
                    out.push(poi);
                }
            }
            Ok(out)
        })
    }

    /// POIs for every file under `directory` (recursive). `.` or the
    /// empty string means the target root, i.e. every file of the run.
    pub fn pois_for_directory(
        &self,
        run_id: &RunId,
        directory: &str,
    ) -> Result<Vec<Poi>, StoreError> {
        let trimmed = directory.trim_end_matches('/');
        let prefix = if trimmed.is_empty() || trimmed == "." {
            "%".to_string()
        } else {
            format!("{trimmed}/%")
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, file_id, file_path, name, kind, start_line, end_line,
                        description, exported, semantic_id
                 FROM pois WHERE run_id = ?1 AND file_path LIKE ?2 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str(), prefix], map_poi)?;
            collect_rows(rows)
        })
    }

    pub fn poi_by_semantic_id(
        &self,
        run_id: &RunId,
        semantic_id: &str,
    ) -> Result<Option<Poi>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, run_id, file_id, file_path, name, kind, start_line, end_line,
                            description, exported, semantic_id
                     FROM pois WHERE run_id = ?1 AND semantic_id = ?2",
                    params![run_id.as_str(), semantic_id],
                    map_poi,
                )
                .optional()?)
        })
    }

    /// Fallback lookup by bare name, optionally scoped to a file.
    pub fn poi_by_name(
        &self,
        run_id: &RunId,
        file_path: Option<&str>,
        name: &str,
    ) -> Result<Option<Poi>, StoreError> {
        self.with_conn(|conn| {
            let found = match file_path {
                Some(file_path) => conn
                    .query_row(
                        "SELECT id, run_id, file_id, file_path, name, kind, start_line, end_line,
                                description, exported, semantic_id
                         FROM pois
                         WHERE run_id = ?1 AND file_path = ?2 AND name = ?3
                         ORDER BY id LIMIT 1",
                        params![run_id.as_str(), file_path, name],
                        map_poi,
                    )
                    .optional()?,
                None => conn
                    .query_row(
                        "SELECT id, run_id, file_id, file_path, name, kind, start_line, end_line,
                                description, exported, semantic_id
                         FROM pois
                         WHERE run_id = ?1 AND name = ?2
                         ORDER BY id LIMIT 1",
                        params![run_id.as_str(), name],
                        map_poi,
                    )
                    .optional()?,
            };
            Ok(found)
        })
    }

    pub fn update_poi_semantic_id(
        &self,
        poi_id: i64,
        semantic_id: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pois SET semantic_id = ?1 WHERE id = ?2",
                params![semantic_id, poi_id],
            )?;
            Ok(())
        })
    }

    /// All non-empty semantic ids of a run, for seeding the identity service.
    pub fn semantic_ids(&self, run_id: &RunId) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT semantic_id FROM pois WHERE run_id = ?1 AND semantic_id <> ''",
            )?;
            let rows = stmt.query_map(params![run_id.as_str()], |row| row.get(0))?;
            collect_rows(rows)
        })
    }

    pub fn poi_count(&self, run_id: &RunId) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pois WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    // ── relationships & evidence ───────────────────────────────────────

    pub fn relationship_by_fingerprint(
        &self,
        run_id: &RunId,
        fingerprint: &str,
    ) -> Result<Option<Relationship>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, run_id, source_poi_id, target_poi_id, kind, fingerprint,
                            confidence, status, resolution_level
                     FROM relationships WHERE run_id = ?1 AND fingerprint = ?2",
                    params![run_id.as_str(), fingerprint],
                    map_relationship,
                )
                .optional()?)
        })
    }

    pub fn relationships_by_status(
        &self,
        run_id: &RunId,
        status: RelationshipStatus,
    ) -> Result<Vec<Relationship>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, source_poi_id, target_poi_id, kind, fingerprint,
                        confidence, status, resolution_level
                 FROM relationships WHERE run_id = ?1 AND status = ?2 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id.as_str(), status.to_string()], map_relationship)?;
            collect_rows(rows)
        })
    }

    pub fn relationships_by_ids(&self, ids: &[i64]) -> Result<Vec<Relationship>, StoreError> {
        self.with_conn(|conn| {
            let mut out = Vec::with_capacity(ids.len());
            let mut stmt = conn.prepare(
                "SELECT id, run_id, source_poi_id, target_poi_id, kind, fingerprint,
                        confidence, status, resolution_level
                 FROM relationships WHERE id = ?1",
            )?;
            for id in ids {
                if let Some(rel) = stmt.query_row(params![id], map_relationship).optional()? {
                    out.push(rel);
                }
            }
            Ok(out)
        })
    }

    /// Move a PENDING relationship to a terminal status.
    ///
    /// Returns `false` when the row was already terminal: the guard that
    /// makes terminal statuses monotone under evidence replay.
    pub fn update_relationship_by_fingerprint(
        &self,
        run_id: &RunId,
        fingerprint: &str,
        status: RelationshipStatus,
        confidence: f64,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE relationships
                 SET status = ?1, confidence = ?2
                 WHERE run_id = ?3 AND fingerprint = ?4 AND status = 'PENDING'",
                params![status.to_string(), confidence, run_id.as_str(), fingerprint],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn evidence_for(
        &self,
        run_id: &RunId,
        fingerprint: &str,
    ) -> Result<Vec<EvidencePayload>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM relationship_evidence
                 WHERE run_id = ?1 AND fingerprint = ?2 ORDER BY id",
            )?;
            let raw: Vec<String> = collect_rows(
                stmt.query_map(params![run_id.as_str(), fingerprint], |row| row.get(0))?,
            )?;
            raw.iter()
                .map(|payload| serde_json::from_str(payload).map_err(StoreError::from))
                .collect()
        })
    }

    pub fn relationship_count_by_status(
        &self,
        run_id: &RunId,
        status: RelationshipStatus,
    ) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM relationships WHERE run_id = ?1 AND status = ?2",
                params![run_id.as_str(), status.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    // ── outbox ─────────────────────────────────────────────────────────

    /// Claim up to `limit` PENDING outbox rows, marking them IN_PROGRESS.
    /// Rows come back in id order, which is per-kind order a fortiori.
    pub fn claim_outbox_batch(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        self.in_transaction(|tx| {
            let mut stmt = tx.prepare(
                "UPDATE outbox SET status = 'IN_PROGRESS'
                 WHERE id IN (
                     SELECT id FROM outbox WHERE status = 'PENDING' ORDER BY id LIMIT ?1
                 )
                 RETURNING id, run_id, kind, payload, status, created_at",
            )?;
            let rows = stmt.query_map(params![limit as i64], map_outbox)?;
            let mut events = collect_rows(rows)?;
            events.sort_by_key(|e: &OutboxEvent| e.id);
            Ok(events)
        })
    }

    pub fn mark_outbox(
        &self,
        id: i64,
        status: OutboxStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox SET status = ?1, reason = ?2 WHERE id = ?3",
                params![status.to_string(), reason, id],
            )?;
            Ok(())
        })
    }

    pub fn pending_outbox_count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM outbox WHERE status IN ('PENDING', 'IN_PROGRESS')",
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Return orphaned IN_PROGRESS claims to PENDING. Called at startup:
    /// a crash between claim and mark leaves rows claimed by a publisher
    /// that no longer exists.
    pub fn recover_in_progress_outbox(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE outbox SET status = 'PENDING' WHERE status = 'IN_PROGRESS'",
                [],
            )?;
            Ok(n)
        })
    }

    // ── run stats & cleanup ────────────────────────────────────────────

    pub fn record_jobs_created(&self, run_id: &RunId, n: u64) -> Result<(), StoreError> {
        self.bump_stats(run_id, n as i64, 0, 0)
    }

    pub fn record_job_completed(&self, run_id: &RunId) -> Result<(), StoreError> {
        self.bump_stats(run_id, 0, 1, 0)
    }

    pub fn record_job_failed(&self, run_id: &RunId) -> Result<(), StoreError> {
        self.bump_stats(run_id, 0, 0, 1)
    }

    fn bump_stats(
        &self,
        run_id: &RunId,
        created: i64,
        completed: i64,
        failed: i64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO run_stats (run_id, jobs_created, jobs_completed, jobs_failed, last_activity)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (run_id) DO UPDATE SET
                     jobs_created = jobs_created + excluded.jobs_created,
                     jobs_completed = jobs_completed + excluded.jobs_completed,
                     jobs_failed = jobs_failed + excluded.jobs_failed,
                     last_activity = excluded.last_activity",
                params![run_id.as_str(), created, completed, failed, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn mark_deadlocked(&self, run_id: &RunId) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO run_stats (run_id, deadlocked) VALUES (?1, 1)
                 ON CONFLICT (run_id) DO UPDATE SET deadlocked = 1",
                params![run_id.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn run_stats(&self, run_id: &RunId) -> Result<RunStats, StoreError> {
        self.with_conn(|conn| {
            let stats = conn
                .query_row(
                    "SELECT jobs_created, jobs_completed, jobs_failed, last_activity, deadlocked
                     FROM run_stats WHERE run_id = ?1",
                    params![run_id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;
            match stats {
                None => Ok(RunStats::default()),
                Some((created, completed, failed, last, deadlocked)) => Ok(RunStats {
                    jobs_created: created as u64,
                    jobs_completed: completed as u64,
                    jobs_failed: failed as u64,
                    last_activity: last.and_then(|s| parse_timestamp(&s).ok()),
                    deadlocked: deadlocked != 0,
                }),
            }
        })
    }

    /// Dependency probe: write, read back, and delete a synthetic stats
    /// row inside one transaction.
    pub fn health_check(&self) -> Result<(), StoreError> {
        self.in_transaction(|tx| {
            tx.execute(
                "INSERT INTO run_stats (run_id, jobs_created) VALUES ('__health__', 1)
                 ON CONFLICT (run_id) DO UPDATE SET jobs_created = jobs_created + 1",
                [],
            )?;
            let created: i64 = tx.query_row(
                "SELECT jobs_created FROM run_stats WHERE run_id = '__health__'",
                [],
                |row| row.get(0),
            )?;
            if created < 1 {
                return Err(StoreError::Corrupt("health roundtrip lost a write".to_string()));
            }
            tx.execute("DELETE FROM run_stats WHERE run_id = '__health__'", [])?;
            Ok(())
        })
    }

    /// Remove every row belonging to `run_id`. POIs and relationships go
    /// via the file cascade; evidence, outbox, summaries, and stats are
    /// deleted directly.
    pub fn clear_run(&self, run_id: &RunId) -> Result<(), StoreError> {
        self.in_transaction(|tx| {
            tx.execute(
                "DELETE FROM files WHERE run_id = ?1",
                params![run_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM relationship_evidence WHERE run_id = ?1",
                params![run_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM outbox WHERE run_id = ?1",
                params![run_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM directory_summaries WHERE run_id = ?1",
                params![run_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM run_stats WHERE run_id = ?1",
                params![run_id.as_str()],
            )?;
            Ok(())
        })
    }
}

/// Transaction-scoped write helpers.
///
/// Every function takes a `&Connection` so it composes inside
/// [`Store::in_transaction`] (a `Transaction` derefs to `Connection`).
pub mod ops {
    use super::*;

    /// Insert a batch of POIs for one file, returning row ids in input order.
    pub fn insert_pois(
        conn: &Connection,
        run_id: &RunId,
        file_id: i64,
        file_path: &str,
        pois: &[NewPoi],
    ) -> Result<Vec<i64>, StoreError> {
        let mut ids = Vec::with_capacity(pois.len());
        let mut stmt = conn.prepare_cached(
            "INSERT INTO pois (run_id, file_id, file_path, name, kind, start_line, end_line,
                               description, exported, semantic_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (run_id, file_id, name, kind, start_line) DO UPDATE SET
                 end_line = excluded.end_line,
                 description = excluded.description,
                 exported = excluded.exported
             RETURNING id",
        )?;
        for poi in pois {
            let id: i64 = stmt.query_row(
                params![
                    run_id.as_str(),
                    file_id,
                    file_path,
                    poi.name,
                    poi.kind.to_string(),
                    poi.start_line,
                    poi.end_line,
                    poi.description,
                    poi.exported,
                    poi.semantic_id,
                ],
                |row| row.get(0),
            )?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Insert or refresh a relationship row.
    ///
    /// The resolution level only ever widens (`file < directory < global`);
    /// status and confidence are untouched here: those move exclusively
    /// through reconciliation.
    pub fn upsert_relationship(
        conn: &Connection,
        run_id: &RunId,
        source_poi_id: i64,
        target_poi_id: i64,
        kind: RelationshipKind,
        fingerprint: &str,
        level: ResolutionLevel,
    ) -> Result<i64, StoreError> {
        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, resolution_level FROM relationships
                 WHERE run_id = ?1 AND fingerprint = ?2",
                params![run_id.as_str(), fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((id, current)) => {
                let current: ResolutionLevel = current
                    .parse()
                    .map_err(|_| StoreError::Corrupt(format!("resolution level '{current}'")))?;
                if level > current {
                    conn.execute(
                        "UPDATE relationships SET resolution_level = ?1 WHERE id = ?2",
                        params![level.to_string(), id],
                    )?;
                }
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO relationships
                         (run_id, source_poi_id, target_poi_id, kind, fingerprint,
                          confidence, status, resolution_level)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, 'PENDING', ?6)",
                    params![
                        run_id.as_str(),
                        source_poi_id,
                        target_poi_id,
                        kind.to_string(),
                        fingerprint,
                        level.to_string(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    /// Append one evidence observation.
    pub fn insert_evidence(
        conn: &Connection,
        run_id: &RunId,
        fingerprint: &str,
        payload: &EvidencePayload,
    ) -> Result<i64, StoreError> {
        conn.execute(
            "INSERT INTO relationship_evidence (run_id, fingerprint, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                run_id.as_str(),
                fingerprint,
                serde_json::to_string(payload)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Append an outbox event. Must be called inside the same transaction
    /// that writes the business data the payload describes.
    pub fn insert_outbox(
        conn: &Connection,
        run_id: &RunId,
        kind: OutboxEventKind,
        payload: &serde_json::Value,
    ) -> Result<i64, StoreError> {
        conn.execute(
            "INSERT INTO outbox (run_id, kind, payload, status, created_at)
             VALUES (?1, ?2, ?3, 'PENDING', ?4)",
            params![
                run_id.as_str(),
                kind.to_string(),
                payload.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record the directory summary produced by aggregation.
    pub fn upsert_directory_summary(
        conn: &Connection,
        run_id: &RunId,
        directory: &str,
        summary: &str,
        poi_count: u32,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO directory_summaries (run_id, directory, summary, poi_count)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (run_id, directory) DO UPDATE SET
                 summary = excluded.summary,
                 poi_count = excluded.poi_count",
            params![run_id.as_str(), directory, summary, poi_count],
        )?;
        Ok(())
    }
}

// ── row mapping ────────────────────────────────────────────────────────

fn collect_rows<T>(
    rows: impl Iterator<Item = Result<T, rusqlite::Error>>,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{raw}': {e}")))
}

fn parse_enum<T: std::str::FromStr>(raw: String, what: &str) -> Result<T, rusqlite::Error> {
    raw.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("bad {what}: '{raw}'").into(),
        )
    })
}

fn map_poi(row: &rusqlite::Row<'_>) -> Result<Poi, rusqlite::Error> {
    Ok(Poi {
        id: row.get(0)?,
        run_id: RunId::from_string(row.get::<_, String>(1)?),
        file_id: row.get(2)?,
        file_path: row.get(3)?,
        name: row.get(4)?,
        kind: parse_enum(row.get::<_, String>(5)?, "poi kind")?,
        start_line: row.get(6)?,
        end_line: row.get(7)?,
        description: row.get(8)?,
        exported: row.get(9)?,
        semantic_id: row.get(10)?,
    })
}

fn map_relationship(row: &rusqlite::Row<'_>) -> Result<Relationship, rusqlite::Error> {
    Ok(Relationship {
        id: row.get(0)?,
        run_id: RunId::from_string(row.get::<_, String>(1)?),
        source_poi_id: row.get(2)?,
        target_poi_id: row.get(3)?,
        kind: parse_enum(row.get::<_, String>(4)?, "relationship kind")?,
        fingerprint: row.get(5)?,
        confidence: row.get(6)?,
        status: parse_enum(row.get::<_, String>(7)?, "relationship status")?,
        resolution_level: parse_enum(row.get::<_, String>(8)?, "resolution level")?,
    })
}

fn map_outbox(row: &rusqlite::Row<'_>) -> Result<OutboxEvent, rusqlite::Error> {
    let created_raw: String = row.get(5)?;
    Ok(OutboxEvent {
        id: row.get(0)?,
        run_id: RunId::from_string(row.get::<_, String>(1)?),
        kind: parse_enum(row.get::<_, String>(2)?, "outbox kind")?,
        payload: serde_json::from_str(&row.get::<_, String>(3)?).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?,
        status: parse_enum(row.get::<_, String>(4)?, "outbox status")?,
        created_at: DateTime::parse_from_rfc3339(&created_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use codegraph_types::relationship_fingerprint;

    fn seed_file(store: &Store, run: &RunId) -> i64 {
        store.upsert_file(run, "src/util.js", "hash-1").unwrap()
    }

    fn new_poi(name: &str, semantic_id: &str) -> NewPoi {
        NewPoi {
            name: name.to_string(),
            kind: PoiKind::Function,
            start_line: 1,
            end_line: 3,
            description: String::new(),
            exported: true,
            semantic_id: semantic_id.to_string(),
        }
    }

    #[test]
    fn upsert_file_is_idempotent_per_run() {
        let store = Store::open_in_memory().unwrap();
        let run = RunId::from_string("r1");
        let a = store.upsert_file(&run, "a.js", "h1").unwrap();
        let b = store.upsert_file(&run, "a.js", "h2").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.file_count(&run, None).unwrap(), 1);
        assert_eq!(store.latest_hash_for_path("a.js").unwrap().as_deref(), Some("h2"));
    }

    #[test]
    fn poi_batch_and_outbox_commit_atomically() {
        let store = Store::open_in_memory().unwrap();
        let run = RunId::from_string("r1");
        let file_id = seed_file(&store, &run);

        let result: Result<(), StoreError> = store.in_transaction(|tx| {
            ops::insert_pois(tx, &run, file_id, "src/util.js", &[new_poi("add", "util_func_add")])?;
            ops::insert_outbox(tx, &run, OutboxEventKind::PoiBatch, &serde_json::json!({"file_id": file_id}))?;
            Err(StoreError::Corrupt("simulated failure".to_string()))
        });
        assert!(result.is_err());
        // Rollback removed both the POIs and the outbox row.
        assert_eq!(store.poi_count(&run).unwrap(), 0);
        assert_eq!(store.pending_outbox_count().unwrap(), 0);

        store
            .in_transaction(|tx| {
                ops::insert_pois(tx, &run, file_id, "src/util.js", &[new_poi("add", "util_func_add")])?;
                ops::insert_outbox(tx, &run, OutboxEventKind::PoiBatch, &serde_json::json!({"file_id": file_id}))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.poi_count(&run).unwrap(), 1);
        assert_eq!(store.pending_outbox_count().unwrap(), 1);
    }

    #[test]
    fn claim_outbox_marks_in_progress_in_id_order() {
        let store = Store::open_in_memory().unwrap();
        let run = RunId::from_string("r1");
        store
            .in_transaction(|tx| {
                for i in 0..5 {
                    ops::insert_outbox(tx, &run, OutboxEventKind::RelEvidence, &serde_json::json!({"i": i}))?;
                }
                Ok(())
            })
            .unwrap();

        let first = store.claim_outbox_batch(3).unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.windows(2).all(|w| w[0].id < w[1].id));
        assert!(first.iter().all(|e| e.status == OutboxStatus::InProgress));

        let second = store.claim_outbox_batch(10).unwrap();
        assert_eq!(second.len(), 2);
        assert!(second[0].id > first[2].id);

        // Nothing left to claim.
        assert!(store.claim_outbox_batch(10).unwrap().is_empty());
        // IN_PROGRESS rows still count as not-yet-settled.
        assert_eq!(store.pending_outbox_count().unwrap(), 5);

        for event in first.iter().chain(second.iter()) {
            store.mark_outbox(event.id, OutboxStatus::Processed, None).unwrap();
        }
        assert_eq!(store.pending_outbox_count().unwrap(), 0);
    }

    #[test]
    fn recover_returns_orphaned_claims() {
        let store = Store::open_in_memory().unwrap();
        let run = RunId::from_string("r1");
        store
            .in_transaction(|tx| {
                ops::insert_outbox(tx, &run, OutboxEventKind::PoiBatch, &serde_json::json!({}))
                    .map(|_| ())
            })
            .unwrap();
        store.claim_outbox_batch(1).unwrap();
        assert_eq!(store.recover_in_progress_outbox().unwrap(), 1);
        assert_eq!(store.claim_outbox_batch(1).unwrap().len(), 1);
    }

    #[test]
    fn relationship_status_is_monotone() {
        let store = Store::open_in_memory().unwrap();
        let run = RunId::from_string("r1");
        let file_id = seed_file(&store, &run);
        let fp = relationship_fingerprint("util_func_add", "util_func_mul", RelationshipKind::Calls);

        let (source, target) = store
            .in_transaction(|tx| {
                let ids = ops::insert_pois(
                    tx,
                    &run,
                    file_id,
                    "src/util.js",
                    &[new_poi("add", "util_func_add"), new_poi("mul", "util_func_mul")],
                )?;
                ops::upsert_relationship(
                    tx, &run, ids[0], ids[1], RelationshipKind::Calls, &fp, ResolutionLevel::File,
                )?;
                Ok((ids[0], ids[1]))
            })
            .unwrap();
        let _ = (source, target);

        assert!(store
            .update_relationship_by_fingerprint(&run, &fp, RelationshipStatus::Validated, 0.9)
            .unwrap());
        // A second decision (replayed evidence) is a no-op.
        assert!(!store
            .update_relationship_by_fingerprint(&run, &fp, RelationshipStatus::Discarded, 0.1)
            .unwrap());
        let rel = store.relationship_by_fingerprint(&run, &fp).unwrap().unwrap();
        assert_eq!(rel.status, RelationshipStatus::Validated);
        assert!((rel.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn resolution_level_only_widens() {
        let store = Store::open_in_memory().unwrap();
        let run = RunId::from_string("r1");
        let file_id = seed_file(&store, &run);
        let fp = relationship_fingerprint("a", "b", RelationshipKind::Uses);

        store
            .in_transaction(|tx| {
                let ids = ops::insert_pois(
                    tx,
                    &run,
                    file_id,
                    "src/util.js",
                    &[new_poi("a", "util_func_a"), new_poi("b", "util_func_b")],
                )?;
                ops::upsert_relationship(
                    tx, &run, ids[0], ids[1], RelationshipKind::Uses, &fp, ResolutionLevel::Directory,
                )?;
                // A later file-level observation must not narrow the level.
                ops::upsert_relationship(
                    tx, &run, ids[0], ids[1], RelationshipKind::Uses, &fp, ResolutionLevel::File,
                )?;
                Ok(())
            })
            .unwrap();
        let rel = store.relationship_by_fingerprint(&run, &fp).unwrap().unwrap();
        assert_eq!(rel.resolution_level, ResolutionLevel::Directory);
    }

    #[test]
    fn evidence_round_trips_and_accumulates() {
        let store = Store::open_in_memory().unwrap();
        let run = RunId::from_string("r1");
        let fp = "fp-1";
        let payload = EvidencePayload {
            from: "util_func_add".to_string(),
            to: "util_func_mul".to_string(),
            kind: RelationshipKind::Calls,
            confidence: Some(0.7),
            synthetic: false,
            factors: None,
            reason: None,
            resolution_level: ResolutionLevel::File,
        };
        store
            .in_transaction(|tx| {
                ops::insert_evidence(tx, &run, fp, &payload)?;
                ops::insert_evidence(tx, &run, fp, &payload)?;
                Ok(())
            })
            .unwrap();
        let rows = store.evidence_for(&run, fp).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].confidence, Some(0.7));
    }

    #[test]
    fn clear_run_cascades_to_pois() {
        let store = Store::open_in_memory().unwrap();
        let run = RunId::from_string("r1");
        let other = RunId::from_string("r2");
        let file_id = seed_file(&store, &run);
        store.upsert_file(&other, "keep.js", "h").unwrap();
        store
            .in_transaction(|tx| {
                ops::insert_pois(tx, &run, file_id, "src/util.js", &[new_poi("add", "util_func_add")])
                    .map(|_| ())
            })
            .unwrap();

        store.clear_run(&run).unwrap();
        assert_eq!(store.poi_count(&run).unwrap(), 0);
        assert_eq!(store.file_count(&run, None).unwrap(), 0);
        assert_eq!(store.file_count(&other, None).unwrap(), 1);
    }

    #[test]
    fn run_stats_accumulate() {
        let store = Store::open_in_memory().unwrap();
        let run = RunId::from_string("r1");
        store.record_jobs_created(&run, 4).unwrap();
        store.record_job_completed(&run).unwrap();
        store.record_job_failed(&run).unwrap();
        let stats = store.run_stats(&run).unwrap();
        assert_eq!(stats.jobs_created, 4);
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.jobs_failed, 1);
        assert!(stats.last_activity.is_some());
        assert!(!stats.deadlocked);

        store.mark_deadlocked(&run).unwrap();
        assert!(store.run_stats(&run).unwrap().deadlocked);
    }

    #[test]
    fn semantic_lookup_prefers_exact_then_name() {
        let store = Store::open_in_memory().unwrap();
        let run = RunId::from_string("r1");
        let file_id = seed_file(&store, &run);
        store
            .in_transaction(|tx| {
                ops::insert_pois(tx, &run, file_id, "src/util.js", &[new_poi("add", "util_func_add")])
                    .map(|_| ())
            })
            .unwrap();

        let by_sid = store.poi_by_semantic_id(&run, "util_func_add").unwrap();
        assert!(by_sid.is_some());
        let by_name = store.poi_by_name(&run, None, "add").unwrap();
        assert_eq!(by_name.unwrap().id, by_sid.unwrap().id);
        assert!(store.poi_by_semantic_id(&run, "nope").unwrap().is_none());
    }

    #[test]
    fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codegraph.db");
        let run = RunId::from_string("r1");
        {
            let store = Store::open(&path).unwrap();
            store.upsert_file(&run, "a.js", "h1").unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.file_count(&run, None).unwrap(), 1);
        assert_eq!(store.path(), Some(path.as_path()));
    }
}
