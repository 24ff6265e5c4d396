//! Schema migrations and connection pragmas.

use rusqlite::Connection;

use crate::StoreError;

/// Current schema version. Bump together with [`MIGRATIONS`].
pub const SCHEMA_VERSION: i64 = 1;

/// Idempotent schema DDL. `files → pois` cascades so a file's POIs die with
/// it; relationships cascade from their endpoint POIs. Evidence is keyed by
/// fingerprint only: it survives reconciliation for audit and is removed
/// by run-level cleanup.
const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id            INTEGER PRIMARY KEY,
    run_id        TEXT NOT NULL,
    path          TEXT NOT NULL,
    content_hash  TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'pending',
    UNIQUE (run_id, path)
);

CREATE TABLE IF NOT EXISTS pois (
    id           INTEGER PRIMARY KEY,
    run_id       TEXT NOT NULL,
    file_id      INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    file_path    TEXT NOT NULL,
    name         TEXT NOT NULL,
    kind         TEXT NOT NULL,
    start_line   INTEGER NOT NULL,
    end_line     INTEGER NOT NULL,
    description  TEXT NOT NULL DEFAULT '',
    exported     INTEGER NOT NULL DEFAULT 0,
    semantic_id  TEXT NOT NULL DEFAULT '',
    UNIQUE (run_id, file_id, name, kind, start_line)
);

CREATE UNIQUE INDEX IF NOT EXISTS pois_semantic_unique
    ON pois (run_id, semantic_id) WHERE semantic_id <> '';

CREATE INDEX IF NOT EXISTS pois_by_name
    ON pois (run_id, file_path, name);

CREATE TABLE IF NOT EXISTS relationships (
    id                INTEGER PRIMARY KEY,
    run_id            TEXT NOT NULL,
    source_poi_id     INTEGER NOT NULL REFERENCES pois(id) ON DELETE CASCADE,
    target_poi_id     INTEGER NOT NULL REFERENCES pois(id) ON DELETE CASCADE,
    kind              TEXT NOT NULL,
    fingerprint       TEXT NOT NULL,
    confidence        REAL NOT NULL DEFAULT 0,
    status            TEXT NOT NULL DEFAULT 'PENDING',
    resolution_level  TEXT NOT NULL DEFAULT 'file',
    UNIQUE (run_id, fingerprint)
);

CREATE TABLE IF NOT EXISTS relationship_evidence (
    id           INTEGER PRIMARY KEY,
    run_id       TEXT NOT NULL,
    fingerprint  TEXT NOT NULL,
    payload      TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS evidence_by_fingerprint
    ON relationship_evidence (run_id, fingerprint);

CREATE TABLE IF NOT EXISTS outbox (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL,
    kind        TEXT NOT NULL,
    payload     TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'PENDING',
    reason      TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS outbox_pending
    ON outbox (status, id);

CREATE TABLE IF NOT EXISTS directory_summaries (
    id         INTEGER PRIMARY KEY,
    run_id     TEXT NOT NULL,
    directory  TEXT NOT NULL,
    summary    TEXT NOT NULL DEFAULT '',
    poi_count  INTEGER NOT NULL DEFAULT 0,
    UNIQUE (run_id, directory)
);

CREATE TABLE IF NOT EXISTS run_stats (
    run_id          TEXT PRIMARY KEY,
    jobs_created    INTEGER NOT NULL DEFAULT 0,
    jobs_completed  INTEGER NOT NULL DEFAULT 0,
    jobs_failed     INTEGER NOT NULL DEFAULT 0,
    last_activity   TEXT,
    deadlocked      INTEGER NOT NULL DEFAULT 0
);
"#;

/// Apply pragmas for the pipeline's durability profile: WAL with NORMAL
/// synchronous, a 10-second busy wait for the single-writer discipline,
/// and enforced foreign keys for the cascade ownership rules.
pub fn apply_pragmas(conn: &Connection, file_backed: bool) -> Result<(), StoreError> {
    if file_backed {
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(10))?;
    Ok(())
}

/// Run migrations to the current schema version.
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }
    conn.execute_batch(MIGRATIONS)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}
