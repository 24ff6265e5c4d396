//! File discovery agent.
//!
//! Walks the target directory, filters by extension allowlist and glob
//! denylist (version-control metadata, dependency trees, binaries), caps
//! file size, hashes content with blake3, and seeds the `file-analysis`
//! queue. A file whose hash matches the most recent record for the same
//! path is skipped entirely: re-running a completed run over an
//! unchanged target enqueues nothing.
//!
//! Priority is inversely proportional to file size so small files clear
//! the LLM first and unblock the later stages.

use std::collections::BTreeMap;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use thiserror::Error;

use codegraph_queue::{JobOptions, JobQueue, QueueError};
use codegraph_store::{Store, StoreError};
use codegraph_types::{FileAnalysisJob, RunId};

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("target directory '{0}' does not exist or is not a directory")]
    BadTarget(Utf8PathBuf),

    #[error("invalid deny glob '{glob}': {reason}")]
    BadGlob { glob: String, reason: String },

    #[error("IO error under '{path}': {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Discovery filters.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Extensions (without dots) that get analyzed.
    pub allowed_extensions: Vec<String>,
    /// Glob denylist matched against target-relative paths.
    pub denied_globs: Vec<String>,
    /// Files larger than this many bytes are skipped.
    pub max_file_size: u64,
    /// Retry budget stamped onto seeded jobs.
    pub job_attempts: u32,
    /// Base backoff stamped onto seeded jobs, milliseconds.
    pub job_backoff_ms: u64,
}

/// Outcome counters for one discovery pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryStats {
    pub jobs_enqueued: u64,
    pub skipped_unchanged: u64,
    pub skipped_filtered: u64,
    pub skipped_too_large: u64,
    pub by_extension: BTreeMap<String, u64>,
}

/// The discovery agent. Borrows its collaborators; one pass per run.
pub struct FileDiscoveryAgent<'a> {
    store: &'a Store,
    queue: &'a JobQueue,
    config: DiscoveryConfig,
    deny: GlobSet,
}

impl<'a> FileDiscoveryAgent<'a> {
    pub fn new(
        store: &'a Store,
        queue: &'a JobQueue,
        config: DiscoveryConfig,
    ) -> Result<Self, DiscoveryError> {
        let mut builder = GlobSetBuilder::new();
        for glob in &config.denied_globs {
            let compiled = Glob::new(glob).map_err(|e| DiscoveryError::BadGlob {
                glob: glob.clone(),
                reason: e.to_string(),
            })?;
            builder.add(compiled);
        }
        let deny = builder.build().map_err(|e| DiscoveryError::BadGlob {
            glob: "<set>".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            store,
            queue,
            config,
            deny,
        })
    }

    /// Walk `target` and seed the analysis queue. Returns the stats that
    /// feed the final report.
    pub fn discover(
        &self,
        run_id: &RunId,
        target: &Utf8Path,
    ) -> Result<DiscoveryStats, DiscoveryError> {
        if !target.is_dir() {
            return Err(DiscoveryError::BadTarget(target.to_owned()));
        }
        let mut stats = DiscoveryStats::default();
        self.walk(run_id, target, target, &mut stats)?;
        self.store.record_jobs_created(run_id, stats.jobs_enqueued)?;
        tracing::info!(
            jobs = stats.jobs_enqueued,
            unchanged = stats.skipped_unchanged,
            filtered = stats.skipped_filtered,
            "discovery complete"
        );
        Ok(stats)
    }

    fn walk(
        &self,
        run_id: &RunId,
        root: &Utf8Path,
        dir: &Utf8Path,
        stats: &mut DiscoveryStats,
    ) -> Result<(), DiscoveryError> {
        let entries = std::fs::read_dir(dir).map_err(|source| DiscoveryError::Io {
            path: dir.to_owned(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| DiscoveryError::Io {
                path: dir.to_owned(),
                source,
            })?;
            let path = match Utf8PathBuf::from_path_buf(entry.path()) {
                Ok(path) => path,
                Err(_) => continue, // non-UTF-8 names are not analyzable
            };
            let rel = path
                .strip_prefix(root)
                .unwrap_or(path.as_path())
                .to_owned();
            if self.deny.is_match(Path::new(rel.as_str())) {
                stats.skipped_filtered += 1;
                continue;
            }
            let file_type = entry.file_type().map_err(|source| DiscoveryError::Io {
                path: path.clone(),
                source,
            })?;
            if file_type.is_dir() {
                self.walk(run_id, root, &path, stats)?;
            } else if file_type.is_file() {
                self.consider_file(run_id, &path, &rel, stats)?;
            }
        }
        Ok(())
    }

    fn consider_file(
        &self,
        run_id: &RunId,
        abs: &Utf8Path,
        rel: &Utf8Path,
        stats: &mut DiscoveryStats,
    ) -> Result<(), DiscoveryError> {
        let Some(ext) = abs.extension() else {
            stats.skipped_filtered += 1;
            return Ok(());
        };
        if !self
            .config
            .allowed_extensions
            .iter()
            .any(|allowed| allowed == ext)
        {
            stats.skipped_filtered += 1;
            return Ok(());
        }

        let metadata = std::fs::metadata(abs).map_err(|source| DiscoveryError::Io {
            path: abs.to_owned(),
            source,
        })?;
        if metadata.len() > self.config.max_file_size {
            stats.skipped_too_large += 1;
            return Ok(());
        }

        let content = std::fs::read(abs).map_err(|source| DiscoveryError::Io {
            path: abs.to_owned(),
            source,
        })?;
        let hash = blake3::hash(&content).to_hex().to_string();

        if self.store.latest_hash_for_path(rel.as_str())? == Some(hash.clone()) {
            stats.skipped_unchanged += 1;
            return Ok(());
        }

        let file_id = self.store.upsert_file(run_id, rel.as_str(), &hash)?;
        let job = FileAnalysisJob {
            run_id: run_id.clone(),
            file_id,
            path: rel.as_str().to_string(),
            content_hash: hash,
        };
        self.queue.enqueue(
            &job,
            JobOptions {
                priority: size_priority(metadata.len()),
                max_attempts: self.config.job_attempts,
                backoff_ms: self.config.job_backoff_ms,
            },
        )?;

        stats.jobs_enqueued += 1;
        *stats.by_extension.entry(ext.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

/// Smaller files get a higher priority. The curve only needs to be
/// monotone: exact values are irrelevant as long as ordering holds.
#[must_use]
pub fn size_priority(size_bytes: u64) -> i32 {
    let kib = (size_bytes / 1024).min(1023);
    (1024 - kib) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> DiscoveryConfig {
        DiscoveryConfig {
            allowed_extensions: vec!["js".to_string(), "py".to_string()],
            denied_globs: vec!["**/node_modules/**".to_string(), "**/.git/**".to_string()],
            max_file_size: 4096,
            job_attempts: 3,
            job_backoff_ms: 100,
        }
    }

    fn queue() -> JobQueue {
        JobQueue::new(
            "file-analysis",
            Duration::from_secs(30),
            1000,
            Duration::from_secs(3600),
        )
    }

    fn write(dir: &std::path::Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn seeds_jobs_for_allowed_files_only() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "util.js", "function add(a,b){return a+b}");
        write(dir.path(), "readme.md", "# docs");
        write(dir.path(), "node_modules/dep/index.js", "junk");
        write(dir.path(), ".git/config", "bare");

        let store = Store::open_in_memory().unwrap();
        let q = queue();
        let agent = FileDiscoveryAgent::new(&store, &q, config()).unwrap();
        let run = RunId::from_string("r1");

        let stats = agent
            .discover(&run, Utf8Path::from_path(dir.path()).unwrap())
            .unwrap();
        assert_eq!(stats.jobs_enqueued, 1);
        assert_eq!(stats.by_extension["js"], 1);
        assert!(stats.skipped_filtered >= 2);
        assert_eq!(q.counts().unwrap().waiting, 1);

        let job = q
            .reserve("w", 1, Duration::from_millis(10))
            .await
            .unwrap()
            .remove(0);
        let payload: FileAnalysisJob = serde_json::from_value(job.payload).unwrap();
        assert_eq!(payload.path, "util.js");
        assert_eq!(store.file_count(&run, None).unwrap(), 1);
    }

    #[tokio::test]
    async fn unchanged_rerun_enqueues_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "util.js", "function add(a,b){return a+b}");

        let store = Store::open_in_memory().unwrap();
        let q = queue();
        let agent = FileDiscoveryAgent::new(&store, &q, config()).unwrap();

        let first = agent
            .discover(
                &RunId::from_string("r1"),
                Utf8Path::from_path(dir.path()).unwrap(),
            )
            .unwrap();
        assert_eq!(first.jobs_enqueued, 1);

        let second = agent
            .discover(
                &RunId::from_string("r2"),
                Utf8Path::from_path(dir.path()).unwrap(),
            )
            .unwrap();
        assert_eq!(second.jobs_enqueued, 0);
        assert_eq!(second.skipped_unchanged, 1);

        // Content change re-seeds.
        write(dir.path(), "util.js", "function add(a,b){return b+a}");
        let third = agent
            .discover(
                &RunId::from_string("r3"),
                Utf8Path::from_path(dir.path()).unwrap(),
            )
            .unwrap();
        assert_eq!(third.jobs_enqueued, 1);
    }

    #[tokio::test]
    async fn oversized_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "big.js", &"x".repeat(5000));
        let store = Store::open_in_memory().unwrap();
        let q = queue();
        let agent = FileDiscoveryAgent::new(&store, &q, config()).unwrap();

        let stats = agent
            .discover(
                &RunId::from_string("r1"),
                Utf8Path::from_path(dir.path()).unwrap(),
            )
            .unwrap();
        assert_eq!(stats.jobs_enqueued, 0);
        assert_eq!(stats.skipped_too_large, 1);
    }

    #[tokio::test]
    async fn smaller_files_reserve_first() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "big.py", &"# pad\n".repeat(500));
        write(dir.path(), "small.py", "def f():\n    pass\n");

        let store = Store::open_in_memory().unwrap();
        let q = queue();
        let agent = FileDiscoveryAgent::new(&store, &q, config()).unwrap();
        agent
            .discover(
                &RunId::from_string("r1"),
                Utf8Path::from_path(dir.path()).unwrap(),
            )
            .unwrap();

        let jobs = q.reserve("w", 2, Duration::from_millis(10)).await.unwrap();
        let first: FileAnalysisJob = serde_json::from_value(jobs[0].payload.clone()).unwrap();
        assert_eq!(first.path, "small.py");
    }

    #[test]
    fn size_priority_is_monotone() {
        assert!(size_priority(100) > size_priority(100_000));
        assert!(size_priority(0) <= 1024);
        assert!(size_priority(u64::MAX) >= 1);
    }

    #[test]
    fn missing_target_is_an_error() {
        let store = Store::open_in_memory().unwrap();
        let q = queue();
        let agent = FileDiscoveryAgent::new(&store, &q, config()).unwrap();
        let err = agent
            .discover(&RunId::from_string("r1"), Utf8Path::new("/no/such/dir"))
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::BadTarget(_)));
    }
}
