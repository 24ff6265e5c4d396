//! Best-effort breaker state persistence.
//!
//! Each breaker writes `cb-<name>.json` under the data directory via a
//! temp-file + fsync + atomic-rename sequence, so a crash mid-write never
//! leaves a torn file. On load, state older than one hour is discarded -
//! a circuit opened before a long downtime says nothing about the service
//! now.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::BreakerState;

/// Staleness horizon for loaded state.
const MAX_STATE_AGE_MS: i64 = 60 * 60 * 1000;

/// One recorded half-open test call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub success: bool,
    pub timestamp: i64,
}

/// The on-disk breaker snapshot. Durations are stored relative to
/// `timestamp` (milliseconds) so a restore can rebase them onto the new
/// process's clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedBreaker {
    pub state: BreakerState,
    pub failures: u32,
    #[serde(rename = "nextAttempt")]
    pub next_attempt_in_ms: Option<u64>,
    #[serde(rename = "recoveryAttempts")]
    pub recovery_attempts: u32,
    #[serde(rename = "currentRetryDelay")]
    pub current_retry_delay_ms: u64,
    #[serde(rename = "lastRecoveryAttempt")]
    pub last_recovery_attempt_ms_ago: Option<u64>,
    #[serde(rename = "recoveryTestRequests")]
    pub recovery_test_requests: Vec<ProbeRecord>,
    /// Snapshot wall-clock time, epoch milliseconds.
    pub timestamp: i64,
}

impl PersistedBreaker {
    pub(crate) fn from_runtime(
        state: BreakerState,
        failures: u32,
        next_attempt_in_ms: Option<u64>,
        recovery_attempts: u32,
        current_delay: Duration,
        last_recovery_attempt_ms_ago: Option<u64>,
        window: Vec<bool>,
    ) -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis();
        Self {
            state,
            failures,
            next_attempt_in_ms,
            recovery_attempts,
            current_retry_delay_ms: current_delay.as_millis() as u64,
            last_recovery_attempt_ms_ago,
            recovery_test_requests: window
                .into_iter()
                .map(|success| ProbeRecord { success, timestamp })
                .collect(),
            timestamp,
        }
    }

    fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.timestamp)
    }
}

fn state_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("cb-{name}.json"))
}

/// Write a breaker snapshot atomically.
pub fn persist_state(
    dir: &Path,
    name: &str,
    snapshot: &PersistedBreaker,
) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    temp.write_all(json.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(state_path(dir, name))
        .map_err(|e| e.error)?;
    Ok(())
}

/// Load a breaker snapshot. Returns `Ok(None)` when no file exists, the
/// file is unreadable, or the snapshot is stale.
pub fn load_state(dir: &Path, name: &str) -> std::io::Result<Option<PersistedBreaker>> {
    let path = state_path(dir, name);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let snapshot: PersistedBreaker = match serde_json::from_str(&raw) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "discarding unreadable breaker state");
            return Ok(None);
        }
    };
    let now_ms = chrono::Utc::now().timestamp_millis();
    if snapshot.age_ms(now_ms) > MAX_STATE_AGE_MS {
        tracing::info!(path = %path.display(), "discarding stale breaker state");
        return Ok(None);
    }
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(state: BreakerState) -> PersistedBreaker {
        PersistedBreaker::from_runtime(
            state,
            4,
            Some(1_500),
            2,
            Duration::from_secs(2),
            Some(10_000),
            vec![true, true, false],
        )
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        persist_state(dir.path(), "llm", &snapshot(BreakerState::Open)).unwrap();

        let loaded = load_state(dir.path(), "llm").unwrap().unwrap();
        assert_eq!(loaded.state, BreakerState::Open);
        assert_eq!(loaded.failures, 4);
        assert_eq!(loaded.next_attempt_in_ms, Some(1_500));
        assert_eq!(loaded.current_retry_delay_ms, 2_000);
        assert_eq!(loaded.recovery_test_requests.len(), 3);
    }

    #[test]
    fn file_uses_wire_field_names() {
        let dir = tempfile::tempdir().unwrap();
        persist_state(dir.path(), "graph", &snapshot(BreakerState::HalfOpen)).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("cb-graph.json")).unwrap();
        for field in [
            "\"state\"",
            "\"failures\"",
            "\"nextAttempt\"",
            "\"recoveryAttempts\"",
            "\"currentRetryDelay\"",
            "\"lastRecoveryAttempt\"",
            "\"recoveryTestRequests\"",
            "\"timestamp\"",
        ] {
            assert!(raw.contains(field), "missing {field} in {raw}");
        }
        assert!(raw.contains("\"HALF_OPEN\""));
    }

    #[test]
    fn stale_state_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut old = snapshot(BreakerState::Open);
        old.timestamp -= MAX_STATE_AGE_MS + 1_000;
        persist_state(dir.path(), "llm", &old).unwrap();
        assert!(load_state(dir.path(), "llm").unwrap().is_none());
    }

    #[test]
    fn missing_and_corrupt_files_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_state(dir.path(), "absent").unwrap().is_none());
        std::fs::write(dir.path().join("cb-bad.json"), "{not json").unwrap();
        assert!(load_state(dir.path(), "bad").unwrap().is_none());
    }
}
