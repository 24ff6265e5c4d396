//! Process memory sampling for the supervisor's memory guard.

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Resident set size of the current process, in MB. Returns `None` when
/// the platform refuses to report (the guard then stays inert rather
/// than aborting a healthy run).
#[must_use]
pub fn process_rss_mb() -> Option<f64> {
    let mut system = System::new();
    let pid = Pid::from(std::process::id() as usize);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    let process = system.process(pid)?;
    Some(process.memory() as f64 / (1024.0 * 1024.0))
}

/// Guard verdict for one sample against the configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryVerdict {
    Ok,
    /// Above 80% of the ceiling: log and hint, keep running.
    Warn,
    /// Above the ceiling: initiate shutdown.
    Abort,
}

#[must_use]
pub fn judge_memory(rss_mb: f64, limit_mb: u64) -> MemoryVerdict {
    let limit = limit_mb as f64;
    if rss_mb > limit {
        MemoryVerdict::Abort
    } else if rss_mb > limit * 0.8 {
        MemoryVerdict::Warn
    } else {
        MemoryVerdict::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_thresholds() {
        assert_eq!(judge_memory(100.0, 2048), MemoryVerdict::Ok);
        assert_eq!(judge_memory(1700.0, 2048), MemoryVerdict::Warn);
        assert_eq!(judge_memory(2100.0, 2048), MemoryVerdict::Abort);
        // Exactly at the soft watermark is still Ok.
        assert_eq!(judge_memory(2048.0 * 0.8, 2048), MemoryVerdict::Ok);
    }

    #[test]
    fn rss_reports_something_plausible() {
        let rss = process_rss_mb().expect("rss available on test hosts");
        assert!(rss > 0.0);
        assert!(rss < 1024.0 * 64.0);
    }
}
