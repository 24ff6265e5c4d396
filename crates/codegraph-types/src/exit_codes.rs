//! Exit code constants for the codegraph CLI.
//!
//! | Code | Constant | Description |
//! |------|----------|-------------|
//! | 0 | `SUCCESS` | Pipeline ran to quiescence and the graph was built |
//! | 1 | `FATAL` | Initialization failure or deadlocked pipeline |
//! | 2 | `MEMORY_LIMIT` | Memory ceiling exceeded, forced shutdown |

use crate::error::{ErrorCategory, FailureKind};

/// Type-safe process exit code. The numeric values are part of the CLI
/// contract and stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(i32);

impl ExitCode {
    /// Pipeline completed: all queues drained, graph built.
    pub const SUCCESS: ExitCode = ExitCode(0);

    /// Fatal initialization error or deadlock.
    pub const FATAL: ExitCode = ExitCode(1);

    /// Memory-limit forced shutdown.
    pub const MEMORY_LIMIT: ExitCode = ExitCode(2);

    /// Numeric value for `std::process::exit()`.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Map a failure kind to the exit code the CLI should return.
    #[must_use]
    pub fn from_failure(kind: &FailureKind) -> Self {
        match kind.category() {
            ErrorCategory::System => {
                if matches!(kind, FailureKind::System(msg) if msg.contains("memory")) {
                    Self::MEMORY_LIMIT
                } else {
                    Self::FATAL
                }
            }
            _ => Self::FATAL,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_failures_map_to_code_two() {
        let kind = FailureKind::System("memory ceiling exceeded: 2150 MB".to_string());
        assert_eq!(ExitCode::from_failure(&kind), ExitCode::MEMORY_LIMIT);
    }

    #[test]
    fn config_failures_map_to_fatal() {
        let kind = FailureKind::Configuration("bad target dir".to_string());
        assert_eq!(ExitCode::from_failure(&kind), ExitCode::FATAL);
        assert_eq!(ExitCode::FATAL.as_i32(), 1);
    }
}
