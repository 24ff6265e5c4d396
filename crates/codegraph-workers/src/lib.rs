//! Managed workers.
//!
//! A managed worker binds one queue to one [`JobHandler`] and runs every
//! job through the same admission path: governor permit, circuit breaker,
//! hard deadline, kind-driven retry with jittered exponential backoff,
//! and a structured error event on terminal failure. Handlers stay small
//! and declarative: everything operational lives in the wrapper.

pub mod handlers;
mod worker;

pub use worker::{JobHandler, ManagedWorker, WorkerConfig};

use codegraph_store::StoreError;
use codegraph_types::FailureKind;

/// Store failures are infrastructure failures from the worker's viewpoint.
pub(crate) fn store_failure(e: StoreError) -> FailureKind {
    FailureKind::Infrastructure {
        service: "store".to_string(),
        message: e.to_string(),
    }
}

/// A job payload that does not decode is inconsistent job data, not an
/// infrastructure problem: retrying cannot fix it.
pub(crate) fn payload_failure(e: serde_json::Error) -> FailureKind {
    FailureKind::Validation(format!("job payload: {e}"))
}
