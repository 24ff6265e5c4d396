//! Dependency health monitor.
//!
//! Each registered probe runs on an interval under its own timeout: a
//! hanging dependency shows up as a timed-out probe, never as a wedged
//! monitor. The composite status degrades with the number of failing
//! probes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// One dependency check.
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    fn name(&self) -> &str;
    async fn probe(&self) -> Result<(), String>;
}

/// Composite health, derived from the number of failing probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Last known state of one probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeStatus {
    pub name: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// The monitor. `check_once` is separable from the interval loop so
/// tests and the status surface can force a fresh reading.
pub struct HealthMonitor {
    probes: Vec<Arc<dyn DependencyProbe>>,
    probe_timeout: Duration,
    interval: Duration,
    state: Mutex<Vec<ProbeStatus>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        probes: Vec<Arc<dyn DependencyProbe>>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let state = probes
            .iter()
            .map(|p| ProbeStatus {
                name: p.name().to_string(),
                healthy: true,
                consecutive_failures: 0,
                last_error: None,
            })
            .collect();
        Self {
            probes,
            probe_timeout,
            interval,
            state: Mutex::new(state),
        }
    }

    /// Run every probe once, under the per-probe timeout.
    pub async fn check_once(&self) -> HealthStatus {
        for (idx, probe) in self.probes.iter().enumerate() {
            let outcome = match tokio::time::timeout(self.probe_timeout, probe.probe()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(format!("probe timed out after {:?}", self.probe_timeout)),
            };
            let mut state = self.state.lock().expect("health state poisoned");
            let entry = &mut state[idx];
            match outcome {
                Ok(()) => {
                    entry.healthy = true;
                    entry.consecutive_failures = 0;
                    entry.last_error = None;
                }
                Err(e) => {
                    entry.healthy = false;
                    entry.consecutive_failures += 1;
                    tracing::warn!(probe = %entry.name, error = %e, "dependency probe failed");
                    entry.last_error = Some(e);
                }
            }
        }
        self.status()
    }

    /// Composite status from the last readings.
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        let state = self.state.lock().expect("health state poisoned");
        let unhealthy = state.iter().filter(|p| !p.healthy).count();
        match unhealthy {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }

    /// Per-probe detail for the status surface.
    #[must_use]
    pub fn probe_statuses(&self) -> Vec<ProbeStatus> {
        self.state.lock().expect("health state poisoned").clone()
    }

    /// Probe on the configured interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.check_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}
