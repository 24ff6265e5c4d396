//! LLM breaker specialization.
//!
//! The LLM breaker can consult a caller-supplied cache when the circuit
//! refuses a call: an open circuit or an active rate-limit backoff falls
//! back to a previously cached response instead of failing the job. Only
//! refusals fall back; a genuine failure from the live service propagates
//! so it keeps counting toward the threshold.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use codegraph_types::FailureKind;

use crate::CircuitBreaker;

/// A cache of prior LLM responses, keyed by the caller.
#[async_trait]
pub trait CacheFallback: Send + Sync {
    async fn lookup(&self, key: &str) -> Option<String>;
}

/// Circuit breaker for the LLM service with optional cached-response
/// fallback.
pub struct LlmBreaker {
    inner: Arc<CircuitBreaker>,
    fallback: Option<Arc<dyn CacheFallback>>,
}

impl LlmBreaker {
    #[must_use]
    pub fn new(inner: Arc<CircuitBreaker>) -> Self {
        Self {
            inner,
            fallback: None,
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn CacheFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner
    }

    /// Run `f` behind the circuit; on a refusal (open circuit or
    /// rate-limit backoff), serve the cached response for `cache_key`
    /// when one exists.
    pub async fn execute_or_fallback<F, Fut>(
        &self,
        cache_key: &str,
        f: F,
    ) -> Result<String, FailureKind>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, FailureKind>>,
    {
        match self.inner.execute(f).await {
            Ok(response) => Ok(response),
            Err(kind) => {
                let refused = matches!(
                    kind,
                    FailureKind::CircuitOpen { .. } | FailureKind::RateLimited { .. }
                );
                if refused {
                    if let Some(cache) = &self.fallback {
                        if let Some(hit) = cache.lookup(cache_key).await {
                            tracing::info!(cache_key, "serving cached LLM response while refused");
                            return Ok(hit);
                        }
                    }
                }
                Err(kind)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BreakerConfig, BreakerState};
    use std::collections::HashMap;
    use std::time::Duration;

    struct MapCache(HashMap<String, String>);

    #[async_trait]
    impl CacheFallback for MapCache {
        async fn lookup(&self, key: &str) -> Option<String> {
            self.0.get(key).cloned()
        }
    }

    fn tripped_breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(3600),
            ..BreakerConfig::named("llm")
        }))
    }

    fn infra() -> FailureKind {
        FailureKind::Infrastructure {
            service: "llm".to_string(),
            message: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn open_circuit_serves_cached_response() {
        let breaker = tripped_breaker();
        let llm = LlmBreaker::new(Arc::clone(&breaker)).with_fallback(Arc::new(MapCache(
            HashMap::from([("file:a.js".to_string(), "{\"pois\": []}".to_string())]),
        )));

        // Trip the circuit.
        let _ = llm
            .execute_or_fallback("file:a.js", || async { Err(infra()) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // Refused call falls back to the cache.
        let out = llm
            .execute_or_fallback("file:a.js", || async { Ok("live".to_string()) })
            .await
            .unwrap();
        assert_eq!(out, "{\"pois\": []}");

        // A key with no cached entry still surfaces the refusal.
        let err = llm
            .execute_or_fallback("file:b.js", || async { Ok("live".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, FailureKind::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn genuine_failures_do_not_fall_back() {
        let llm = LlmBreaker::new(Arc::new(CircuitBreaker::new(BreakerConfig::named("llm"))))
            .with_fallback(Arc::new(MapCache(HashMap::from([(
                "k".to_string(),
                "cached".to_string(),
            )]))));

        let err = llm
            .execute_or_fallback("k", || async { Err::<String, _>(infra()) })
            .await
            .unwrap_err();
        assert!(matches!(err, FailureKind::Infrastructure { .. }));
    }

    #[tokio::test]
    async fn without_fallback_refusals_propagate() {
        let llm = LlmBreaker::new(tripped_breaker());
        let _ = llm
            .execute_or_fallback("k", || async { Err::<String, _>(infra()) })
            .await;
        let err = llm
            .execute_or_fallback("k", || async { Ok("live".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, FailureKind::CircuitOpen { .. }));
    }
}
