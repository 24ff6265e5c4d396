use super::*;
use codegraph_types::FailureKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn config(threshold: u32) -> BreakerConfig {
    BreakerConfig {
        failure_threshold: threshold,
        reset_timeout: Duration::from_secs(30),
        base_retry_delay: Duration::from_secs(1),
        max_retry_delay: Duration::from_secs(60),
        retry_multiplier: 2.0,
        partial_recovery_threshold: 0.5,
        partial_recovery_window: 10,
        ..BreakerConfig::named("llm")
    }
}

fn infra_failure() -> FailureKind {
    FailureKind::Infrastructure {
        service: "llm".to_string(),
        message: "connection reset".to_string(),
    }
}

async fn fail_n(breaker: &CircuitBreaker, n: u32) {
    for _ in 0..n {
        let _ = breaker
            .execute::<(), _, _>(|| async { Err(infra_failure()) })
            .await;
    }
}

#[tokio::test]
async fn exactly_threshold_failures_open_the_circuit() {
    let breaker = CircuitBreaker::new(config(10));
    fail_n(&breaker, 9).await;
    assert_eq!(breaker.state(), BreakerState::Closed);
    fail_n(&breaker, 1).await;
    assert_eq!(breaker.state(), BreakerState::Open);
}

#[tokio::test]
async fn success_resets_the_consecutive_count() {
    let breaker = CircuitBreaker::new(config(3));
    fail_n(&breaker, 2).await;
    breaker
        .execute(|| async { Ok::<_, FailureKind>(()) })
        .await
        .unwrap();
    fail_n(&breaker, 2).await;
    // 2 + success + 2 never reaches 3 consecutively.
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test]
async fn open_circuit_fails_fast_until_reset_timeout() {
    tokio::time::pause();
    let breaker = CircuitBreaker::new(config(2));
    fail_n(&breaker, 2).await;
    assert_eq!(breaker.state(), BreakerState::Open);

    let err = breaker.preflight().await.unwrap_err();
    assert!(matches!(err, BreakerError::Open { .. }));
    let kind = err.as_failure();
    assert!(matches!(kind, FailureKind::CircuitOpen { .. }));

    // Still blocked just before the reset timeout.
    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(breaker.preflight().await.is_err());

    // Due: the preflight transitions to HALF_OPEN and admits the call.
    tokio::time::advance(Duration::from_secs(2)).await;
    breaker.preflight().await.unwrap();
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
}

#[tokio::test]
async fn one_probe_success_does_not_close() {
    tokio::time::pause();
    let breaker = CircuitBreaker::new(config(10));
    fail_n(&breaker, 10).await;
    assert_eq!(breaker.state(), BreakerState::Open);

    tokio::time::advance(Duration::from_secs(31)).await;
    breaker
        .execute(|| async { Ok::<_, FailureKind>(()) })
        .await
        .unwrap();
    // One recorded probe is not enough evidence.
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    breaker
        .execute(|| async { Ok::<_, FailureKind>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    breaker
        .execute(|| async { Ok::<_, FailureKind>(()) })
        .await
        .unwrap();
    // Three recorded, success rate 1.0 ≥ 0.5: closed.
    assert_eq!(breaker.state(), BreakerState::Closed);

    assert_eq!(
        breaker.history(),
        vec![
            BreakerState::Closed,
            BreakerState::Open,
            BreakerState::HalfOpen,
            BreakerState::Closed,
        ]
    );
}

#[tokio::test]
async fn half_open_failure_reopens() {
    tokio::time::pause();
    let breaker = CircuitBreaker::new(config(2));
    fail_n(&breaker, 2).await;
    tokio::time::advance(Duration::from_secs(31)).await;
    breaker.preflight().await.unwrap();
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    let _ = breaker
        .execute::<(), _, _>(|| async { Err(infra_failure()) })
        .await;
    assert_eq!(breaker.state(), BreakerState::Open);
}

#[tokio::test]
async fn rate_limit_storm_never_opens_the_circuit() {
    tokio::time::pause();
    let breaker = CircuitBreaker::new(config(10));
    for _ in 0..20 {
        let _ = breaker
            .execute::<(), _, _>(|| async {
                Err(FailureKind::RateLimited {
                    retry_after_ms: Some(100),
                })
            })
            .await;
        // Each rate limit sets a backoff; wait it out before the next call.
        tokio::time::advance(Duration::from_secs(2)).await;
    }
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test]
async fn rate_limit_backoff_blocks_calls() {
    tokio::time::pause();
    let breaker = CircuitBreaker::new(config(10));
    let _ = breaker
        .execute::<(), _, _>(|| async {
            Err(FailureKind::RateLimited {
                retry_after_ms: None,
            })
        })
        .await;

    let err = breaker.preflight().await.unwrap_err();
    assert!(matches!(err, BreakerError::RateLimited { .. }));

    tokio::time::advance(Duration::from_secs(2)).await;
    breaker.preflight().await.unwrap();
}

#[tokio::test]
async fn graph_classifier_treats_pool_exhaustion_as_noncounting() {
    tokio::time::pause();
    let breaker = CircuitBreaker::with_classifier(config(2), graph_classifier);
    for _ in 0..5 {
        let _ = breaker
            .execute::<(), _, _>(|| async {
                Err(FailureKind::Infrastructure {
                    service: "graph".to_string(),
                    message: "connection pool exhausted".to_string(),
                })
            })
            .await;
        tokio::time::advance(Duration::from_secs(2)).await;
    }
    assert_eq!(breaker.state(), BreakerState::Closed);

    // Genuine connectivity failures still count.
    fail_n(&breaker, 2).await;
    assert_eq!(breaker.state(), BreakerState::Open);
}

struct FlagProbe(Arc<AtomicBool>);

#[async_trait]
impl HealthProbe for FlagProbe {
    async fn check(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn failed_probe_keeps_the_circuit_open() {
    tokio::time::pause();
    let healthy = Arc::new(AtomicBool::new(false));
    let breaker = CircuitBreaker::new(config(2)).with_probe(Box::new(FlagProbe(healthy.clone())));
    fail_n(&breaker, 2).await;

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(breaker.preflight().await.is_err());
    assert_eq!(breaker.state(), BreakerState::Open);

    // Probe delay escalated to 2s after the failed window.
    healthy.store(true, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(3)).await;
    breaker.preflight().await.unwrap();
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
}

#[tokio::test]
async fn snapshot_restore_round_trip() {
    tokio::time::pause();
    let breaker = CircuitBreaker::new(config(2));
    fail_n(&breaker, 2).await;
    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.state, BreakerState::Open);
    assert_eq!(snapshot.failures, 2);

    let fresh = CircuitBreaker::new(config(2));
    fresh.restore(&snapshot);
    assert_eq!(fresh.state(), BreakerState::Open);
    assert!(fresh.preflight().await.is_err());
}

#[tokio::test]
async fn registry_counts_open_breakers() {
    let a = Arc::new(CircuitBreaker::new(config(1)));
    let b = Arc::new(CircuitBreaker::new(config(10)));
    let registry = BreakerRegistry::new(vec![a.clone(), b.clone()]);
    assert_eq!(registry.open_count(), 0);

    fail_n(&a, 1).await;
    assert_eq!(registry.open_count(), 1);
    assert!(registry.get("llm").is_some());
    assert!(registry.get("nope").is_none());
}
