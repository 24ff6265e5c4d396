//! Confidence scoring and reconciliation.
//!
//! Reconciliation fuses every evidence observation recorded for one
//! relationship fingerprint into a single confidence and an accept/discard
//! decision. The fusion is commutative: evidence rows may arrive and be
//! read in any order: which is what lets sibling outbox events interleave
//! freely upstream.
//!
//! Evidence is treated uniformly here. The per-factor breakdown carried on
//! payloads feeds the prompt-enhancement path that re-queries
//! low-confidence edges; it never changes the fusion arithmetic.

use codegraph_types::{EvidencePayload, RelationshipStatus};
use serde::{Deserialize, Serialize};

/// Tunable thresholds for scoring. Configurable, but fixed for the
/// lifetime of a run: changing thresholds mid-run would break the
/// monotonicity of terminal decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Scores strictly above this validate the relationship.
    pub validation_threshold: f64,
    /// Evidence spread (max − min) above this flags a conflict.
    pub conflict_spread: f64,
    /// Convergence bonus applies only when the variance is at most this.
    pub convergence_variance_max: f64,
    /// Weight of the convergence bonus.
    pub bonus_weight: f64,
    /// Default score for synthetic observations without an explicit one.
    pub synthetic_default: f64,
    /// Default score for observations missing the confidence field.
    pub missing_default: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            validation_threshold: 0.5,
            conflict_spread: 0.4,
            convergence_variance_max: 0.05,
            bonus_weight: 0.2,
            synthetic_default: 0.6,
            missing_default: 0.7,
        }
    }
}

/// Result of fusing all evidence for one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedScore {
    /// Final confidence in [0,1].
    pub score: f64,
    pub mean: f64,
    pub variance: f64,
    /// Set when evidence disagrees by more than the configured spread.
    /// Kept for audit; does not change the decision.
    pub conflict: bool,
    pub sample_count: usize,
}

impl FusedScore {
    /// Terminal status this score decides.
    #[must_use]
    pub fn decision(&self, config: &ReconcilerConfig) -> RelationshipStatus {
        if self.score > config.validation_threshold {
            RelationshipStatus::Validated
        } else {
            RelationshipStatus::Discarded
        }
    }
}

/// Confidence scorer over evidence observations.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    config: ReconcilerConfig,
}

impl ConfidenceScorer {
    #[must_use]
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Extract the score of a single observation, substituting defaults.
    #[must_use]
    pub fn observation_score(&self, evidence: &EvidencePayload) -> f64 {
        match evidence.confidence {
            Some(c) => c.clamp(0.0, 1.0),
            None if evidence.synthetic => self.config.synthetic_default,
            None => self.config.missing_default,
        }
    }

    /// Fuse all evidence for one fingerprint into a final score.
    ///
    /// Mean plus a convergence bonus when at least two observations agree
    /// tightly: `B = max(0, (1 − σ²) · w)`, clamped so the final score
    /// stays in [0,1]. No evidence at all fuses to zero (discard).
    #[must_use]
    pub fn fuse(&self, evidence: &[EvidencePayload]) -> FusedScore {
        let scores: Vec<f64> = evidence.iter().map(|e| self.observation_score(e)).collect();
        if scores.is_empty() {
            return FusedScore {
                score: 0.0,
                mean: 0.0,
                variance: 0.0,
                conflict: false,
                sample_count: 0,
            };
        }

        let n = scores.len() as f64;
        let mean = scores.iter().sum::<f64>() / n;
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;

        let bonus = if scores.len() >= 2 && variance <= self.config.convergence_variance_max {
            ((1.0 - variance) * self.config.bonus_weight).max(0.0)
        } else {
            0.0
        };

        let max = scores.iter().copied().fold(f64::MIN, f64::max);
        let min = scores.iter().copied().fold(f64::MAX, f64::min);

        FusedScore {
            score: (mean + bonus).clamp(0.0, 1.0),
            mean,
            variance,
            conflict: max - min > self.config.conflict_spread,
            sample_count: scores.len(),
        }
    }
}
