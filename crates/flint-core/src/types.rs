//! Common type definitions.

use serde::{Deserialize, Serialize};

/// Dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training split (shuffled).
    Train,
    /// Validation split (sequential).
    Val,
    /// Test split (sequential).
    Test,
}

impl Split {
    /// Short name used in logs and paths.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }

    /// Whether this split goes through the shuffle bucket.
    #[must_use]
    pub const fn shuffled(&self) -> bool {
        matches!(self, Self::Train)
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric precision for the training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Full 32-bit precision; loss scaling disabled.
    #[default]
    Fp32,
    /// Mixed 16-bit precision with dynamic loss scaling.
    Fp16,
}

/// Direction in which the checkpoint-ranking metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricMode {
    /// Lower metric values rank better (validation loss).
    #[default]
    Min,
    /// Higher metric values rank better.
    Max,
}

impl MetricMode {
    /// True if `a` ranks strictly better than `b`.
    #[must_use]
    pub fn better(&self, a: f64, b: f64) -> bool {
        match self {
            Self::Min => a < b,
            Self::Max => a > b,
        }
    }
}

/// Evaluation metrics produced by a validation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Mean loss per target token.
    pub loss: f64,
    /// Perplexity (`exp(loss)`).
    pub perplexity: f64,
    /// Number of target tokens that contributed to the loss.
    pub target_tokens: u64,
}

impl EvalMetrics {
    /// Build metrics from a summed loss over `target_tokens` positions.
    #[must_use]
    pub fn from_sum(loss_sum: f64, target_tokens: u64) -> Self {
        let loss = if target_tokens == 0 {
            0.0
        } else {
            loss_sum / target_tokens as f64
        };
        Self {
            loss,
            perplexity: loss.exp(),
            target_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_mode_direction() {
        assert!(MetricMode::Min.better(0.3, 0.5));
        assert!(!MetricMode::Min.better(0.5, 0.3));
        assert!(MetricMode::Max.better(0.5, 0.3));
    }

    #[test]
    fn eval_metrics_from_sum() {
        let m = EvalMetrics::from_sum(20.0, 10);
        assert!((m.loss - 2.0).abs() < 1e-12);
        assert!((m.perplexity - 2.0f64.exp()).abs() < 1e-9);
    }

    #[test]
    fn only_train_is_shuffled() {
        assert!(Split::Train.shuffled());
        assert!(!Split::Val.shuffled());
        assert!(!Split::Test.shuffled());
    }
}
