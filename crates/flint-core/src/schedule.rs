//! Learning rate schedule.
//!
//! Warmup is counted in cumulative tokens seen rather than steps, so it is
//! invariant to batch size and sequence-length variation. Decay after warmup
//! is step-based over the planned total.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Decay applied after warmup completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LrDecay {
    /// Hold the peak learning rate.
    Constant,
    /// Linear decay to zero over the remaining steps.
    #[default]
    Linear,
    /// Cosine decay to zero over the remaining steps.
    Cosine,
}

/// Learning rate schedule: linear token-counted warmup, then decay.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    /// Peak learning rate (already scaled by effective batch size).
    peak_lr: f64,
    /// Cumulative tokens over which the rate ramps from zero to peak.
    warmup_tokens: u64,
    /// Planned optimizer steps for the whole run.
    total_steps: usize,
    decay: LrDecay,
}

impl LrSchedule {
    /// Create a schedule.
    #[must_use]
    pub fn new(peak_lr: f64, warmup_tokens: u64, total_steps: usize, decay: LrDecay) -> Self {
        Self {
            peak_lr,
            warmup_tokens,
            total_steps: total_steps.max(1),
            decay,
        }
    }

    /// Learning rate for the upcoming optimizer step, given the cumulative
    /// tokens seen and the number of completed steps.
    #[must_use]
    pub fn lr(&self, tokens_seen: u64, step: usize) -> f64 {
        if self.warmup_tokens > 0 && tokens_seen < self.warmup_tokens {
            return self.peak_lr * tokens_seen as f64 / self.warmup_tokens as f64;
        }

        let progress = (step as f64 / self.total_steps as f64).min(1.0);
        match self.decay {
            LrDecay::Constant => self.peak_lr,
            LrDecay::Linear => self.peak_lr * (1.0 - progress),
            LrDecay::Cosine => self.peak_lr * 0.5 * (1.0 + (PI * progress).cos()),
        }
    }
}
