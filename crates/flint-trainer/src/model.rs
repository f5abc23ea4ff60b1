//! The model seam.
//!
//! The transformer's forward/backward computation is an external
//! collaborator: the coordinator only needs an opaque differentiable
//! function with a flat gradient buffer, AdamW-style updates, and a named
//! tensor state for checkpointing. Anything satisfying [`CausalLm`] can be
//! trained by the pipeline.

use flint_core::Result;
use flint_data::TrainingBatch;
use std::collections::BTreeMap;

/// A named f32 tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    /// Tensor shape.
    pub shape: Vec<usize>,
    /// Row-major data, `shape.iter().product()` elements.
    pub data: Vec<f32>,
}

impl NamedTensor {
    /// A rank-1 tensor over `data`.
    #[must_use]
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }
}

/// Model and optimizer state as named tensors, ordered for deterministic
/// serialization.
pub type StateDict = BTreeMap<String, NamedTensor>;

/// An opaque differentiable causal language model with its optimizer.
///
/// Labels equal to the configured ignore sentinel must not contribute to
/// the loss; the model applies the causal shift internally.
pub trait CausalLm {
    /// Total trainable parameters.
    fn num_parameters(&self) -> usize;

    /// Forward and backward over one micro-batch. Gradients of
    /// `loss * loss_scale` accumulate into the flat gradient buffer;
    /// the returned loss is the unscaled mean over target positions.
    fn forward_backward(&mut self, batch: &TrainingBatch, loss_scale: f32) -> Result<f64>;

    /// Loss summed over target positions, plus the target-position count.
    fn eval_loss(&self, batch: &TrainingBatch) -> Result<(f64, u64)>;

    /// Flat accumulated gradient buffer. The coordinator averages it across
    /// ranks, unscales, and clips in place before stepping.
    fn gradients_mut(&mut self) -> &mut [f32];

    /// Apply the gradient buffer with one AdamW step at `lr`, then clear
    /// the buffer.
    fn apply_gradients(&mut self, lr: f64) -> Result<()>;

    /// Discard accumulated gradients without stepping (overflow recovery).
    fn zero_gradients(&mut self);

    /// Model parameters and optimizer state for checkpointing.
    fn state_dict(&self) -> StateDict;

    /// Restore from a checkpointed state. Shape or key mismatches are
    /// errors; no partial restore.
    fn load_state_dict(&mut self, state: StateDict) -> Result<()>;
}

/// Global L2 norm of a gradient buffer.
#[must_use]
pub fn global_grad_norm(grads: &[f32]) -> f64 {
    grads
        .iter()
        .map(|&g| f64::from(g) * f64::from(g))
        .sum::<f64>()
        .sqrt()
}

/// True when every gradient component is finite.
#[must_use]
pub fn gradients_finite(grads: &[f32]) -> bool {
    grads.iter().all(|g| g.is_finite())
}

/// Multiply every gradient component by `factor` in place.
pub fn scale_gradients(grads: &mut [f32], factor: f32) {
    for g in grads.iter_mut() {
        *g *= factor;
    }
}

/// Clip the buffer to a maximum global norm; returns the pre-clip norm.
pub fn clip_gradients(grads: &mut [f32], max_norm: f64) -> f64 {
    let norm = global_grad_norm(grads);
    if norm > max_norm {
        let factor = (max_norm / (norm + 1e-6)) as f32;
        scale_gradients(grads, factor);
    }
    norm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norm_and_clip() {
        let mut grads = vec![3.0f32, 4.0];
        assert!((global_grad_norm(&grads) - 5.0).abs() < 1e-9);

        let pre = clip_gradients(&mut grads, 1.0);
        assert!((pre - 5.0).abs() < 1e-9);
        assert!((global_grad_norm(&grads) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn clip_leaves_small_gradients_alone() {
        let mut grads = vec![0.1f32, 0.1];
        let before = grads.clone();
        clip_gradients(&mut grads, 1.0);
        assert_eq!(grads, before);
    }

    #[test]
    fn finiteness_detects_nan_and_inf() {
        assert!(gradients_finite(&[1.0, -2.0]));
        assert!(!gradients_finite(&[1.0, f32::NAN]));
        assert!(!gradients_finite(&[f32::INFINITY]));
    }
}
