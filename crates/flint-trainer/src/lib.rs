//! Training loop and checkpointing for FLINT.
//!
//! This crate provides:
//! - The distributed training coordinator ([`Trainer`])
//! - Dynamic loss scaling for mixed precision ([`GradScaler`])
//! - Checkpoint persistence with top-K retention ([`CheckpointManager`])
//! - The opaque-model seam ([`CausalLm`]) and a small reference model
//!   ([`BigramLm`]) that exercises the whole pipeline
//! - Training callbacks for logging and metrics

#![warn(missing_docs)]

pub mod bigram;
pub mod callbacks;
pub mod checkpoint;
pub mod model;
pub mod scaler;
pub mod trainer;

pub use bigram::{AdamOptions, BigramLm};
pub use callbacks::{LoggingCallback, MetricsJsonCallback, ProgressCallback};
pub use checkpoint::{CheckpointHandle, CheckpointManager, CheckpointMeta};
pub use model::{
    clip_gradients, global_grad_norm, gradients_finite, scale_gradients, CausalLm, NamedTensor,
    StateDict,
};
pub use scaler::{GradScaler, LossScaleConfig};
pub use trainer::{StepStats, Trainer};
