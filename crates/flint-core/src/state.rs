//! Explicit, serializable training state.

use serde::{Deserialize, Serialize};

/// Process-wide training state.
///
/// Initialized at start or restored from a checkpoint, advanced only by the
/// training coordinator, and serialized into every checkpoint. Nothing in
/// here is ambient or global.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Identifier of the run this state belongs to.
    pub run_id: String,
    /// Base RNG seed; the sampler derives per-epoch streams from it.
    pub seed: u64,
    /// Current epoch (0-based).
    pub epoch: usize,
    /// Completed optimizer steps across the whole run.
    pub global_step: usize,
    /// Completed micro-batches across the whole run.
    pub micro_batches: u64,
    /// Cumulative tokens seen; drives the warmup schedule.
    pub tokens_seen: u64,
    /// Windows consumed from each loader worker in the current epoch.
    /// Restored on resume so every worker can skip exactly what it already
    /// produced.
    pub worker_windows: Vec<u64>,
    /// Optimizer steps skipped due to gradient overflow.
    pub overflow_skips: u64,
    /// Corrupt records skipped so far in the current epoch.
    pub corrupt_records: u64,
}

impl TrainingState {
    /// Fresh state for a new run.
    #[must_use]
    pub fn new(run_id: impl Into<String>, seed: u64, num_workers: usize) -> Self {
        Self {
            run_id: run_id.into(),
            seed,
            epoch: 0,
            global_step: 0,
            micro_batches: 0,
            tokens_seen: 0,
            worker_windows: vec![0; num_workers],
            overflow_skips: 0,
            corrupt_records: 0,
        }
    }

    /// Record one completed micro-batch of `tokens` tokens, attributing its
    /// windows to the workers that produced them.
    pub fn record_micro_batch(&mut self, tokens: u64, windows_per_worker: &[u64]) {
        self.micro_batches += 1;
        self.tokens_seen += tokens;
        for (slot, n) in self.worker_windows.iter_mut().zip(windows_per_worker) {
            *slot += n;
        }
    }

    /// Record one completed optimizer step.
    pub fn record_optimizer_step(&mut self) {
        self.global_step += 1;
    }

    /// Reset the per-epoch counters and advance to the next epoch.
    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.corrupt_records = 0;
        for slot in &mut self.worker_windows {
            *slot = 0;
        }
    }
}
