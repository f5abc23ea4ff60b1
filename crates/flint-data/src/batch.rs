//! Batch assembly.

use crate::slicer::Window;

/// A fixed group of windows stacked into flat row-major buffers.
///
/// Lifecycle is one training step.
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    /// Input token ids, `rows * cols` long.
    pub inputs: Vec<u32>,
    /// Labels, `rows * cols` long, ignore-sentinel where masked.
    pub labels: Vec<i64>,
    /// Number of windows in this batch.
    pub rows: usize,
    /// Window length (the model context length).
    pub cols: usize,
    /// How many of this batch's windows came from each loader worker.
    pub worker_windows: Vec<u64>,
}

impl TrainingBatch {
    /// Input row `r`.
    #[must_use]
    pub fn input_row(&self, r: usize) -> &[u32] {
        &self.inputs[r * self.cols..(r + 1) * self.cols]
    }

    /// Label row `r`.
    #[must_use]
    pub fn label_row(&self, r: usize) -> &[i64] {
        &self.labels[r * self.cols..(r + 1) * self.cols]
    }

    /// Total positions in the batch (`rows * cols`).
    #[must_use]
    pub fn num_tokens(&self) -> u64 {
        (self.rows * self.cols) as u64
    }

    /// Positions whose labels contribute to the loss.
    #[must_use]
    pub fn target_tokens(&self, ignore_label: i64) -> u64 {
        self.labels.iter().filter(|&&l| l != ignore_label).count() as u64
    }
}

/// Groups windows into uniform batches.
///
/// The final short batch of an epoch is emitted or dropped per the explicit
/// `drop_last` flag; train and eval carry separate flags so the choice is
/// never silently inconsistent.
pub struct BatchAssembler {
    batch_size: usize,
    context_length: usize,
    drop_last: bool,
    num_workers: usize,
    pending: Vec<Window>,
}

impl BatchAssembler {
    /// Create an assembler for batches of `batch_size` windows.
    #[must_use]
    pub fn new(
        batch_size: usize,
        context_length: usize,
        drop_last: bool,
        num_workers: usize,
    ) -> Self {
        Self {
            batch_size,
            context_length,
            drop_last,
            num_workers: num_workers.max(1),
            pending: Vec::with_capacity(batch_size),
        }
    }

    /// Add a window; returns a batch once `batch_size` windows are pending.
    pub fn push(&mut self, window: Window) -> Option<TrainingBatch> {
        debug_assert_eq!(window.inputs.len(), self.context_length);
        self.pending.push(window);
        if self.pending.len() == self.batch_size {
            Some(self.stack())
        } else {
            None
        }
    }

    /// Emit the final partial batch, or discard it when `drop_last` is set.
    pub fn finish(&mut self) -> Option<TrainingBatch> {
        if self.pending.is_empty() {
            return None;
        }
        if self.drop_last {
            tracing::debug!(
                windows = self.pending.len(),
                "dropping final short batch"
            );
            self.pending.clear();
            return None;
        }
        Some(self.stack())
    }

    fn stack(&mut self) -> TrainingBatch {
        let rows = self.pending.len();
        let cols = self.context_length;
        let mut inputs = Vec::with_capacity(rows * cols);
        let mut labels = Vec::with_capacity(rows * cols);
        let mut worker_windows = vec![0u64; self.num_workers];
        for window in self.pending.drain(..) {
            inputs.extend_from_slice(&window.inputs);
            labels.extend_from_slice(&window.labels);
            worker_windows[window.worker] += 1;
        }
        TrainingBatch {
            inputs,
            labels,
            rows,
            cols,
            worker_windows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(worker: usize, fill: u32) -> Window {
        Window {
            record: 0,
            index: 0,
            worker,
            inputs: vec![fill; 4],
            labels: vec![i64::from(fill); 4],
        }
    }

    #[test]
    fn emits_full_batches() {
        let mut assembler = BatchAssembler::new(2, 4, false, 2);
        assert!(assembler.push(window(0, 5)).is_none());
        let batch = assembler.push(window(1, 6)).unwrap();
        assert_eq!(batch.rows, 2);
        assert_eq!(batch.cols, 4);
        assert_eq!(batch.input_row(0), &[5, 5, 5, 5]);
        assert_eq!(batch.label_row(1), &[6, 6, 6, 6]);
        assert_eq!(batch.worker_windows, vec![1, 1]);
    }

    #[test]
    fn finish_emits_partial_when_allowed() {
        let mut assembler = BatchAssembler::new(3, 4, false, 1);
        assembler.push(window(0, 1));
        let batch = assembler.finish().unwrap();
        assert_eq!(batch.rows, 1);
        assert!(assembler.finish().is_none());
    }

    #[test]
    fn finish_drops_partial_when_configured() {
        let mut assembler = BatchAssembler::new(3, 4, true, 1);
        assembler.push(window(0, 1));
        assembler.push(window(0, 2));
        assert!(assembler.finish().is_none());
    }

    #[test]
    fn target_token_counting() {
        let mut w = window(0, 3);
        w.labels[2] = -100;
        w.labels[3] = -100;
        let mut assembler = BatchAssembler::new(1, 4, false, 1);
        let batch = assembler.push(w).unwrap();
        assert_eq!(batch.num_tokens(), 4);
        assert_eq!(batch.target_tokens(-100), 2);
    }
}
