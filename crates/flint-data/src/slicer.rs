//! Overlap slicing.
//!
//! Splits a token sequence into fixed-length windows sized to the model
//! context, overlapping by a configured fraction. The invariant across a
//! sequence: every non-padding position is labeled by at least one window,
//! and by exactly one when `pad_overlapped` is off.

use crate::tokenizer::TokenSequence;

/// A fixed-length input/label pair sliced from one token sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// Index of the source record.
    pub record: usize,
    /// Position of this window within its sequence (0-based).
    pub index: usize,
    /// Loader worker that produced this window; 0 outside the loader.
    pub worker: usize,
    /// Input token ids, exactly `context_length` long.
    pub inputs: Vec<u32>,
    /// Labels, exactly `context_length` long; ignore-sentinel where the
    /// position must not contribute to the loss.
    pub labels: Vec<i64>,
}

/// Slices token sequences into overlapping windows.
#[derive(Debug, Clone)]
pub struct OverlapSlicer {
    context_length: usize,
    stride: usize,
    pad_overlapped: bool,
    pad_id: u32,
    ignore_label: i64,
}

impl OverlapSlicer {
    /// Create a slicer. `stride` must be in `[1, context_length]` (enforced
    /// by config validation).
    #[must_use]
    pub fn new(
        context_length: usize,
        stride: usize,
        pad_overlapped: bool,
        pad_id: u32,
        ignore_label: i64,
    ) -> Self {
        debug_assert!(stride >= 1 && stride <= context_length);
        Self {
            context_length,
            stride,
            pad_overlapped,
            pad_id,
            ignore_label,
        }
    }

    /// Window length.
    #[must_use]
    pub fn context_length(&self) -> usize {
        self.context_length
    }

    /// Offset between consecutive windows of one sequence.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Slice one sequence into windows.
    ///
    /// Windows start at offsets `0, S, 2S, ...`; emission stops with the
    /// first window whose end reaches the sequence end, so a sequence of
    /// length `L > C` yields `ceil((L - C) / S) + 1` windows and `L <= C`
    /// yields one. Tail positions past the end are padded and their labels
    /// set to the ignore sentinel.
    ///
    /// Label policy for the region a window shares with its predecessor
    /// (the first `C - S` positions of every window after the first):
    /// labeled again when `pad_overlapped` is on, ignore-masked when off.
    #[must_use]
    pub fn windows(&self, seq: &TokenSequence) -> Vec<Window> {
        let c = self.context_length;
        let len = seq.ids.len();
        if len == 0 {
            return Vec::new();
        }

        let mut out = Vec::new();
        let mut offset = 0;
        let mut index = 0;
        loop {
            let mut inputs = Vec::with_capacity(c);
            let mut labels = Vec::with_capacity(c);
            for pos in offset..offset + c {
                if pos < len {
                    inputs.push(seq.ids[pos]);
                    labels.push(i64::from(seq.ids[pos]));
                } else {
                    inputs.push(self.pad_id);
                    labels.push(self.ignore_label);
                }
            }
            if index > 0 && !self.pad_overlapped {
                let overlap = c - self.stride;
                for label in labels.iter_mut().take(overlap) {
                    *label = self.ignore_label;
                }
            }
            out.push(Window {
                record: seq.record,
                index,
                worker: 0,
                inputs,
                labels,
            });
            if offset + c >= len {
                break;
            }
            offset += self.stride;
            index += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAD: u32 = 1;
    const IGNORE: i64 = -100;

    fn seq(len: usize) -> TokenSequence {
        TokenSequence {
            record: 0,
            ids: (0..len as u32).map(|i| i + 10).collect(),
        }
    }

    fn expected_count(len: usize, c: usize, s: usize) -> usize {
        if len <= c {
            1
        } else {
            (len - c).div_ceil(s) + 1
        }
    }

    #[test]
    fn window_count_formula() {
        for (len, c, s) in [
            (100, 64, 58),
            (200, 64, 58),
            (120, 64, 58),
            (64, 64, 32),
            (10, 64, 58),
            (65, 64, 1),
            (300, 50, 50),
        ] {
            let slicer = OverlapSlicer::new(c, s, false, PAD, IGNORE);
            let windows = slicer.windows(&seq(len));
            assert_eq!(
                windows.len(),
                expected_count(len, c, s),
                "len={len} c={c} s={s}"
            );
            for w in &windows {
                assert_eq!(w.inputs.len(), c);
                assert_eq!(w.labels.len(), c);
            }
        }
    }

    #[test]
    fn short_sequence_is_one_padded_window() {
        let slicer = OverlapSlicer::new(8, 4, false, PAD, IGNORE);
        let windows = slicer.windows(&seq(5));
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].inputs[..5], [10, 11, 12, 13, 14]);
        assert_eq!(windows[0].inputs[5..], [PAD, PAD, PAD]);
        assert_eq!(windows[0].labels[5..], [IGNORE, IGNORE, IGNORE]);
    }

    #[test]
    fn empty_sequence_yields_no_windows() {
        let slicer = OverlapSlicer::new(8, 4, false, PAD, IGNORE);
        assert!(slicer
            .windows(&TokenSequence {
                record: 0,
                ids: vec![]
            })
            .is_empty());
    }

    #[test]
    fn overlap_example_l100_c64_f01() {
        // L=100, C=64, overlap=0.1 => S=58 => windows at offsets {0, 58};
        // the second window's positions past L are ignore-labeled.
        let slicer = OverlapSlicer::new(64, 58, false, PAD, IGNORE);
        let windows = slicer.windows(&seq(100));
        assert_eq!(windows.len(), 2);

        let second = &windows[1];
        // real content covers [58, 100): 42 positions
        assert_eq!(second.inputs[41], 10 + 99);
        assert!(second.inputs[42..].iter().all(|&t| t == PAD));
        assert!(second.labels[42..].iter().all(|&l| l == IGNORE));
    }

    fn coverage(windows: &[Window], c: usize, s: usize, len: usize) -> Vec<usize> {
        let mut counts = vec![0usize; len];
        for w in windows {
            let offset = w.index * s;
            for (i, &label) in w.labels.iter().enumerate() {
                if label != IGNORE {
                    assert_eq!(label, i64::from(10 + (offset + i) as u32));
                    counts[offset + i] += 1;
                }
            }
            let _ = c;
        }
        counts
    }

    #[test]
    fn exactly_once_coverage_without_pad_overlapped() {
        for (len, c, s) in [(100, 64, 58), (500, 64, 32), (129, 16, 8), (40, 16, 16)] {
            let slicer = OverlapSlicer::new(c, s, false, PAD, IGNORE);
            let windows = slicer.windows(&seq(len));
            let counts = coverage(&windows, c, s, len);
            assert!(
                counts.iter().all(|&n| n == 1),
                "len={len} c={c} s={s}: {counts:?}"
            );
        }
    }

    #[test]
    fn pad_overlapped_labels_overlap_regions_again() {
        let (len, c, s) = (100, 16, 8);
        let slicer = OverlapSlicer::new(c, s, true, PAD, IGNORE);
        let windows = slicer.windows(&seq(len));
        let counts = coverage(&windows, c, s, len);
        // never under-coverage
        assert!(counts.iter().all(|&n| n >= 1));
        // interior overlap regions are supervised twice
        assert!(counts.iter().any(|&n| n > 1));
    }

    #[test]
    fn first_window_fully_labeled_in_both_modes() {
        for pad_overlapped in [false, true] {
            let slicer = OverlapSlicer::new(16, 8, pad_overlapped, PAD, IGNORE);
            let windows = slicer.windows(&seq(100));
            assert!(windows[0].labels.iter().all(|&l| l != IGNORE));
        }
    }
}
