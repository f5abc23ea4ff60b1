//! Shuffle-bucket sampling.
//!
//! Full-corpus shuffling would require materializing every record. The
//! bucket holds at most `capacity` records at once and emits them in a
//! pseudo-random order, decoupling file order from training order while
//! bounding peak memory regardless of corpus size.

use crate::corpus::Record;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Stream seed for one epoch: the configured seed plus the epoch index, so
/// a resumed run with the same seed replays the same permutation.
#[must_use]
pub fn epoch_seed(seed: u64, epoch: u64) -> u64 {
    seed.wrapping_add(epoch)
}

/// Bounded randomizing buffer over a record stream.
///
/// Repeatedly: while below capacity, pull a record and insert it at a
/// uniformly random slot; otherwise emit a uniformly random occupied slot
/// and backfill from the inner stream. The epoch ends when both the bucket
/// and the inner stream are empty. Every record is emitted exactly once.
pub struct ShuffleBucket<I: Iterator<Item = Record>> {
    inner: I,
    slots: Vec<Record>,
    capacity: usize,
    rng: StdRng,
    inner_done: bool,
}

impl<I: Iterator<Item = Record>> ShuffleBucket<I> {
    /// Wrap `inner` with a bucket of `capacity` slots, seeded by
    /// `stream_seed` (see [`epoch_seed`]).
    #[must_use]
    pub fn new(inner: I, capacity: usize, stream_seed: u64) -> Self {
        Self {
            inner,
            slots: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            rng: StdRng::seed_from_u64(stream_seed),
            inner_done: false,
        }
    }

    /// Records currently held in memory.
    #[must_use]
    pub fn occupancy(&self) -> usize {
        self.slots.len()
    }

    /// Access the wrapped stream.
    pub fn inner_mut(&mut self) -> &mut I {
        &mut self.inner
    }

    fn pull(&mut self) {
        if self.inner_done {
            return;
        }
        match self.inner.next() {
            Some(record) => {
                let at = self.rng.gen_range(0..=self.slots.len());
                self.slots.insert(at, record);
            }
            None => self.inner_done = true,
        }
    }
}

impl<I: Iterator<Item = Record>> Iterator for ShuffleBucket<I> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        while self.slots.len() < self.capacity && !self.inner_done {
            self.pull();
        }
        if self.slots.is_empty() {
            return None;
        }
        let at = self.rng.gen_range(0..self.slots.len());
        let record = self.slots.swap_remove(at);
        self.pull();
        Some(record)
    }
}
