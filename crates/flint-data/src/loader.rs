//! Multi-worker window loader.
//!
//! Each rank runs `num_dataset_workers` loader threads that pipeline
//! Reader → Sampler → Tokenizer → Slicer ahead of the training step. Worker
//! `w` of `W` on rank `r` of `R` owns shard `r*W + w` of `R*W`, so workers
//! share no mutable state and every record is processed by exactly one
//! worker of exactly one rank per epoch.
//!
//! Windows flow through one bounded channel; when the trainer falls behind,
//! the channel exerts backpressure on the workers.

use crate::corpus::{CorpusReader, Shard};
use crate::shuffle::{epoch_seed, ShuffleBucket};
use crate::slicer::{OverlapSlicer, Window};
use crate::tokenizer::TokenizerAdapter;
use flint_core::{FlintError, Result, Split};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Mixes a worker index into an epoch seed so sibling workers draw
/// decorrelated permutations.
const WORKER_SEED_MIX: u64 = 0x9e37_79b9_7f4a_7c15;

/// Options for spawning a [`WindowLoader`].
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Split file to read.
    pub path: PathBuf,
    /// Which split this is; only the train split is shuffled.
    pub split: Split,
    /// Rank of this process.
    pub rank: usize,
    /// Total ranks.
    pub world_size: usize,
    /// Loader threads to spawn.
    pub num_workers: usize,
    /// Shuffle bucket capacity per worker.
    pub shuffle_bucket: usize,
    /// Base RNG seed.
    pub seed: u64,
    /// Epoch index; shifts the shuffle permutation.
    pub epoch: u64,
    /// Optional PSI tree-size cap.
    pub max_record_nodes: Option<usize>,
    /// Bounded channel capacity (windows buffered ahead of the trainer).
    pub queue_depth: usize,
    /// Windows each worker should skip before emitting, for resume; empty
    /// means none.
    pub skip_windows: Vec<u64>,
}

/// Handle over a pool of loader workers feeding one bounded window queue.
pub struct WindowLoader {
    rx: mpsc::Receiver<Window>,
    corrupt: Arc<AtomicU64>,
    handles: Vec<std::thread::JoinHandle<Result<()>>>,
}

impl WindowLoader {
    /// Spawn the worker pool.
    pub fn spawn(
        opts: LoaderOptions,
        tokenizer: Arc<TokenizerAdapter>,
        slicer: OverlapSlicer,
    ) -> Result<Self> {
        if !opts.skip_windows.is_empty() && opts.skip_windows.len() != opts.num_workers {
            return Err(FlintError::ConfigValidation(format!(
                "resume state tracks {} workers but the loader has {}",
                opts.skip_windows.len(),
                opts.num_workers
            )));
        }

        let (tx, rx) = mpsc::channel(opts.queue_depth.max(1));
        let corrupt = Arc::new(AtomicU64::new(0));
        let opts = Arc::new(opts);
        let mut handles = Vec::with_capacity(opts.num_workers);

        for worker in 0..opts.num_workers {
            let tx = tx.clone();
            let opts = Arc::clone(&opts);
            let tokenizer = Arc::clone(&tokenizer);
            let slicer = slicer.clone();
            let corrupt = Arc::clone(&corrupt);
            let skip = opts.skip_windows.get(worker).copied().unwrap_or(0);
            let handle = std::thread::Builder::new()
                .name(format!("flint-loader-{worker}"))
                .spawn(move || run_worker(&opts, worker, skip, &tokenizer, &slicer, &tx, &corrupt))?;
            handles.push(handle);
        }

        Ok(Self {
            rx,
            corrupt,
            handles,
        })
    }

    /// Next window, blocking until one is available. `None` once every
    /// worker has drained its shard.
    pub fn next_window(&mut self) -> Option<Window> {
        self.rx.blocking_recv()
    }

    /// Corrupt records skipped so far (aggregated across workers as they
    /// finish).
    #[must_use]
    pub fn corrupt_records(&self) -> u64 {
        self.corrupt.load(Ordering::SeqCst)
    }

    /// Stop the pool, join every worker, and surface the first worker
    /// error. Returns the final corrupt-record count.
    pub fn finish(self) -> Result<u64> {
        let Self {
            rx,
            corrupt,
            handles,
        } = self;
        // Dropping the receiver unblocks any worker waiting on a full queue.
        drop(rx);
        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => {
                    return Err(FlintError::Training("data loader worker panicked".into()))
                }
            }
        }
        Ok(corrupt.load(Ordering::SeqCst))
    }
}

enum RecordStream {
    Plain(CorpusReader),
    Shuffled(ShuffleBucket<CorpusReader>),
}

impl RecordStream {
    fn reader_mut(&mut self) -> &mut CorpusReader {
        match self {
            Self::Plain(reader) => reader,
            Self::Shuffled(bucket) => bucket.inner_mut(),
        }
    }
}

impl Iterator for RecordStream {
    type Item = crate::corpus::Record;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Plain(reader) => reader.next(),
            Self::Shuffled(bucket) => bucket.next(),
        }
    }
}

fn run_worker(
    opts: &LoaderOptions,
    worker: usize,
    skip: u64,
    tokenizer: &TokenizerAdapter,
    slicer: &OverlapSlicer,
    tx: &mpsc::Sender<Window>,
    corrupt: &AtomicU64,
) -> Result<()> {
    let shard = Shard {
        index: opts.rank * opts.num_workers + worker,
        count: opts.world_size * opts.num_workers,
    };
    let reader = CorpusReader::open(&opts.path, opts.split, shard, opts.max_record_nodes)?;

    let mut stream = if opts.split.shuffled() {
        let seed = epoch_seed(opts.seed, opts.epoch)
            ^ (worker as u64).wrapping_mul(WORKER_SEED_MIX);
        RecordStream::Shuffled(ShuffleBucket::new(reader, opts.shuffle_bucket, seed))
    } else {
        RecordStream::Plain(reader)
    };

    let mut skipped = 0u64;
    'records: while let Some(record) = stream.next() {
        let seq = match tokenizer.encode_record(&record) {
            Ok(seq) => seq,
            Err(e) => {
                corrupt.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(record = record.index, "skipping unencodable record: {e}");
                continue;
            }
        };
        for mut window in slicer.windows(&seq) {
            if skipped < skip {
                skipped += 1;
                continue;
            }
            window.worker = worker;
            if tx.blocking_send(window).is_err() {
                // Receiver gone: the trainer stopped consuming this epoch.
                break 'records;
            }
        }
    }

    let reader = stream.reader_mut();
    corrupt.fetch_add(reader.corrupt_records(), Ordering::SeqCst);
    if let Some(e) = reader.take_io_error() {
        return Err(FlintError::Io(e));
    }
    Ok(())
}
