//! Data supply pipeline for FLINT.
//!
//! This crate turns JSONL corpora of source files (plain text or PSI trees)
//! into a steady, shuffled, memory-bounded stream of fixed-length training
//! windows:
//!
//! - Corpus reading with per-record corruption tolerance
//! - Tokenizer adapter around a pretrained subword vocabulary
//! - Shuffle-bucket sampling with bounded memory
//! - Overlap slicing into fixed-length input/label windows
//! - Batch assembly
//! - A multi-worker loader that pipelines all of the above ahead of the
//!   training step

#![warn(missing_docs)]

pub mod batch;
pub mod corpus;
pub mod loader;
pub mod shuffle;
pub mod slicer;
pub mod tokenizer;

pub use batch::{BatchAssembler, TrainingBatch};
pub use corpus::{count_records, CorpusReader, Record, RecordContent, Shard};
pub use loader::{LoaderOptions, WindowLoader};
pub use shuffle::{epoch_seed, ShuffleBucket};
pub use slicer::{OverlapSlicer, Window};
pub use tokenizer::{TokenSequence, TokenizerAdapter};
