//! Corpus reading.
//!
//! A split is a JSONL file with one record per line: either plain text
//! (`{"text": "..."}`) or a serialized PSI tree (`{"AST": [...]}`).
//! Unparsable lines are logged, counted, and skipped; they never abort an
//! epoch. The corruption count is surfaced for epoch-level reporting.

use flint_core::{FlintError, Result, Split};
use serde::Deserialize;
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

/// Node name emitted by the PSI parser for unparsable regions. Records
/// containing it are treated as corrupt.
const PSI_ERROR_NODE: &str = "ERROR_ELEMENT";

/// One source unit: a file's text or a linearized PSI tree.
///
/// Immutable once read. `index` is the record's line number in the split
/// file and is its stable identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Line index in the split file.
    pub index: usize,
    /// Split this record came from.
    pub split: Split,
    /// Parsed content.
    pub content: RecordContent,
}

impl Record {
    /// Convenience constructor for a text record.
    #[must_use]
    pub fn text(index: usize, split: Split, text: impl Into<String>) -> Self {
        Self {
            index,
            split,
            content: RecordContent::Text(text.into()),
        }
    }
}

/// Record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordContent {
    /// Raw source text.
    Text(String),
    /// PSI tree linearized depth-first into node/token names.
    Tree(Vec<String>),
}

impl RecordContent {
    /// Textual form handed to the tokenizer.
    #[must_use]
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Text(s) => Cow::Borrowed(s),
            Self::Tree(nodes) => Cow::Owned(nodes.join(" ")),
        }
    }
}

/// A 1-of-N partition of the record stream. Record `i` belongs to the shard
/// with `i % count == index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    /// Shard index in `[0, count)`.
    pub index: usize,
    /// Total number of shards.
    pub count: usize,
}

impl Shard {
    /// The whole stream as a single shard.
    #[must_use]
    pub fn full() -> Self {
        Self { index: 0, count: 1 }
    }

    fn accepts(&self, record_index: usize) -> bool {
        record_index % self.count == self.index
    }
}

#[derive(Debug, Deserialize)]
struct PsiNode {
    node: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRecord {
    Text {
        text: String,
    },
    Psi {
        #[serde(rename = "AST")]
        ast: Vec<PsiNode>,
    },
}

/// Lazy, restartable reader over one shard of a corpus split.
///
/// Exhausting the iterator signals end-of-epoch; reopen for the next one.
#[derive(Debug)]
pub struct CorpusReader {
    path: PathBuf,
    split: Split,
    shard: Shard,
    lines: Lines<BufReader<File>>,
    next_index: usize,
    corrupt: u64,
    filtered: u64,
    max_record_nodes: Option<usize>,
    io_error: Option<std::io::Error>,
}

impl CorpusReader {
    /// Open one shard of a split file.
    pub fn open(
        path: impl AsRef<Path>,
        split: Split,
        shard: Shard,
        max_record_nodes: Option<usize>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug_assert!(shard.index < shard.count);
        let file = File::open(&path).map_err(|e| {
            FlintError::Corpus(format!(
                "cannot open {} split at {}: {}",
                split,
                path.display(),
                e
            ))
        })?;
        Ok(Self {
            path,
            split,
            shard,
            lines: BufReader::new(file).lines(),
            next_index: 0,
            corrupt: 0,
            filtered: 0,
            max_record_nodes,
            io_error: None,
        })
    }

    /// Records skipped as corrupt so far.
    #[must_use]
    pub fn corrupt_records(&self) -> u64 {
        self.corrupt
    }

    /// Records skipped by the tree-size filter so far.
    #[must_use]
    pub fn filtered_records(&self) -> u64 {
        self.filtered
    }

    /// I/O failure that terminated iteration early, if any.
    pub fn take_io_error(&mut self) -> Option<std::io::Error> {
        self.io_error.take()
    }

    fn parse_line(&self, index: usize, line: &str) -> std::result::Result<Option<Record>, String> {
        let raw: RawRecord =
            serde_json::from_str(line).map_err(|e| format!("invalid JSON: {e}"))?;
        let content = match raw {
            RawRecord::Text { text } => {
                if text.trim().is_empty() {
                    return Err("empty text payload".into());
                }
                RecordContent::Text(text)
            }
            RawRecord::Psi { ast } => {
                if ast.is_empty() {
                    return Err("empty PSI tree".into());
                }
                if ast.iter().any(|n| n.node == PSI_ERROR_NODE) {
                    return Err("PSI tree contains an error node".into());
                }
                if let Some(cap) = self.max_record_nodes {
                    if ast.len() > cap {
                        return Ok(None);
                    }
                }
                let mut names = Vec::with_capacity(ast.len() * 2);
                for node in ast {
                    names.push(node.node);
                    if let Some(token) = node.token {
                        names.push(token);
                    }
                }
                RecordContent::Tree(names)
            }
        };
        Ok(Some(Record {
            index,
            split: self.split,
            content,
        }))
    }
}

impl Iterator for CorpusReader {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(
                        path = %self.path.display(),
                        "corpus read failed, ending epoch early: {e}"
                    );
                    self.io_error = Some(e);
                    return None;
                }
            };
            let index = self.next_index;
            self.next_index += 1;

            if !self.shard.accepts(index) || line.trim().is_empty() {
                continue;
            }

            match self.parse_line(index, &line) {
                Ok(Some(record)) => return Some(record),
                Ok(None) => {
                    self.filtered += 1;
                    tracing::debug!(record = index, "skipping oversized record");
                }
                Err(reason) => {
                    self.corrupt += 1;
                    tracing::warn!(
                        record = index,
                        split = %self.split,
                        "skipping corrupt record: {reason}"
                    );
                }
            }
        }
    }
}

/// Count the records (lines) in a split file. Used to estimate per-epoch
/// work for the validation cadence.
pub fn count_records(path: impl AsRef<Path>) -> Result<usize> {
    let file = File::open(path.as_ref())?;
    let mut count = 0usize;
    for line in BufReader::new(file).lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}
