//! Tokenizer integration.

use crate::corpus::Record;
use flint_core::{FlintError, Result};
use std::path::Path;

/// Token ids for one record, paired with the record's identity.
///
/// Never mutated after creation; the slicer only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence {
    /// Index of the source record.
    pub record: usize,
    /// Encoded token ids.
    pub ids: Vec<u32>,
}

/// Wrapper around a pretrained `tokenizers` vocabulary.
///
/// Encoding is pure and deterministic for a fixed vocabulary file. The
/// vocabulary-training parameters (`vocab_size`, `min_frequency`, dropout)
/// belong to the external training process and play no role here.
pub struct TokenizerAdapter {
    inner: tokenizers::Tokenizer,
    pad_id: u32,
    ignore_label: i64,
}

impl TokenizerAdapter {
    /// Load a tokenizer from a local file.
    pub fn from_file(path: impl AsRef<Path>, ignore_label: i64) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path.as_ref())
            .map_err(|e| FlintError::Tokenizer(e.to_string()))?;
        Self::from_tokenizer(inner, ignore_label)
    }

    /// Wrap an already-constructed tokenizer.
    pub fn from_tokenizer(inner: tokenizers::Tokenizer, ignore_label: i64) -> Result<Self> {
        let pad_id = resolve_pad_id(&inner).ok_or_else(|| {
            FlintError::Tokenizer("vocabulary defines no pad or end-of-text token".into())
        })?;
        Ok(Self {
            inner,
            pad_id,
            ignore_label,
        })
    }

    /// Encode text to token ids.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| FlintError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode one record into a token sequence.
    pub fn encode_record(&self, record: &Record) -> Result<TokenSequence> {
        let ids = self.encode(record.content.as_text().as_ref())?;
        Ok(TokenSequence {
            record: record.index,
            ids,
        })
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Token id used to right-pad window tails.
    #[must_use]
    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Sentinel written into label positions excluded from the loss.
    #[must_use]
    pub fn ignore_label(&self) -> i64 {
        self.ignore_label
    }
}

fn resolve_pad_id(tokenizer: &tokenizers::Tokenizer) -> Option<u32> {
    tokenizer
        .token_to_id("<pad>")
        .or_else(|| tokenizer.token_to_id("[PAD]"))
        .or_else(|| tokenizer.token_to_id("<|pad|>"))
        .or_else(|| tokenizer.token_to_id("</s>"))
        .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
}


#[cfg(test)]
mod tests {
    use super::testing::tiny_tokenizer;
    use super::*;
    use flint_core::Split;

    #[test]
    fn encode_is_deterministic() {
        let adapter = tiny_tokenizer(&["fn", "main"]);
        let a = adapter.encode("fn main fn").unwrap();
        let b = adapter.encode("fn main fn").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, vec![2, 3, 2]);
    }

    #[test]
    fn pad_and_ignore_sentinels() {
        let adapter = tiny_tokenizer(&[]);
        assert_eq!(adapter.pad_id(), 1);
        assert_eq!(adapter.ignore_label(), -100);
    }

    #[test]
    fn encodes_tree_records_via_linearization() {
        let adapter = tiny_tokenizer(&["FILE", "IDENT", "main"]);
        let record = Record {
            index: 7,
            split: Split::Train,
            content: crate::corpus::RecordContent::Tree(vec![
                "FILE".into(),
                "IDENT".into(),
                "main".into(),
            ]),
        };
        let seq = adapter.encode_record(&record).unwrap();
        assert_eq!(seq.record, 7);
        assert_eq!(seq.ids, vec![2, 3, 4]);
    }

    #[test]
    fn unknown_words_map_to_unk() {
        let adapter = tiny_tokenizer(&["known"]);
        let ids = adapter.encode("known mystery").unwrap();
        assert_eq!(ids, vec![2, 0]);
    }
}
