//! Configuration types for FLINT.
//!
//! Every recognized option is enumerated here and range-checked once at
//! process start ([`ExperimentConfig::validate`]). The validated snapshot is
//! immutable for the lifetime of the run.

use crate::schedule::LrDecay;
use crate::{FlintError, MetricMode, Precision, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Tokenizer configuration.
///
/// `vocab_size`, `min_frequency` and `dropout` govern the external
/// vocabulary-training process; at runtime only `file` and the recorded
/// `vocab_size` (for a consistency check) are consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Path to the pretrained tokenizer file.
    #[serde(default = "default_tokenizer_file")]
    pub file: PathBuf,

    /// Vocabulary size the tokenizer was trained with.
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Minimum subword frequency used during vocabulary construction.
    #[serde(default = "default_min_frequency")]
    pub min_frequency: usize,

    /// BPE dropout used during vocabulary construction.
    #[serde(default)]
    pub dropout: f64,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            file: default_tokenizer_file(),
            vocab_size: default_vocab_size(),
            min_frequency: default_min_frequency(),
            dropout: 0.0,
        }
    }
}

/// Dataset and pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// JSONL file with the training split.
    pub train_path: PathBuf,

    /// JSONL file with the validation split.
    pub val_path: PathBuf,

    /// JSONL file with the test split, if any.
    #[serde(default)]
    pub test_path: Option<PathBuf>,

    /// Capacity of the in-memory shuffle bucket (records held at once).
    #[serde(default = "default_shuffle_bucket")]
    pub shuffle_bucket: usize,

    /// Fraction of the context window shared by consecutive windows of the
    /// same sequence. Stride is `round(context_length * (1 - overlap))`.
    #[serde(default = "default_overlap_slicing")]
    pub overlap_slicing: f64,

    /// Label policy for overlapped positions: `true` labels them again in
    /// every window, `false` masks repeats with the ignore sentinel.
    #[serde(default)]
    pub pad_overlapped: bool,

    /// Data-loading worker threads per rank.
    #[serde(default = "default_num_dataset_workers")]
    pub num_dataset_workers: usize,

    /// Skip PSI records whose tree exceeds this many nodes.
    #[serde(default)]
    pub max_record_nodes: Option<usize>,

    /// Drop the final short batch of a training epoch.
    #[serde(default = "default_true")]
    pub drop_last_train: bool,

    /// Drop the final short batch of an evaluation pass.
    #[serde(default)]
    pub drop_last_eval: bool,
}

/// Model geometry. Opaque to the pipeline except `context_length` and
/// `labels_pad`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hidden dimension.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Number of transformer layers.
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,

    /// Context window length; every training window has exactly this many
    /// positions.
    #[serde(default = "default_context_length")]
    pub context_length: usize,

    /// Ignore sentinel written into label positions excluded from the loss.
    #[serde(default = "default_labels_pad")]
    pub labels_pad: i64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            n_layers: default_n_layers(),
            context_length: default_context_length(),
            labels_pad: default_labels_pad(),
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Base learning rate, scaled by the effective batch size at startup.
    #[serde(default = "default_base_lr")]
    pub base_lr: f64,

    /// AdamW epsilon.
    #[serde(default = "default_adam_eps")]
    pub adam_eps: f64,

    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Micro-batch size per rank.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Micro-batches accumulated before each optimizer step.
    #[serde(default = "default_one")]
    pub grad_accumulation_steps: usize,

    /// Global gradient-norm clip applied before every optimizer step.
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,

    /// Cumulative tokens over which the learning rate warms up linearly.
    #[serde(default = "default_warmup_tokens")]
    pub warmup_tokens: u64,

    /// Decay applied to the learning rate after warmup.
    #[serde(default)]
    pub lr_decay: LrDecay,

    /// Decoupled weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Fraction of an epoch between validation passes (0, 1].
    #[serde(default = "default_val_check_interval")]
    pub val_check_interval: f64,

    /// Number of best checkpoints retained, ranked by validation metric.
    #[serde(default = "default_save_top_k")]
    pub save_top_k: usize,

    /// Direction in which the checkpoint metric improves.
    #[serde(default)]
    pub metric_mode: MetricMode,

    /// Numeric precision; `fp16` enables dynamic loss scaling.
    #[serde(default)]
    pub precision: Precision,

    /// Base RNG seed for shuffling and any stochastic component.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Directory where checkpoint snapshots are written.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Resume path: literal, or a template containing `{run_id}`.
    #[serde(default)]
    pub resume_from_checkpoint: Option<String>,

    /// Identifier for this run; generated from the start time when absent.
    #[serde(default)]
    pub run_id: Option<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            base_lr: default_base_lr(),
            adam_eps: default_adam_eps(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            grad_accumulation_steps: default_one(),
            max_grad_norm: default_max_grad_norm(),
            warmup_tokens: default_warmup_tokens(),
            lr_decay: LrDecay::default(),
            weight_decay: default_weight_decay(),
            val_check_interval: default_val_check_interval(),
            save_top_k: default_save_top_k(),
            metric_mode: MetricMode::default(),
            precision: Precision::default(),
            seed: default_seed(),
            checkpoint_dir: default_checkpoint_dir(),
            resume_from_checkpoint: None,
            run_id: None,
        }
    }
}

/// Distributed topology for this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Total number of worker processes.
    #[serde(default = "default_one")]
    pub world_size: usize,

    /// Rank of this process in `[0, world_size)`.
    #[serde(default)]
    pub local_rank: usize,

    /// GPUs per node; recorded for launcher scripts, unused by the core.
    #[serde(default = "default_one")]
    pub n_gpus: usize,

    /// Ring peer addresses, one per rank, in rank order. Required when
    /// `world_size > 1`.
    #[serde(default)]
    pub nodes: Vec<SocketAddr>,

    /// Timeout for every blocking collective (all-reduce, barrier).
    #[serde(default = "default_collective_timeout_ms")]
    pub collective_timeout_ms: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            local_rank: 0,
            n_gpus: 1,
            nodes: Vec::new(),
            collective_timeout_ms: default_collective_timeout_ms(),
        }
    }
}

/// Complete immutable configuration for a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Tokenizer configuration.
    #[serde(default)]
    pub tokenizer: TokenizerConfig,

    /// Dataset and pipeline configuration.
    pub dataset: DataConfig,

    /// Model geometry.
    #[serde(default)]
    pub model: ModelConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Distributed topology.
    #[serde(default)]
    pub distributed: DistributedConfig,
}

impl ExperimentConfig {
    /// Slicing stride in tokens: `round(context_length * (1 - overlap))`.
    #[must_use]
    pub fn stride(&self) -> usize {
        stride(self.model.context_length, self.dataset.overlap_slicing)
    }

    /// Windows per optimizer step across all ranks.
    #[must_use]
    pub fn effective_batch_size(&self) -> usize {
        self.training.batch_size
            * self.training.grad_accumulation_steps
            * self.distributed.world_size
    }

    /// Base learning rate scaled by the effective batch size.
    #[must_use]
    pub fn scaled_lr(&self) -> f64 {
        self.training.base_lr * self.effective_batch_size() as f64
    }

    /// Range-check every option; called once at startup.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.tokenizer.vocab_size < 2 {
            problems.push("tokenizer.vocab_size must be at least 2".to_string());
        }
        if self.tokenizer.min_frequency == 0 {
            problems.push("tokenizer.min_frequency must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.tokenizer.dropout) {
            problems.push("tokenizer.dropout must be in [0, 1)".to_string());
        }

        if self.dataset.shuffle_bucket < self.training.batch_size {
            problems.push(format!(
                "dataset.shuffle_bucket ({}) must be >= training.batch_size ({})",
                self.dataset.shuffle_bucket, self.training.batch_size
            ));
        }
        if !(0.0..1.0).contains(&self.dataset.overlap_slicing) {
            problems.push("dataset.overlap_slicing must be in [0, 1)".to_string());
        }
        if self.model.context_length == 0 {
            problems.push("model.context_length must be positive".to_string());
        } else if stride(self.model.context_length, self.dataset.overlap_slicing) == 0 {
            problems.push(format!(
                "context_length {} with overlap {} yields a zero stride",
                self.model.context_length, self.dataset.overlap_slicing
            ));
        }
        if self.dataset.num_dataset_workers == 0 {
            problems.push("dataset.num_dataset_workers must be positive".to_string());
        }

        if self.model.hidden_size == 0 {
            problems.push("model.hidden_size must be positive".to_string());
        }
        if self.model.n_layers == 0 {
            problems.push("model.n_layers must be positive".to_string());
        }
        if self.model.labels_pad >= 0 {
            problems.push("model.labels_pad must be a negative sentinel".to_string());
        }

        if self.training.base_lr <= 0.0 {
            problems.push("training.base_lr must be positive".to_string());
        }
        if self.training.adam_eps <= 0.0 {
            problems.push("training.adam_eps must be positive".to_string());
        }
        if self.training.epochs == 0 {
            problems.push("training.epochs must be positive".to_string());
        }
        if self.training.batch_size == 0 {
            problems.push("training.batch_size must be positive".to_string());
        }
        if self.training.grad_accumulation_steps == 0 {
            problems.push("training.grad_accumulation_steps must be positive".to_string());
        }
        if self.training.max_grad_norm <= 0.0 {
            problems.push("training.max_grad_norm must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.training.val_check_interval)
            || self.training.val_check_interval == 0.0
        {
            problems.push("training.val_check_interval must be in (0, 1]".to_string());
        }
        if self.training.save_top_k == 0 {
            problems.push("training.save_top_k must be positive".to_string());
        }

        if self.distributed.world_size == 0 {
            problems.push("distributed.world_size must be positive".to_string());
        } else if self.distributed.local_rank >= self.distributed.world_size {
            problems.push(format!(
                "distributed.local_rank ({}) must be < world_size ({})",
                self.distributed.local_rank, self.distributed.world_size
            ));
        }
        if self.distributed.n_gpus == 0 {
            problems.push("distributed.n_gpus must be positive".to_string());
        }
        if self.distributed.world_size > 1
            && self.distributed.nodes.len() != self.distributed.world_size
        {
            problems.push(format!(
                "distributed.nodes lists {} addresses for world_size {}",
                self.distributed.nodes.len(),
                self.distributed.world_size
            ));
        }
        if self.distributed.collective_timeout_ms == 0 {
            problems.push("distributed.collective_timeout_ms must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(FlintError::ConfigValidation(problems.join("; ")))
        }
    }
}

/// Slicing stride for a context length and overlap fraction.
#[must_use]
pub fn stride(context_length: usize, overlap: f64) -> usize {
    (context_length as f64 * (1.0 - overlap)).round() as usize
}

// Default value functions
fn default_tokenizer_file() -> PathBuf {
    "tokenizer.json".into()
}
fn default_vocab_size() -> usize {
    16384
}
fn default_min_frequency() -> usize {
    2
}
fn default_shuffle_bucket() -> usize {
    512
}
fn default_overlap_slicing() -> f64 {
    0.5
}
fn default_num_dataset_workers() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_hidden_size() -> usize {
    512
}
fn default_n_layers() -> usize {
    8
}
fn default_context_length() -> usize {
    384
}
fn default_labels_pad() -> i64 {
    -100
}
fn default_base_lr() -> f64 {
    1e-5
}
fn default_adam_eps() -> f64 {
    1e-8
}
fn default_epochs() -> usize {
    4
}
fn default_batch_size() -> usize {
    16
}
fn default_one() -> usize {
    1
}
fn default_max_grad_norm() -> f64 {
    1.0
}
fn default_warmup_tokens() -> u64 {
    50_000_000
}
fn default_weight_decay() -> f64 {
    0.01
}
fn default_val_check_interval() -> f64 {
    0.25
}
fn default_save_top_k() -> usize {
    3
}
fn default_seed() -> u64 {
    42
}
fn default_checkpoint_dir() -> PathBuf {
    "checkpoints".into()
}
fn default_collective_timeout_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ExperimentConfig {
        ExperimentConfig {
            tokenizer: TokenizerConfig::default(),
            dataset: DataConfig {
                train_path: "train.jsonl".into(),
                val_path: "val.jsonl".into(),
                test_path: None,
                shuffle_bucket: 64,
                overlap_slicing: 0.5,
                pad_overlapped: false,
                num_dataset_workers: 2,
                max_record_nodes: None,
                drop_last_train: true,
                drop_last_eval: false,
            },
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            distributed: DistributedConfig::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        base_config().validate().unwrap();
    }

    #[test]
    fn rejects_small_shuffle_bucket() {
        let mut cfg = base_config();
        cfg.dataset.shuffle_bucket = cfg.training.batch_size - 1;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, FlintError::ConfigValidation(_)));
        assert!(err.to_string().contains("shuffle_bucket"));
    }

    #[test]
    fn rejects_degenerate_stride() {
        let mut cfg = base_config();
        cfg.model.context_length = 1;
        cfg.dataset.overlap_slicing = 0.9;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("stride"));
    }

    #[test]
    fn rejects_rank_out_of_range() {
        let mut cfg = base_config();
        cfg.distributed.world_size = 2;
        cfg.distributed.local_rank = 2;
        cfg.distributed.nodes = vec![
            "127.0.0.1:29500".parse().unwrap(),
            "127.0.0.1:29501".parse().unwrap(),
        ];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_positive_labels_pad() {
        let mut cfg = base_config();
        cfg.model.labels_pad = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stride_rounds_to_nearest() {
        // 64 * (1 - 0.1) = 57.6 -> 58
        assert_eq!(stride(64, 0.1), 58);
        assert_eq!(stride(384, 0.5), 192);
        assert_eq!(stride(10, 0.0), 10);
    }

    #[test]
    fn effective_batch_and_lr_scaling() {
        let mut cfg = base_config();
        cfg.training.batch_size = 16;
        cfg.training.grad_accumulation_steps = 4;
        cfg.distributed.world_size = 2;
        cfg.distributed.nodes = vec![
            "127.0.0.1:29500".parse().unwrap(),
            "127.0.0.1:29501".parse().unwrap(),
        ];
        assert_eq!(cfg.effective_batch_size(), 128);
        assert!((cfg.scaled_lr() - cfg.training.base_lr * 128.0).abs() < 1e-12);
    }

    #[test]
    fn yaml_defaults_round_trip() {
        let yaml = r#"
dataset:
  train_path: data/train.jsonl
  val_path: data/val.jsonl
  shuffle_bucket: 128
"#;
        let cfg: ExperimentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.dataset.shuffle_bucket, 128);
        assert_eq!(cfg.training.batch_size, default_batch_size());
        cfg.validate().unwrap();
    }
}
