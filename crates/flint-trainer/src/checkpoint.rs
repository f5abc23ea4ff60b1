//! Checkpoint save/load with top-K retention.
//!
//! Layout: `<checkpoint_dir>/<run_id>/epoch{E}-step{S}/` holding
//! `model.safetensors` (parameters + optimizer state) and `state.json`
//! (training state and the snapshot's validation metric, so every snapshot
//! is self-describing for ranking).

use crate::model::{NamedTensor, StateDict};
use flint_core::{FlintError, MetricMode, Result, TrainingState};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const WEIGHTS_FILE: &str = "model.safetensors";
const STATE_FILE: &str = "state.json";

/// Placeholder replaced by the run identifier when resolving resume paths.
const RUN_ID_TOKEN: &str = "{run_id}";

/// Metadata stored next to the weights of every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Run that produced this snapshot.
    pub run_id: String,
    /// Validation metric used for ranking.
    pub metric: f64,
    /// Direction in which the metric improves.
    pub metric_mode: MetricMode,
    /// Seconds since the Unix epoch at save time.
    pub timestamp: String,
    /// Full training state at save time.
    pub state: TrainingState,
}

/// Handle to a retained snapshot.
#[derive(Debug, Clone)]
pub struct CheckpointHandle {
    /// Snapshot directory.
    pub path: PathBuf,
    /// Ranking metric.
    pub metric: f64,
    /// Epoch at save time.
    pub epoch: usize,
    /// Optimizer step at save time.
    pub step: usize,
}

/// Persists snapshots and enforces top-K retention by validation metric.
pub struct CheckpointManager {
    root: PathBuf,
    run_id: String,
    top_k: usize,
    mode: MetricMode,
    /// Retained snapshots ordered best first.
    retained: Vec<CheckpointHandle>,
}

impl CheckpointManager {
    /// Open (or create) the snapshot directory for a run. Existing
    /// snapshots are scanned so retention continues across resumes.
    pub fn new(
        dir: impl AsRef<Path>,
        run_id: impl Into<String>,
        top_k: usize,
        mode: MetricMode,
    ) -> Result<Self> {
        let run_id = run_id.into();
        let root = dir.as_ref().join(&run_id);
        fs::create_dir_all(&root)?;

        let mut manager = Self {
            root,
            run_id,
            top_k: top_k.max(1),
            mode,
            retained: Vec::new(),
        };
        manager.scan_existing()?;
        Ok(manager)
    }

    fn scan_existing(&mut self) -> Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match Self::read_meta(&path) {
                Ok(meta) => self.retained.push(CheckpointHandle {
                    path,
                    metric: meta.metric,
                    epoch: meta.state.epoch,
                    step: meta.state.global_step,
                }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "ignoring unreadable snapshot: {e}");
                }
            }
        }
        self.sort_retained();
        Ok(())
    }

    fn sort_retained(&mut self) {
        let mode = self.mode;
        self.retained.sort_by(|a, b| {
            if mode.better(a.metric, b.metric) {
                std::cmp::Ordering::Less
            } else if mode.better(b.metric, a.metric) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
    }

    /// Write a snapshot and update the retained set, evicting the worst
    /// entry once more than `top_k` are held.
    pub fn save(
        &mut self,
        model_state: &StateDict,
        state: &TrainingState,
        metric: f64,
    ) -> Result<CheckpointHandle> {
        let name = format!("epoch{}-step{}", state.epoch, state.global_step);
        let path = self.root.join(&name);
        fs::create_dir_all(&path)?;

        write_state_dict(model_state, &path.join(WEIGHTS_FILE))?;
        let meta = CheckpointMeta {
            run_id: self.run_id.clone(),
            metric,
            metric_mode: self.mode,
            timestamp: unix_timestamp(),
            state: state.clone(),
        };
        fs::write(path.join(STATE_FILE), serde_json::to_string_pretty(&meta)?)?;

        let handle = CheckpointHandle {
            path: path.clone(),
            metric,
            epoch: state.epoch,
            step: state.global_step,
        };
        tracing::info!(
            path = %path.display(),
            metric,
            "saved checkpoint"
        );

        // Re-saving the same step replaces its entry.
        self.retained.retain(|h| h.path != path);
        self.retained.push(handle.clone());
        self.sort_retained();
        while self.retained.len() > self.top_k {
            let Some(evicted) = self.retained.pop() else {
                break;
            };
            if let Err(e) = fs::remove_dir_all(&evicted.path) {
                tracing::warn!(
                    path = %evicted.path.display(),
                    "failed to remove evicted checkpoint: {e}"
                );
            } else {
                tracing::info!(
                    path = %evicted.path.display(),
                    metric = evicted.metric,
                    "evicted checkpoint"
                );
            }
        }
        Ok(handle)
    }

    /// Resolve a resume path: a literal path, or a template containing
    /// `{run_id}`.
    pub fn resolve(spec: &str, run_id: &str) -> Result<PathBuf> {
        let resolved = spec.replace(RUN_ID_TOKEN, run_id);
        let path = PathBuf::from(resolved);
        if path.join(STATE_FILE).is_file() {
            Ok(path)
        } else {
            Err(FlintError::CheckpointNotFound(path.display().to_string()))
        }
    }

    /// Load a snapshot's tensors and metadata.
    pub fn load(path: impl AsRef<Path>) -> Result<(StateDict, CheckpointMeta)> {
        let path = path.as_ref();
        let meta = Self::read_meta(path)?;
        let state = read_state_dict(&path.join(WEIGHTS_FILE)).map_err(|e| corrupt(path, e))?;
        Ok((state, meta))
    }

    fn read_meta(path: &Path) -> Result<CheckpointMeta> {
        let raw = fs::read_to_string(path.join(STATE_FILE)).map_err(|e| corrupt(path, e))?;
        serde_json::from_str(&raw).map_err(|e| corrupt(path, e))
    }

    /// Retained snapshots, best first.
    #[must_use]
    pub fn retained(&self) -> &[CheckpointHandle] {
        &self.retained
    }

    /// Best retained snapshot, if any.
    #[must_use]
    pub fn best(&self) -> Option<&CheckpointHandle> {
        self.retained.first()
    }
}

fn corrupt(path: &Path, reason: impl std::fmt::Display) -> FlintError {
    FlintError::CheckpointCorrupt {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn unix_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_secs())
}

fn write_state_dict(state: &StateDict, path: &Path) -> Result<()> {
    let views: Vec<(String, TensorView<'_>)> = state
        .iter()
        .map(|(name, tensor)| {
            let view = TensorView::new(
                Dtype::F32,
                tensor.shape.clone(),
                bytemuck::cast_slice(&tensor.data),
            )
            .map_err(|e| FlintError::Serialization(format!("tensor {name}: {e}")))?;
            Ok((name.clone(), view))
        })
        .collect::<Result<_>>()?;
    safetensors::serialize_to_file(views, &None, path)
        .map_err(|e| FlintError::Serialization(e.to_string()))
}

fn read_state_dict(path: &Path) -> std::result::Result<StateDict, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    let tensors = SafeTensors::deserialize(&bytes).map_err(|e| e.to_string())?;
    let mut state = StateDict::new();
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(format!("tensor {name} has dtype {:?}, expected F32", view.dtype()));
        }
        let data: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let shape = view.shape().to_vec();
        state.insert(name, NamedTensor { shape, data });
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tiny_state_dict(fill: f32) -> StateDict {
        let mut state = StateDict::new();
        state.insert(
            "weight".into(),
            NamedTensor {
                shape: vec![2, 2],
                data: vec![fill; 4],
            },
        );
        state
    }

    fn training_state(epoch: usize, step: usize) -> TrainingState {
        let mut state = TrainingState::new("test-run", 42, 2);
        state.epoch = epoch;
        state.global_step = step;
        state
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut manager =
            CheckpointManager::new(dir.path(), "test-run", 3, MetricMode::Min).unwrap();

        let handle = manager
            .save(&tiny_state_dict(1.5), &training_state(1, 10), 0.42)
            .unwrap();

        let (loaded, meta) = CheckpointManager::load(&handle.path).unwrap();
        assert_eq!(loaded["weight"].shape, vec![2, 2]);
        assert_eq!(loaded["weight"].data, vec![1.5; 4]);
        assert_eq!(meta.state.epoch, 1);
        assert_eq!(meta.state.global_step, 10);
        assert!((meta.metric - 0.42).abs() < 1e-12);
    }

    #[test]
    fn retention_keeps_top_k_by_metric() {
        // save_top_k=2, metrics [0.5, 0.3, 0.4] (lower better)
        // => retained {0.3, 0.4}; 0.5 evicted.
        let dir = TempDir::new().unwrap();
        let mut manager =
            CheckpointManager::new(dir.path(), "test-run", 2, MetricMode::Min).unwrap();

        let first = manager
            .save(&tiny_state_dict(0.0), &training_state(0, 1), 0.5)
            .unwrap();
        manager
            .save(&tiny_state_dict(0.0), &training_state(0, 2), 0.3)
            .unwrap();
        manager
            .save(&tiny_state_dict(0.0), &training_state(0, 3), 0.4)
            .unwrap();

        let metrics: Vec<f64> = manager.retained().iter().map(|h| h.metric).collect();
        assert_eq!(metrics, vec![0.3, 0.4]);
        assert!(!first.path.exists());
        assert!((manager.best().unwrap().metric - 0.3).abs() < 1e-12);
    }

    #[test]
    fn retention_respects_max_mode() {
        let dir = TempDir::new().unwrap();
        let mut manager =
            CheckpointManager::new(dir.path(), "test-run", 2, MetricMode::Max).unwrap();

        for (step, metric) in [(1, 0.5), (2, 0.3), (3, 0.4)] {
            manager
                .save(&tiny_state_dict(0.0), &training_state(0, step), metric)
                .unwrap();
        }
        let metrics: Vec<f64> = manager.retained().iter().map(|h| h.metric).collect();
        assert_eq!(metrics, vec![0.5, 0.4]);
    }

    #[test]
    fn scan_rebuilds_retained_set_across_restarts() {
        let dir = TempDir::new().unwrap();
        {
            let mut manager =
                CheckpointManager::new(dir.path(), "test-run", 3, MetricMode::Min).unwrap();
            manager
                .save(&tiny_state_dict(0.0), &training_state(0, 1), 0.9)
                .unwrap();
            manager
                .save(&tiny_state_dict(0.0), &training_state(0, 2), 0.2)
                .unwrap();
        }
        let manager = CheckpointManager::new(dir.path(), "test-run", 3, MetricMode::Min).unwrap();
        assert_eq!(manager.retained().len(), 2);
        assert!((manager.best().unwrap().metric - 0.2).abs() < 1e-12);
    }

    #[test]
    fn resolve_substitutes_run_id() {
        let dir = TempDir::new().unwrap();
        let mut manager =
            CheckpointManager::new(dir.path(), "run-7", 1, MetricMode::Min).unwrap();
        let handle = manager
            .save(&tiny_state_dict(0.0), &training_state(2, 5), 0.1)
            .unwrap();

        let template = format!("{}/{}/epoch2-step5", dir.path().display(), "{run_id}");
        let resolved = CheckpointManager::resolve(&template, "run-7").unwrap();
        assert_eq!(resolved, handle.path);
    }

    #[test]
    fn resolve_missing_is_not_found() {
        let err = CheckpointManager::resolve("/no/such/snapshot", "run").unwrap_err();
        assert!(matches!(err, FlintError::CheckpointNotFound(_)));
    }

    #[test]
    fn corrupt_weights_are_fatal() {
        let dir = TempDir::new().unwrap();
        let mut manager =
            CheckpointManager::new(dir.path(), "test-run", 1, MetricMode::Min).unwrap();
        let handle = manager
            .save(&tiny_state_dict(0.0), &training_state(0, 1), 0.5)
            .unwrap();

        fs::write(handle.path.join(WEIGHTS_FILE), b"not safetensors").unwrap();
        let err = CheckpointManager::load(&handle.path).unwrap_err();
        assert!(matches!(err, FlintError::CheckpointCorrupt { .. }));
    }
}
