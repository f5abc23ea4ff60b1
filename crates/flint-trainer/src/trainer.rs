//! Distributed training coordinator.
//!
//! Owns the train/eval loop: `Init → Resuming? → TrainEpoch ⇄ Validate →
//! Finished`. Each process handles one rank; loader workers shard the
//! corpus underneath it, gradients are averaged across ranks after each
//! accumulated micro-batch group, and checkpoints are written by rank 0
//! between barriers.

use crate::checkpoint::CheckpointManager;
use crate::model::{clip_gradients, gradients_finite, scale_gradients, CausalLm};
use crate::scaler::GradScaler;
use flint_core::{
    EvalMetrics, ExperimentConfig, FlintError, LrSchedule, Result, Split, TrainingCallback,
    TrainingState,
};
use flint_data::{
    count_records, BatchAssembler, LoaderOptions, OverlapSlicer, TokenizerAdapter, TrainingBatch,
    WindowLoader,
};
use flint_distributed::DistributedContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Statistics for one completed optimizer step.
#[derive(Debug, Clone)]
pub struct StepStats {
    /// Optimizer step number.
    pub step: usize,
    /// Mean loss across the accumulated micro-batches.
    pub loss: f64,
    /// Learning rate applied.
    pub lr: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    /// Tokens processed by this step on this rank.
    pub tokens: u64,
    /// Wall time of the step, including overflow retries.
    pub step_time_ms: u64,
}

/// The training coordinator.
pub struct Trainer<M: CausalLm> {
    config: ExperimentConfig,
    model: M,
    tokenizer: Arc<TokenizerAdapter>,
    slicer: OverlapSlicer,
    ctx: DistributedContext,
    runtime: tokio::runtime::Handle,
    scaler: GradScaler,
    schedule: LrSchedule,
    state: TrainingState,
    checkpoints: CheckpointManager,
    callbacks: Vec<Box<dyn TrainingCallback>>,
    stop: Arc<AtomicBool>,
    run_id: String,
    collective_timeout: Duration,
    val_every_micro: usize,
    planned_steps: usize,
    running_loss: f64,
    resumed: bool,
}

impl<M: CausalLm> Trainer<M> {
    /// Build a coordinator from a validated configuration.
    pub fn new(
        config: ExperimentConfig,
        model: M,
        tokenizer: Arc<TokenizerAdapter>,
        ctx: DistributedContext,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self> {
        config.validate()?;
        if ctx.world_size() != config.distributed.world_size {
            return Err(FlintError::ConfigValidation(format!(
                "backend reports world_size {} but the config says {}",
                ctx.world_size(),
                config.distributed.world_size
            )));
        }
        if tokenizer.vocab_size() != config.tokenizer.vocab_size {
            tracing::warn!(
                actual = tokenizer.vocab_size(),
                configured = config.tokenizer.vocab_size,
                "tokenizer vocabulary size differs from the configured value"
            );
        }

        let run_id = config
            .training
            .run_id
            .clone()
            .unwrap_or_else(default_run_id);

        let records_total = count_records(&config.dataset.train_path)?;
        let records_per_rank = records_total
            .div_ceil(config.distributed.world_size)
            .max(1);
        // Every record yields at least one window; this floor is the
        // planning estimate for the decay horizon and validation cadence.
        let micro_per_epoch = records_per_rank.div_ceil(config.training.batch_size).max(1);
        let total_steps = (micro_per_epoch * config.training.epochs)
            .div_ceil(config.training.grad_accumulation_steps)
            .max(1);
        let val_every_micro = ((records_per_rank as f64 * config.training.val_check_interval)
            / config.training.batch_size as f64)
            .round()
            .max(1.0) as usize;

        let schedule = LrSchedule::new(
            config.scaled_lr(),
            config.training.warmup_tokens,
            total_steps,
            config.training.lr_decay,
        );
        let scaler = GradScaler::new(config.training.precision);
        let checkpoints = CheckpointManager::new(
            &config.training.checkpoint_dir,
            run_id.clone(),
            config.training.save_top_k,
            config.training.metric_mode,
        )?;
        let slicer = OverlapSlicer::new(
            config.model.context_length,
            config.stride(),
            config.dataset.pad_overlapped,
            tokenizer.pad_id(),
            tokenizer.ignore_label(),
        );
        let state = TrainingState::new(
            run_id.clone(),
            config.training.seed,
            config.dataset.num_dataset_workers,
        );
        let collective_timeout = Duration::from_millis(config.distributed.collective_timeout_ms);

        tracing::info!(
            run_id = %run_id,
            rank = ctx.rank(),
            world_size = ctx.world_size(),
            records_per_rank,
            planned_steps = total_steps,
            effective_batch = config.effective_batch_size(),
            "trainer initialized"
        );

        Ok(Self {
            config,
            model,
            tokenizer,
            slicer,
            ctx,
            runtime,
            scaler,
            schedule,
            state,
            checkpoints,
            callbacks: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            run_id,
            collective_timeout,
            val_every_micro,
            planned_steps: total_steps,
            running_loss: 0.0,
            resumed: false,
        })
    }

    /// Register a training callback.
    pub fn add_callback(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.push(callback);
    }

    /// Flag that stops training at the next batch boundary; the in-flight
    /// batch completes first.
    #[must_use]
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Current training state.
    #[must_use]
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// The model being trained.
    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Checkpoints retained so far.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Optimizer steps planned for the whole run (an estimate derived from
    /// the corpus size; drives the decay horizon and progress reporting).
    #[must_use]
    pub fn planned_steps(&self) -> usize {
        self.planned_steps
    }

    /// Restore from a checkpoint (when given) and evaluate one held-out
    /// split without training.
    pub fn evaluate_only(&mut self, checkpoint: Option<&str>, split: Split) -> Result<EvalMetrics> {
        if let Some(spec) = checkpoint {
            self.resume(spec)?;
        }
        self.evaluate_split(split)
    }

    /// Drive the run to completion (or until stopped).
    pub fn run(&mut self) -> Result<()> {
        for cb in &mut self.callbacks {
            cb.on_train_start();
        }

        if let Some(spec) = self.config.training.resume_from_checkpoint.clone() {
            self.resume(&spec)?;
        }

        let epochs = self.config.training.epochs;
        let start_epoch = self.state.epoch;
        let mut resumed_mid_epoch =
            self.resumed && self.state.worker_windows.iter().any(|&n| n > 0);

        for epoch in start_epoch..epochs {
            if resumed_mid_epoch {
                resumed_mid_epoch = false;
            } else {
                self.state.start_epoch(epoch);
            }
            for cb in &mut self.callbacks {
                cb.on_epoch_start(epoch);
            }

            let completed = self.train_epoch(epoch)?;
            let metrics = self.validate()?;
            self.save_checkpoint(metrics.loss)?;
            for cb in &mut self.callbacks {
                cb.on_epoch_end(epoch);
            }

            if !completed {
                tracing::info!(epoch, "stop requested; run ends after this checkpoint");
                break;
            }
        }

        for cb in &mut self.callbacks {
            cb.on_train_end();
        }
        self.block_barrier("final")?;
        tracing::info!(
            steps = self.state.global_step,
            tokens = self.state.tokens_seen,
            loss = self.running_loss,
            "training finished"
        );
        Ok(())
    }

    /// One pass over this rank's shard of the train split. Returns `false`
    /// when the stop flag interrupted the epoch.
    fn train_epoch(&mut self, epoch: usize) -> Result<bool> {
        let mut loader = WindowLoader::spawn(
            LoaderOptions {
                path: self.config.dataset.train_path.clone(),
                split: Split::Train,
                rank: self.ctx.rank(),
                world_size: self.ctx.world_size(),
                num_workers: self.config.dataset.num_dataset_workers,
                shuffle_bucket: self.config.dataset.shuffle_bucket,
                seed: self.state.seed,
                epoch: epoch as u64,
                max_record_nodes: self.config.dataset.max_record_nodes,
                queue_depth: self.config.training.batch_size * 4,
                skip_windows: self.state.worker_windows.clone(),
            },
            Arc::clone(&self.tokenizer),
            self.slicer.clone(),
        )?;
        let mut assembler = BatchAssembler::new(
            self.config.training.batch_size,
            self.config.model.context_length,
            self.config.dataset.drop_last_train,
            self.config.dataset.num_dataset_workers,
        );

        let accumulation = self.config.training.grad_accumulation_steps;
        let mut group: Vec<TrainingBatch> = Vec::with_capacity(accumulation);
        let mut micros_since_val = 0usize;
        let mut stopped = false;

        while let Some(window) = loader.next_window() {
            if self.stop.load(Ordering::Relaxed) {
                stopped = true;
                break;
            }
            if let Some(batch) = assembler.push(window) {
                self.consume_micro_batch(batch, &mut group, &mut micros_since_val)?;
            }
        }

        if stopped {
            if !group.is_empty() {
                tracing::debug!(
                    micro_batches = group.len(),
                    "discarding partial accumulation group on stop"
                );
                group.clear();
                self.model.zero_gradients();
            }
        } else {
            if let Some(batch) = assembler.finish() {
                self.consume_micro_batch(batch, &mut group, &mut micros_since_val)?;
            }
            if !group.is_empty() {
                let stats = self.optimizer_step(&group)?;
                group.clear();
                self.after_step(&stats);
            }
        }

        let corrupt = loader.finish()?;
        self.state.corrupt_records = corrupt;
        if corrupt > 0 {
            tracing::warn!(epoch, corrupt_records = corrupt, "epoch skipped corrupt records");
        }
        tracing::info!(
            epoch,
            steps = self.state.global_step,
            tokens_seen = self.state.tokens_seen,
            overflow_skips = self.state.overflow_skips,
            "epoch finished"
        );
        Ok(!stopped)
    }

    fn consume_micro_batch(
        &mut self,
        batch: TrainingBatch,
        group: &mut Vec<TrainingBatch>,
        micros_since_val: &mut usize,
    ) -> Result<()> {
        self.state
            .record_micro_batch(batch.num_tokens(), &batch.worker_windows);
        *micros_since_val += 1;
        group.push(batch);

        if group.len() == self.config.training.grad_accumulation_steps {
            let stats = self.optimizer_step(group)?;
            group.clear();
            self.after_step(&stats);

            // Fractional in-epoch validation; a full-epoch interval is
            // covered by the end-of-epoch pass instead.
            if self.config.training.val_check_interval < 1.0
                && *micros_since_val >= self.val_every_micro
            {
                *micros_since_val = 0;
                let metrics = self.validate()?;
                self.save_checkpoint(metrics.loss)?;
            }
        }
        Ok(())
    }

    /// Run one optimizer step over an accumulated micro-batch group,
    /// retrying with a smaller loss scale on gradient overflow. The same
    /// group is re-attempted so no data is lost to a skipped step.
    fn optimizer_step(&mut self, group: &[TrainingBatch]) -> Result<StepStats> {
        let start = Instant::now();
        let tokens: u64 = group.iter().map(TrainingBatch::num_tokens).sum();

        loop {
            let scale = self.scaler.loss_scale();
            let mut loss_sum = 0.0;
            for batch in group {
                loss_sum += self.model.forward_backward(batch, scale)?;
            }
            let loss = loss_sum / group.len() as f64;

            self.all_reduce_gradients()?;

            // One pass folds together gradient averaging over ranks and
            // micro-batches and the loss-scale unscaling.
            let normalizer = 1.0
                / (f64::from(scale) * group.len() as f64 * self.ctx.world_size() as f64);
            let grads = self.model.gradients_mut();
            scale_gradients(grads, normalizer as f32);

            if !gradients_finite(grads) {
                self.state.overflow_skips += 1;
                self.model.zero_gradients();
                if !self.scaler.is_enabled() {
                    return Err(FlintError::Training(format!(
                        "non-finite gradients at step {} with loss scaling disabled",
                        self.state.global_step
                    )));
                }
                if self.scaler.at_floor() {
                    return Err(FlintError::Training(format!(
                        "loss scale exhausted recovering from overflow at step {}",
                        self.state.global_step
                    )));
                }
                self.scaler.update(true);
                tracing::warn!(
                    step = self.state.global_step,
                    scale = self.scaler.loss_scale(),
                    "gradient overflow; step skipped, scale halved, batch re-attempted"
                );
                continue;
            }

            let grad_norm = clip_gradients(
                self.model.gradients_mut(),
                self.config.training.max_grad_norm,
            );
            let lr = self
                .schedule
                .lr(self.state.tokens_seen, self.state.global_step);
            self.model.apply_gradients(lr)?;
            self.scaler.update(false);
            self.state.record_optimizer_step();

            return Ok(StepStats {
                step: self.state.global_step,
                loss,
                lr,
                grad_norm,
                tokens,
                step_time_ms: start.elapsed().as_millis() as u64,
            });
        }
    }

    fn after_step(&mut self, stats: &StepStats) {
        self.running_loss = if stats.step == 1 {
            stats.loss
        } else {
            0.99 * self.running_loss + 0.01 * stats.loss
        };
        for cb in &mut self.callbacks {
            cb.on_step_end(stats.step, stats.loss, stats.lr);
        }
    }

    /// Evaluate this rank's shard of the validation split and reduce the
    /// metric across ranks.
    fn validate(&mut self) -> Result<EvalMetrics> {
        self.evaluate_split(Split::Val)
    }

    fn eval_path(&self, split: Split) -> Result<std::path::PathBuf> {
        match split {
            Split::Val => Ok(self.config.dataset.val_path.clone()),
            Split::Test => self
                .config
                .dataset
                .test_path
                .clone()
                .ok_or_else(|| {
                    FlintError::ConfigValidation("dataset.test_path is not configured".into())
                }),
            Split::Train => Err(FlintError::ConfigValidation(
                "evaluation runs on held-out splits only".into(),
            )),
        }
    }

    fn evaluate_split(&mut self, split: Split) -> Result<EvalMetrics> {
        let path = self.eval_path(split)?;
        let mut loader = WindowLoader::spawn(
            LoaderOptions {
                path,
                split,
                rank: self.ctx.rank(),
                world_size: self.ctx.world_size(),
                num_workers: self.config.dataset.num_dataset_workers,
                shuffle_bucket: self.config.dataset.shuffle_bucket,
                seed: self.state.seed,
                epoch: 0,
                max_record_nodes: self.config.dataset.max_record_nodes,
                queue_depth: self.config.training.batch_size * 4,
                skip_windows: Vec::new(),
            },
            Arc::clone(&self.tokenizer),
            self.slicer.clone(),
        )?;
        let mut assembler = BatchAssembler::new(
            self.config.training.batch_size,
            self.config.model.context_length,
            self.config.dataset.drop_last_eval,
            self.config.dataset.num_dataset_workers,
        );

        let mut loss_sum = 0.0f64;
        let mut count = 0u64;
        while let Some(window) = loader.next_window() {
            if let Some(batch) = assembler.push(window) {
                let (l, c) = self.model.eval_loss(&batch)?;
                loss_sum += l;
                count += c;
            }
        }
        if let Some(batch) = assembler.finish() {
            let (l, c) = self.model.eval_loss(&batch)?;
            loss_sum += l;
            count += c;
        }
        loader.finish()?;

        if self.ctx.world_size() > 1 {
            let mut buf = [loss_sum as f32, count as f32];
            self.runtime
                .block_on(self.ctx.all_reduce_f32(&mut buf, self.collective_timeout))
                .map_err(|e| FlintError::Distributed(format!("validation reduce: {e}")))?;
            loss_sum = f64::from(buf[0]);
            count = buf[1] as u64;
        }

        let metrics = EvalMetrics::from_sum(loss_sum, count);
        for cb in &mut self.callbacks {
            cb.on_validation(self.state.global_step, &metrics);
        }
        Ok(metrics)
    }

    /// Rank 0 writes the snapshot; all ranks synchronize around it so no
    /// rank races ahead with un-flushed state.
    fn save_checkpoint(&mut self, metric: f64) -> Result<()> {
        self.block_barrier("pre-checkpoint")?;
        if self.ctx.is_master() {
            let handle = self
                .checkpoints
                .save(&self.model.state_dict(), &self.state, metric)?;
            for cb in &mut self.callbacks {
                cb.on_save(&handle.path);
            }
        }
        self.block_barrier("post-checkpoint")
    }

    /// Restore model and training state, then let the loaders re-derive
    /// the sampler position from the per-worker window counts.
    fn resume(&mut self, spec: &str) -> Result<()> {
        let path = CheckpointManager::resolve(spec, &self.run_id)?;
        tracing::info!(path = %path.display(), "resuming from checkpoint");
        let (state_dict, meta) = CheckpointManager::load(&path)?;
        self.model.load_state_dict(state_dict).map_err(|e| {
            FlintError::CheckpointCorrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        if meta.state.worker_windows.len() != self.config.dataset.num_dataset_workers {
            return Err(FlintError::ConfigValidation(format!(
                "checkpoint tracks {} loader workers but num_dataset_workers is {}",
                meta.state.worker_windows.len(),
                self.config.dataset.num_dataset_workers
            )));
        }
        let mut state = meta.state;
        state.run_id = self.run_id.clone();
        self.state = state;
        self.resumed = true;
        tracing::info!(
            epoch = self.state.epoch,
            step = self.state.global_step,
            tokens_seen = self.state.tokens_seen,
            "restored training state"
        );
        Ok(())
    }

    fn all_reduce_gradients(&mut self) -> Result<()> {
        if self.ctx.world_size() == 1 {
            return Ok(());
        }
        let rank = self.ctx.rank();
        let step = self.state.global_step;
        let deadline = self.collective_timeout;
        let Self {
            model,
            ctx,
            runtime,
            ..
        } = self;
        runtime
            .block_on(ctx.all_reduce_f32(model.gradients_mut(), deadline))
            .map_err(|e| {
                FlintError::Distributed(format!("rank {rank} gradient reduce at step {step}: {e}"))
            })
    }

    fn block_barrier(&mut self, what: &str) -> Result<()> {
        self.runtime
            .block_on(self.ctx.barrier(self.collective_timeout))
            .map_err(|e| FlintError::Distributed(format!("{what} barrier: {e}")))
    }
}

fn default_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("run-{secs}")
}
