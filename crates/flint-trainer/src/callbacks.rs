//! Training callbacks for monitoring and logging.

use flint_core::{EvalMetrics, TrainingCallback};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Logs step and validation metrics through `tracing`.
pub struct LoggingCallback {
    log_every: usize,
}

impl LoggingCallback {
    /// Log every `log_every` optimizer steps.
    #[must_use]
    pub fn new(log_every: usize) -> Self {
        Self {
            log_every: log_every.max(1),
        }
    }
}

impl TrainingCallback for LoggingCallback {
    fn on_step_end(&mut self, step: usize, loss: f64, lr: f64) {
        if step % self.log_every == 0 {
            tracing::info!(step, loss, lr, "training step");
        }
    }

    fn on_epoch_end(&mut self, epoch: usize) {
        tracing::info!(epoch, "epoch complete");
    }

    fn on_validation(&mut self, step: usize, metrics: &EvalMetrics) {
        tracing::info!(
            step,
            loss = metrics.loss,
            perplexity = metrics.perplexity,
            "validation"
        );
    }

    fn on_save(&mut self, path: &Path) {
        tracing::info!(path = %path.display(), "checkpoint saved");
    }
}

/// Progress bar over the planned optimizer steps.
pub struct ProgressCallback {
    progress: indicatif::ProgressBar,
}

impl ProgressCallback {
    /// Create a progress bar for `total_steps` optimizer steps.
    #[must_use]
    pub fn new(total_steps: usize) -> Self {
        let progress = indicatif::ProgressBar::new(total_steps as u64);
        progress.set_style(
            indicatif::ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                )
                .expect("static template is valid")
                .progress_chars("#>-"),
        );
        Self { progress }
    }
}

impl TrainingCallback for ProgressCallback {
    fn on_train_end(&mut self) {
        self.progress.finish_with_message("training complete");
    }

    fn on_step_end(&mut self, step: usize, loss: f64, _lr: f64) {
        self.progress.set_position(step as u64);
        self.progress.set_message(format!("loss: {loss:.4}"));
    }
}

/// Appends one JSON object per event to a metrics file.
pub struct MetricsJsonCallback {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl MetricsJsonCallback {
    /// Create a JSONL metrics writer at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    fn write_line(&mut self, line: String) {
        if self.writer.is_none() {
            match File::create(&self.path) {
                Ok(file) => self.writer = Some(BufWriter::new(file)),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), "cannot write metrics: {e}");
                    return;
                }
            }
        }
        if let Some(writer) = &mut self.writer {
            let _ = writeln!(writer, "{line}");
        }
    }
}

impl TrainingCallback for MetricsJsonCallback {
    fn on_step_end(&mut self, step: usize, loss: f64, lr: f64) {
        self.write_line(format!(
            r#"{{"event":"step","step":{step},"loss":{loss},"lr":{lr}}}"#
        ));
    }

    fn on_validation(&mut self, step: usize, metrics: &EvalMetrics) {
        self.write_line(format!(
            r#"{{"event":"validation","step":{step},"loss":{},"perplexity":{}}}"#,
            metrics.loss, metrics.perplexity
        ));
    }

    fn on_train_end(&mut self) {
        if let Some(writer) = &mut self.writer {
            let _ = writer.flush();
        }
    }
}
