//! Low-rank factored bigram language model.
//!
//! A deliberately small [`CausalLm`] used by the integration tests and the
//! CLI to exercise the full pipeline with real numbers. Next-token logits
//! come from a rank-`hidden_size` factorization of the bigram table:
//! `logits(prev) = E[prev] · U`. The production transformer plugs in
//! through the same trait.

use crate::model::{CausalLm, NamedTensor, StateDict};
use flint_core::{FlintError, Result};
use flint_data::TrainingBatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// AdamW hyperparameters.
#[derive(Debug, Clone)]
pub struct AdamOptions {
    /// Epsilon added to the denominator.
    pub eps: f64,
    /// Decoupled weight decay.
    pub weight_decay: f64,
    /// First-moment decay.
    pub beta1: f64,
    /// Second-moment decay.
    pub beta2: f64,
}

impl Default for AdamOptions {
    fn default() -> Self {
        Self {
            eps: 1e-8,
            weight_decay: 0.01,
            beta1: 0.9,
            beta2: 0.999,
        }
    }
}

/// Factored bigram model with an embedded AdamW optimizer.
pub struct BigramLm {
    vocab_size: usize,
    hidden_size: usize,
    ignore_label: i64,
    adam: AdamOptions,
    /// `[vocab * hidden]` embedding rows followed by `[hidden * vocab]`
    /// output rows, flat.
    params: Vec<f32>,
    grads: Vec<f32>,
    exp_avg: Vec<f32>,
    exp_avg_sq: Vec<f32>,
    adam_step: u64,
}

impl BigramLm {
    /// Create a model with small deterministic random init.
    #[must_use]
    pub fn new(
        vocab_size: usize,
        hidden_size: usize,
        ignore_label: i64,
        adam: AdamOptions,
        seed: u64,
    ) -> Self {
        let n = vocab_size * hidden_size * 2;
        let mut rng = StdRng::seed_from_u64(seed);
        let params = (0..n).map(|_| (rng.gen::<f32>() - 0.5) * 0.04).collect();
        Self {
            vocab_size,
            hidden_size,
            ignore_label,
            adam,
            params,
            grads: vec![0.0; n],
            exp_avg: vec![0.0; n],
            exp_avg_sq: vec![0.0; n],
            adam_step: 0,
        }
    }

    fn emb_len(&self) -> usize {
        self.vocab_size * self.hidden_size
    }

    /// Softmax over the logits of `prev`, written into `probs`.
    fn probs_for(&self, prev: usize, probs: &mut [f32]) {
        let d = self.hidden_size;
        let v = self.vocab_size;
        let h = &self.params[prev * d..(prev + 1) * d];
        let out = &self.params[self.emb_len()..];

        probs.fill(0.0);
        for (k, &hk) in h.iter().enumerate() {
            let row = &out[k * v..(k + 1) * v];
            for (p, &w) in probs.iter_mut().zip(row) {
                *p += hk * w;
            }
        }
        let max = probs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for p in probs.iter_mut() {
            *p = (*p - max).exp();
            sum += *p;
        }
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }

    /// Next-token positions: for position `i > 0`, the model conditioned on
    /// `inputs[i-1]` predicts `labels[i]`.
    fn targets<'a>(
        &self,
        batch: &'a TrainingBatch,
    ) -> impl Iterator<Item = (usize, usize)> + 'a {
        let ignore = self.ignore_label;
        let vocab = self.vocab_size;
        (0..batch.rows).flat_map(move |r| {
            let inputs = batch.input_row(r);
            let labels = batch.label_row(r);
            (1..batch.cols).filter_map(move |i| {
                let label = labels[i];
                if label == ignore {
                    return None;
                }
                let prev = inputs[i - 1] as usize;
                let label = label as usize;
                (prev < vocab && label < vocab).then_some((prev, label))
            })
        })
    }
}

impl CausalLm for BigramLm {
    fn num_parameters(&self) -> usize {
        self.params.len()
    }

    fn forward_backward(&mut self, batch: &TrainingBatch, loss_scale: f32) -> Result<f64> {
        let targets: Vec<(usize, usize)> = self.targets(batch).collect();
        if targets.is_empty() {
            return Ok(0.0);
        }
        let inv = loss_scale / targets.len() as f32;
        let d = self.hidden_size;
        let v = self.vocab_size;
        let emb_len = self.emb_len();

        let mut probs = vec![0.0f32; v];
        let mut loss_sum = 0.0f64;
        for (prev, label) in targets.iter().copied() {
            self.probs_for(prev, &mut probs);
            loss_sum -= f64::from(probs[label].max(f32::MIN_POSITIVE)).ln();

            // dlogits = probs - onehot(label)
            probs[label] -= 1.0;

            let h: Vec<f32> = self.params[prev * d..(prev + 1) * d].to_vec();
            let out = &self.params[emb_len..];
            let (grad_emb, grad_out) = self.grads.split_at_mut(emb_len);
            for k in 0..d {
                let out_row = &out[k * v..(k + 1) * v];
                let grad_row = &mut grad_out[k * v..(k + 1) * v];
                let hk = h[k];
                let mut dh = 0.0f32;
                for ((g, &dl), &w) in grad_row.iter_mut().zip(&probs).zip(out_row) {
                    *g += hk * dl * inv;
                    dh += w * dl;
                }
                grad_emb[prev * d + k] += dh * inv;
            }
        }
        Ok(loss_sum / targets.len() as f64)
    }

    fn eval_loss(&self, batch: &TrainingBatch) -> Result<(f64, u64)> {
        let mut probs = vec![0.0f32; self.vocab_size];
        let mut loss_sum = 0.0f64;
        let mut count = 0u64;
        for (prev, label) in self.targets(batch) {
            self.probs_for(prev, &mut probs);
            loss_sum -= f64::from(probs[label].max(f32::MIN_POSITIVE)).ln();
            count += 1;
        }
        Ok((loss_sum, count))
    }

    fn gradients_mut(&mut self) -> &mut [f32] {
        &mut self.grads
    }

    fn apply_gradients(&mut self, lr: f64) -> Result<()> {
        self.adam_step += 1;
        let b1 = self.adam.beta1;
        let b2 = self.adam.beta2;
        let bias1 = 1.0 - b1.powi(self.adam_step as i32);
        let bias2 = 1.0 - b2.powi(self.adam_step as i32);

        for i in 0..self.params.len() {
            let g = f64::from(self.grads[i]);
            let m = b1 * f64::from(self.exp_avg[i]) + (1.0 - b1) * g;
            let v = b2 * f64::from(self.exp_avg_sq[i]) + (1.0 - b2) * g * g;
            self.exp_avg[i] = m as f32;
            self.exp_avg_sq[i] = v as f32;

            let m_hat = m / bias1;
            let v_hat = v / bias2;
            let p = f64::from(self.params[i]);
            let update = m_hat / (v_hat.sqrt() + self.adam.eps) + self.adam.weight_decay * p;
            self.params[i] = (p - lr * update) as f32;
        }
        self.zero_gradients();
        Ok(())
    }

    fn zero_gradients(&mut self) {
        self.grads.fill(0.0);
    }

    fn state_dict(&self) -> StateDict {
        let emb_len = self.emb_len();
        let mut state = StateDict::new();
        state.insert(
            "embedding.weight".into(),
            NamedTensor {
                shape: vec![self.vocab_size, self.hidden_size],
                data: self.params[..emb_len].to_vec(),
            },
        );
        state.insert(
            "output.weight".into(),
            NamedTensor {
                shape: vec![self.hidden_size, self.vocab_size],
                data: self.params[emb_len..].to_vec(),
            },
        );
        state.insert(
            "optim.exp_avg".into(),
            NamedTensor::vector(self.exp_avg.clone()),
        );
        state.insert(
            "optim.exp_avg_sq".into(),
            NamedTensor::vector(self.exp_avg_sq.clone()),
        );
        state.insert(
            "optim.step".into(),
            NamedTensor::vector(vec![self.adam_step as f32]),
        );
        state
    }

    fn load_state_dict(&mut self, mut state: StateDict) -> Result<()> {
        let mut take = |name: &str, shape: &[usize]| -> Result<Vec<f32>> {
            let tensor = state
                .remove(name)
                .ok_or_else(|| FlintError::Serialization(format!("missing tensor {name}")))?;
            if tensor.shape != shape {
                return Err(FlintError::Serialization(format!(
                    "tensor {name} has shape {:?}, expected {:?}",
                    tensor.shape, shape
                )));
            }
            Ok(tensor.data)
        };

        let emb = take(
            "embedding.weight",
            &[self.vocab_size, self.hidden_size],
        )?;
        let out = take("output.weight", &[self.hidden_size, self.vocab_size])?;
        let exp_avg = take("optim.exp_avg", &[self.params.len()])?;
        let exp_avg_sq = take("optim.exp_avg_sq", &[self.params.len()])?;
        let step = take("optim.step", &[1])?;

        let emb_len = self.emb_len();
        self.params[..emb_len].copy_from_slice(&emb);
        self.params[emb_len..].copy_from_slice(&out);
        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        self.adam_step = step[0] as u64;
        self.zero_gradients();
        Ok(())
    }
}
