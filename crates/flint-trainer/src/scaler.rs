//! Dynamic loss scaling for mixed-precision training.
//!
//! Losses are multiplied by a scale factor before the backward pass so
//! small gradients survive fp16. On a non-finite gradient the optimizer
//! step is skipped and the scale backs off; after a run of clean steps it
//! grows again.

use flint_core::Precision;

/// Loss-scale growth/backoff policy.
#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    /// Starting scale.
    pub initial_scale: f32,
    /// Multiplier applied after `growth_interval` clean steps.
    pub growth_factor: f32,
    /// Multiplier applied on overflow.
    pub backoff_factor: f32,
    /// Clean steps between growths.
    pub growth_interval: usize,
    /// Floor; reaching it means training cannot make progress.
    pub min_scale: f32,
    /// Ceiling.
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// Dynamic loss scaler. Disabled (scale fixed at 1.0) outside fp16.
#[derive(Debug, Clone)]
pub struct GradScaler {
    enabled: bool,
    scale: f32,
    stable_steps: usize,
    config: LossScaleConfig,
}

impl GradScaler {
    /// Scaler for the given precision with default policy.
    #[must_use]
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    /// Scaler with an explicit policy.
    #[must_use]
    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        let config = sanitize(config);
        Self {
            enabled: matches!(precision, Precision::Fp16),
            scale: config.initial_scale,
            stable_steps: 0,
            config,
        }
    }

    /// Whether scaling is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current loss scale; 1.0 when disabled.
    #[must_use]
    pub fn loss_scale(&self) -> f32 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    /// True once backoff has bottomed out; a further overflow is fatal.
    #[must_use]
    pub fn at_floor(&self) -> bool {
        self.enabled && self.scale <= self.config.min_scale
    }

    /// Advance the policy after a step attempt.
    pub fn update(&mut self, found_overflow: bool) {
        if !self.enabled {
            return;
        }
        if found_overflow {
            self.scale = (self.scale * self.config.backoff_factor).max(self.config.min_scale);
            self.stable_steps = 0;
        } else {
            self.stable_steps += 1;
            if self.stable_steps >= self.config.growth_interval {
                self.scale = (self.scale * self.config.growth_factor).min(self.config.max_scale);
                self.stable_steps = 0;
            }
        }
    }
}

fn sanitize(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_after_interval() {
        let mut scaler = GradScaler::with_config(
            LossScaleConfig {
                initial_scale: 512.0,
                growth_interval: 2,
                ..LossScaleConfig::default()
            },
            Precision::Fp16,
        );

        assert!(scaler.is_enabled());
        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 1024.0);
    }

    #[test]
    fn backs_off_on_overflow() {
        let mut scaler = GradScaler::with_config(
            LossScaleConfig {
                initial_scale: 1024.0,
                backoff_factor: 0.25,
                ..LossScaleConfig::default()
            },
            Precision::Fp16,
        );

        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 256.0);
    }

    #[test]
    fn backoff_stops_at_floor() {
        let mut scaler = GradScaler::with_config(
            LossScaleConfig {
                initial_scale: 2.0,
                min_scale: 1.0,
                ..LossScaleConfig::default()
            },
            Precision::Fp16,
        );
        scaler.update(true);
        assert!(scaler.at_floor());
        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 1.0);
    }

    #[test]
    fn no_op_for_fp32() {
        let mut scaler = GradScaler::new(Precision::Fp32);
        assert!(!scaler.is_enabled());
        assert_eq!(scaler.loss_scale(), 1.0);
        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 1.0);
        assert!(!scaler.at_floor());
    }
}
