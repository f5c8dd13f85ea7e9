//! Attack configuration.

use crate::adam::AdamParams;
use crate::loss::AttackMode;
use delta_core::{DataSpec, DeltaError, Result};
use delta_data::TargetMap;
use ndarray::Array4;
use serde::{Deserialize, Serialize};

/// Learning rate on the 8-bit pixel scale used by the reference runs.
///
/// Only equal to a model-range step for models whose input spans 0..255;
/// convert it with [`AttackConfig::learning_rate_from_pixels`] otherwise.
pub const DEFAULT_PIXEL_LEARNING_RATE: f32 = 0.001 * 255.0;

/// Source of the perturbation gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GradientMethod {
    /// Analytic when the classifier exposes a backward pass, SPSA otherwise.
    #[default]
    Auto,
    /// Exact gradient through [`delta_core::Classifier::backward`].
    Analytic,
    /// Simultaneous Perturbation Stochastic Approximation: two scoring passes
    /// per step with a random ±1 direction. Works with any classifier.
    Spsa,
}

/// Configuration for one attack run.
#[derive(Debug, Clone)]
pub struct AttackConfig {
    /// Gradient steps per batch.
    pub max_iter: usize,
    /// Checkpoint cadence; must divide `max_iter`.
    pub save_freq: usize,
    /// Step size in the model's input range (see [`Self::learning_rate_from_pixels`]).
    ///
    /// The [`Default`] value is [`DEFAULT_PIXEL_LEARNING_RATE`] unconverted,
    /// which assumes a 0..255 model. [`AttackConfig::for_spec`] converts it.
    pub learning_rate: f32,
    /// Image name → target label. `Some` switches to a targeted attack.
    pub targets: Option<TargetMap>,
    pub weight_loss2: f32,
    /// Add `weight_loss2 * loss2` to the minimized objective. When off the
    /// distance term is only computed and logged.
    pub penalize_distance: bool,
    /// `[N, crop, crop, channels]` offsets added to image `index` before the
    /// first scoring pass, already in the model's range.
    pub initial_noise: Option<Array4<f32>>,
    pub adam: AdamParams,
    pub gradient: GradientMethod,
    /// Perturbation size for SPSA estimation.
    pub spsa_delta: f32,
    /// Seed for SPSA directions.
    pub seed: u64,
    /// Stop a batch after this many consecutive iterations without improvement.
    pub patience: Option<usize>,
    /// A loss counts as an improvement when below `improvement_ratio * min_loss`.
    pub improvement_ratio: f32,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            save_freq: 10,
            learning_rate: DEFAULT_PIXEL_LEARNING_RATE,
            targets: None,
            weight_loss2: 0.0,
            penalize_distance: false,
            initial_noise: None,
            adam: AdamParams::default(),
            gradient: GradientMethod::Auto,
            spsa_delta: 0.01,
            seed: 42,
            patience: None,
            improvement_ratio: 0.99,
        }
    }
}

impl AttackConfig {
    /// Short runs for smoke tests: 100 iterations with early stopping.
    pub fn quick() -> Self {
        Self {
            max_iter: 100,
            save_freq: 10,
            patience: Some(20),
            ..Self::default()
        }
    }

    /// The reference schedule: 1000 iterations, checkpoint every 10, no
    /// distance penalty, no early stop.
    pub fn reference() -> Self {
        Self::default()
    }

    /// Defaults with the learning rate expressed in `spec`'s input range.
    pub fn for_spec(spec: &DataSpec) -> Self {
        Self {
            learning_rate: Self::learning_rate_from_pixels(DEFAULT_PIXEL_LEARNING_RATE, spec),
            ..Self::default()
        }
    }

    /// Convert a learning rate on the 8-bit scale into `spec`'s input range.
    pub fn learning_rate_from_pixels(learning_rate: f32, spec: &DataSpec) -> f32 {
        spec.from_pixel_scale(learning_rate)
    }

    pub fn mode(&self) -> AttackMode {
        if self.targets.is_some() {
            AttackMode::Targeted
        } else {
            AttackMode::Untargeted
        }
    }

    /// Checkpoint slots per image.
    pub fn num_slots(&self) -> usize {
        self.max_iter / self.save_freq.max(1)
    }

    /// Reject configurations before any optimization work happens.
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(DeltaError::Configuration(
                "max_iter must be positive".to_string(),
            ));
        }
        if self.save_freq == 0 {
            return Err(DeltaError::Configuration(
                "save_freq must be positive".to_string(),
            ));
        }
        if self.max_iter % self.save_freq != 0 {
            return Err(DeltaError::Configuration(format!(
                "max_iter ({}) must be a multiple of save_freq ({})",
                self.max_iter, self.save_freq
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(DeltaError::Configuration(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        if !(self.weight_loss2.is_finite() && self.weight_loss2 >= 0.0) {
            return Err(DeltaError::Configuration(format!(
                "weight_loss2 must be non-negative and finite, got {}",
                self.weight_loss2
            )));
        }
        if !(self.spsa_delta.is_finite() && self.spsa_delta > 0.0) {
            return Err(DeltaError::Configuration(format!(
                "spsa_delta must be positive and finite, got {}",
                self.spsa_delta
            )));
        }
        if !(self.improvement_ratio > 0.0 && self.improvement_ratio <= 1.0) {
            return Err(DeltaError::Configuration(format!(
                "improvement_ratio must be in (0, 1], got {}",
                self.improvement_ratio
            )));
        }
        if self.patience == Some(0) {
            return Err(DeltaError::Configuration(
                "patience must be at least 1".to_string(),
            ));
        }
        let AdamParams {
            beta1,
            beta2,
            epsilon,
        } = self.adam;
        let unit = 0.0..1.0;
        if !unit.contains(&beta1) || !unit.contains(&beta2) || !(epsilon > 0.0) {
            return Err(DeltaError::Configuration(format!(
                "invalid Adam hyperparameters: beta1={beta1}, beta2={beta2}, epsilon={epsilon}"
            )));
        }
        Ok(())
    }
}
