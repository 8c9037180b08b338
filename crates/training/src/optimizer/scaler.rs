//! Dynamic loss scaling for reduced-precision runs.
//!
//! The loss is multiplied by the current scale before backward and the
//! gradients are divided by it afterwards. A step whose gradients overflow
//! halves the scale; a run of clean steps doubles it again.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::{config::Precision, error::to_runtime_error, TrainingError};

/// Bounds and schedule of the dynamic loss scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossScalePolicy {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    /// Clean steps required before the scale grows.
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScalePolicy {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

impl LossScalePolicy {
    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut problems = Vec::new();
        if !(self.min_scale.is_finite() && self.min_scale > 0.0) {
            problems.push(format!("min_scale must be positive, got {}", self.min_scale));
        }
        if !(self.max_scale.is_finite() && self.max_scale >= self.min_scale) {
            problems.push(format!(
                "max_scale {} must be finite and at least min_scale {}",
                self.max_scale, self.min_scale
            ));
        }
        if !(self.min_scale..=self.max_scale).contains(&self.initial_scale) {
            problems.push(format!(
                "initial_scale {} lies outside [{}, {}]",
                self.initial_scale, self.min_scale, self.max_scale
            ));
        }
        if !(self.growth_factor >= 1.0) {
            problems.push(format!("growth_factor {} is below 1", self.growth_factor));
        }
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            problems.push(format!("backoff_factor {} is outside (0, 1)", self.backoff_factor));
        }
        if self.growth_interval == 0 {
            problems.push("growth_interval must be positive".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::configuration(format!(
                "invalid loss scale policy: {}",
                problems.join("; ")
            )))
        }
    }
}

/// What [`GradientScaler::update`] did with one step's overflow status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleAdjustment {
    /// Scaling disabled, or a clean step inside the growth interval.
    Unchanged,
    Grown(f32),
    BackedOff(f32),
    /// Overflow with the scale already at its floor; backing off cannot help.
    Saturated,
}

#[derive(Debug, Clone)]
pub struct GradientScaler {
    /// `None` disables scaling entirely.
    policy: Option<LossScalePolicy>,
    scale: f32,
    clean_steps: usize,
}

impl GradientScaler {
    /// Default policy for reduced precision, pass-through for fp32.
    pub fn new(precision: Precision) -> Self {
        let policy = LossScalePolicy::default();
        Self {
            scale: if Self::wants_scaling(precision) {
                policy.initial_scale
            } else {
                1.0
            },
            policy: Self::wants_scaling(precision).then_some(policy),
            clean_steps: 0,
        }
    }

    pub fn with_policy(policy: LossScalePolicy, precision: Precision) -> Result<Self, TrainingError> {
        policy.validate()?;
        if !Self::wants_scaling(precision) {
            return Ok(Self::new(precision));
        }
        Ok(Self {
            policy: Some(policy),
            scale: policy.initial_scale,
            clean_steps: 0,
        })
    }

    fn wants_scaling(precision: Precision) -> bool {
        !matches!(precision, Precision::Fp32)
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.is_some()
    }

    pub fn loss_scale(&self) -> f32 {
        self.scale
    }

    pub fn policy(&self) -> Option<&LossScalePolicy> {
        self.policy.as_ref()
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor, TrainingError> {
        self.multiply(loss, self.scale as f64)
    }

    pub fn unscale(&self, grad: &Tensor) -> Result<Tensor, TrainingError> {
        self.multiply(grad, 1.0 / self.scale as f64)
    }

    fn multiply(&self, tensor: &Tensor, factor: f64) -> Result<Tensor, TrainingError> {
        if self.policy.is_none() {
            return Ok(tensor.clone());
        }
        tensor.affine(factor, 0.0).map_err(to_runtime_error)
    }

    /// Feeds the cross-rank overflow decision of one step into the schedule.
    pub fn update(&mut self, overflow: bool) -> ScaleAdjustment {
        let Some(policy) = self.policy else {
            return ScaleAdjustment::Unchanged;
        };
        if overflow {
            self.clean_steps = 0;
            if self.scale <= policy.min_scale {
                return ScaleAdjustment::Saturated;
            }
            self.scale = (self.scale * policy.backoff_factor).max(policy.min_scale);
            return ScaleAdjustment::BackedOff(self.scale);
        }

        self.clean_steps += 1;
        if self.clean_steps < policy.growth_interval {
            return ScaleAdjustment::Unchanged;
        }
        self.clean_steps = 0;
        let grown = (self.scale * policy.growth_factor).min(policy.max_scale);
        if grown == self.scale {
            return ScaleAdjustment::Unchanged;
        }
        self.scale = grown;
        ScaleAdjustment::Grown(grown)
    }

    /// Current scale and growth counter; `None` when scaling is disabled.
    pub fn state(&self) -> Option<GradientScalerState> {
        self.policy.map(|_| GradientScalerState {
            loss_scale: self.scale,
            stable_steps: self.clean_steps,
        })
    }

    pub fn load_state(&mut self, saved: &GradientScalerState) -> Result<(), TrainingError> {
        let Some(policy) = self.policy else {
            return Err(TrainingError::runtime(
                "cannot restore loss scale into a disabled gradient scaler",
            ));
        };
        if !(saved.loss_scale.is_finite() && saved.loss_scale > 0.0) {
            return Err(TrainingError::runtime(format!(
                "saved loss scale {} is invalid",
                saved.loss_scale
            )));
        }
        self.scale = saved.loss_scale.clamp(policy.min_scale, policy.max_scale);
        self.clean_steps = saved.stable_steps.min(policy.growth_interval.saturating_sub(1));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub loss_scale: f32,
    pub stable_steps: usize,
}
