use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{error::to_runtime_error, TrainingError};

/// Maps `(logits, labels)` to a scalar loss.
pub trait LossFunction: Send + Sync {
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<LossOutput, TrainingError>;
}

/// Cross entropy loss with optional label smoothing.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    label_smoothing: f32,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f32) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::configuration(
                "label smoothing must be in [0, 1) for cross entropy",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    pub fn label_smoothing(&self) -> f32 {
        self.label_smoothing
    }
}

impl LossFunction for CrossEntropyLoss {
    /// `logits` is `(batch, classes)` and `labels` is `(batch,)`. The loss is
    /// averaged over rows and computed in F32 whatever the logits dtype.
    fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<LossOutput, TrainingError> {
        let (rows, classes) = logits.dims2().map_err(|_| {
            TrainingError::runtime(format!(
                "cross entropy expects (batch, classes) logits, got {:?}",
                logits.dims()
            ))
        })?;
        if rows == 0 || classes == 0 {
            return Err(TrainingError::runtime(
                "no rows available for loss computation",
            ));
        }
        if labels.dims() != [rows] {
            return Err(TrainingError::runtime(format!(
                "labels {:?} do not match {rows} logit rows",
                labels.dims()
            )));
        }

        let logits_f32 = logits.to_dtype(DType::F32).map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits_f32, D::Minus1).map_err(to_runtime_error)?;

        let targets = labels
            .to_device(logits.device())
            .map_err(to_runtime_error)?
            .to_dtype(DType::U32)
            .map_err(to_runtime_error)?;

        let nll = log_probs
            .gather(&targets.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?;

        let per_row = if self.label_smoothing > 0.0 {
            let smoothing = self.label_smoothing as f64;
            let uniform = log_probs
                .mean(1)
                .map_err(to_runtime_error)?
                .neg()
                .map_err(to_runtime_error)?;
            let smoothed = nll.affine(1.0 - smoothing, 0.0).map_err(to_runtime_error)?;
            let uniform_term = uniform.affine(smoothing, 0.0).map_err(to_runtime_error)?;
            (smoothed + uniform_term).map_err(to_runtime_error)?
        } else {
            nll
        };

        let loss = per_row.mean_all().map_err(to_runtime_error)?;
        let value = loss.to_vec0::<f32>().map_err(to_runtime_error)?;

        Ok(LossOutput {
            loss,
            value: value as f64,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar F32 tensor attached to the autograd graph.
    pub loss: Tensor,
    /// Host copy of `loss`.
    pub value: f64,
}

impl LossOutput {
    pub fn is_finite(&self) -> bool {
        self.value.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits() -> Tensor {
        Tensor::from_slice(&[2.0f32, 0.5, -1.0, 0.0, 1.0, 3.0], (2, 3), &Device::Cpu).unwrap()
    }

    fn labels() -> Tensor {
        Tensor::from_slice(&[0u32, 2], 2, &Device::Cpu).unwrap()
    }

    fn reference(smoothing: f64) -> f64 {
        let rows = [[2.0f64, 0.5, -1.0], [0.0, 1.0, 3.0]];
        let targets = [0usize, 2];
        let mut total = 0.0;
        for (row, &target) in rows.iter().zip(&targets) {
            let lse = row.iter().map(|v| v.exp()).sum::<f64>().ln();
            let log_probs: Vec<f64> = row.iter().map(|v| v - lse).collect();
            let nll = -log_probs[target];
            let uniform = -log_probs.iter().sum::<f64>() / 3.0;
            total += (1.0 - smoothing) * nll + smoothing * uniform;
        }
        total / 2.0
    }

    #[test]
    fn matches_reference_without_smoothing() {
        let out = CrossEntropyLoss::new().compute(&logits(), &labels()).unwrap();
        assert!((out.value - reference(0.0)).abs() < 1e-5);
    }

    #[test]
    fn matches_reference_with_smoothing() {
        let loss = CrossEntropyLoss::new().with_label_smoothing(0.1).unwrap();
        let out = loss.compute(&logits(), &labels()).unwrap();
        assert!((out.value - reference(0.1)).abs() < 1e-5);
    }

    #[test]
    fn rejects_invalid_smoothing() {
        assert!(CrossEntropyLoss::new().with_label_smoothing(1.0).is_err());
    }

    #[test]
    fn non_finite_logits_are_reported() {
        let bad = Tensor::from_slice(&[f32::NAN, 0.0, 0.0, 0.0], (2, 2), &Device::Cpu).unwrap();
        let labels = Tensor::from_slice(&[0u32, 1], 2, &Device::Cpu).unwrap();
        let out = CrossEntropyLoss::new().compute(&bad, &labels).unwrap();
        assert!(!out.is_finite());
    }
}
