use std::fmt;

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::{distributed::ProcessGroup, error::to_runtime_error, TrainingError};

/// How per-class precision, recall and F1 are combined into one scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AverageMode {
    /// Global true/false positive counts.
    Micro,
    /// Unweighted mean over classes present in labels or predictions.
    #[default]
    Macro,
    /// Per-class mean weighted by label support.
    Weighted,
}

impl AverageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AverageMode::Micro => "micro",
            AverageMode::Macro => "macro",
            AverageMode::Weighted => "weighted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Split {
    Train,
    Validation,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "val",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential moving average used for the per-step loss readout.
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = self
            .value
            .map_or(sample, |prev| self.alpha * sample + (1.0 - self.alpha) * prev);
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Accumulates a confusion matrix and a sample-weighted loss for one
/// `(epoch, split)` on one rank.
///
/// Counts from all ranks are summed by [`MetricAggregator::reduce`] before
/// any rate is derived.
#[derive(Debug, Clone)]
pub struct MetricAggregator {
    num_classes: usize,
    average: AverageMode,
    epoch: usize,
    split: Split,
    /// Row-major `[true_class][predicted_class]`.
    confusion: Vec<u64>,
    loss_sum: f64,
    loss_samples: u64,
}

impl MetricAggregator {
    pub fn new(num_classes: usize, average: AverageMode) -> Self {
        Self {
            num_classes,
            average,
            epoch: 0,
            split: Split::Train,
            confusion: vec![0; num_classes * num_classes],
            loss_sum: 0.0,
            loss_samples: 0,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn average(&self) -> AverageMode {
        self.average
    }

    /// Clears all counts and tags subsequent records with `(epoch, split)`.
    pub fn reset(&mut self, epoch: usize, split: Split) {
        self.epoch = epoch;
        self.split = split;
        self.confusion.iter_mut().for_each(|count| *count = 0);
        self.loss_sum = 0.0;
        self.loss_samples = 0;
    }

    pub fn record(&mut self, predictions: &[u32], labels: &[u32]) -> Result<(), TrainingError> {
        if predictions.len() != labels.len() {
            return Err(TrainingError::runtime(format!(
                "{} predictions recorded against {} labels",
                predictions.len(),
                labels.len()
            )));
        }
        for (&pred, &label) in predictions.iter().zip(labels) {
            let (pred, label) = (pred as usize, label as usize);
            if pred >= self.num_classes || label >= self.num_classes {
                return Err(TrainingError::runtime(format!(
                    "class index out of range for {} classes (prediction {pred}, label {label})",
                    self.num_classes
                )));
            }
            self.confusion[label * self.num_classes + pred] += 1;
        }
        Ok(())
    }

    /// Adds a batch-mean loss weighted by the number of rows it covered.
    pub fn record_loss(&mut self, mean_loss: f64, samples: usize) {
        self.loss_sum += mean_loss * samples as f64;
        self.loss_samples += samples as u64;
    }

    /// Sums loss and confusion counts across every rank of `group`.
    pub fn reduce(&mut self, group: &ProcessGroup) -> Result<(), TrainingError> {
        if group.world_size() == 1 {
            return Ok(());
        }
        let mut buffer = Vec::with_capacity(2 + self.confusion.len());
        buffer.push(self.loss_sum);
        buffer.push(self.loss_samples as f64);
        buffer.extend(self.confusion.iter().map(|&count| count as f64));
        group.all_reduce_sum(&mut buffer)?;

        self.loss_sum = buffer[0];
        self.loss_samples = buffer[1].round() as u64;
        for (count, value) in self.confusion.iter_mut().zip(&buffer[2..]) {
            *count = value.round() as u64;
        }
        Ok(())
    }

    pub fn confusion(&self) -> &[u64] {
        &self.confusion
    }

    pub fn samples(&self) -> u64 {
        self.confusion.iter().sum()
    }

    pub fn summarize(&self) -> EpochSummary {
        let scores = ClassScores::from_confusion(&self.confusion, self.num_classes);
        let (precision, recall, f1) = scores.averaged(self.average);
        let mean_loss = if self.loss_samples == 0 {
            0.0
        } else {
            self.loss_sum / self.loss_samples as f64
        };
        EpochSummary {
            epoch: self.epoch,
            split: self.split,
            mean_loss,
            accuracy: scores.accuracy(),
            precision,
            recall,
            f1,
            average: self.average,
            samples: scores.total,
        }
    }
}

/// Arg-max class per row of `(batch, classes)` logits.
pub fn predictions_from_logits(logits: &Tensor) -> Result<Vec<u32>, TrainingError> {
    logits
        .argmax(D::Minus1)
        .and_then(|t| t.to_vec1::<u32>())
        .map_err(to_runtime_error)
}

struct ClassScores {
    true_positive: Vec<u64>,
    predicted: Vec<u64>,
    support: Vec<u64>,
    total: u64,
}

impl ClassScores {
    fn from_confusion(confusion: &[u64], num_classes: usize) -> Self {
        let mut true_positive = vec![0; num_classes];
        let mut predicted = vec![0; num_classes];
        let mut support = vec![0; num_classes];
        for label in 0..num_classes {
            for pred in 0..num_classes {
                let count = confusion[label * num_classes + pred];
                support[label] += count;
                predicted[pred] += count;
                if label == pred {
                    true_positive[label] += count;
                }
            }
        }
        let total = support.iter().sum();
        Self {
            true_positive,
            predicted,
            support,
            total,
        }
    }

    fn accuracy(&self) -> f64 {
        ratio(self.true_positive.iter().sum(), self.total)
    }

    fn class(&self, class: usize) -> (f64, f64, f64) {
        let tp = self.true_positive[class];
        let precision = ratio(tp, self.predicted[class]);
        let recall = ratio(tp, self.support[class]);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        (precision, recall, f1)
    }

    fn averaged(&self, mode: AverageMode) -> (f64, f64, f64) {
        match mode {
            // Single-label: every error is one false positive and one false negative.
            AverageMode::Micro => {
                let accuracy = self.accuracy();
                (accuracy, accuracy, accuracy)
            }
            AverageMode::Macro => {
                let present: Vec<usize> = (0..self.support.len())
                    .filter(|&c| self.support[c] > 0 || self.predicted[c] > 0)
                    .collect();
                if present.is_empty() {
                    return (0.0, 0.0, 0.0);
                }
                let n = present.len() as f64;
                let (p, r, f) = present.iter().fold((0.0, 0.0, 0.0), |acc, &c| {
                    let (p, r, f) = self.class(c);
                    (acc.0 + p, acc.1 + r, acc.2 + f)
                });
                (p / n, r / n, f / n)
            }
            AverageMode::Weighted => {
                if self.total == 0 {
                    return (0.0, 0.0, 0.0);
                }
                let total = self.total as f64;
                (0..self.support.len()).fold((0.0, 0.0, 0.0), |acc, c| {
                    let weight = self.support[c] as f64 / total;
                    let (p, r, f) = self.class(c);
                    (acc.0 + weight * p, acc.1 + weight * r, acc.2 + weight * f)
                })
            }
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Metrics of one split at the end of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub split: Split,
    pub mean_loss: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub average: AverageMode,
    pub samples: u64,
}

impl EpochSummary {
    /// Tracker scalars keyed `<split>_<metric>`.
    pub fn scalars(&self) -> Vec<(String, f64)> {
        let split = self.split.as_str();
        vec![
            (format!("{split}_loss"), self.mean_loss),
            (format!("{split}_accuracy"), self.accuracy),
            (format!("{split}_precision"), self.precision),
            (format!("{split}_recall"), self.recall),
            (format!("{split}_f1"), self.f1),
        ]
    }
}

impl fmt::Display for EpochSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch {} {}: loss {:.4} | acc {:.4} | precision {:.4} | recall {:.4} | f1 ({}) {:.4} | samples {}",
            self.epoch,
            self.split,
            self.mean_loss,
            self.accuracy,
            self.precision,
            self.recall,
            self.average.as_str(),
            self.f1,
            self.samples
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::launch;
    use candle_core::Device;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn macro_ignores_classes_never_seen() {
        let mut metrics = MetricAggregator::new(4, AverageMode::Macro);
        metrics.reset(1, Split::Validation);
        metrics.record(&[0, 1, 1, 0], &[0, 1, 0, 0]).unwrap();
        let summary = metrics.summarize();

        // class 0: p = 1, r = 2/3; class 1: p = 1/2, r = 1; classes 2,3 absent.
        let f1_0 = 2.0 * (2.0 / 3.0) / (1.0 + 2.0 / 3.0);
        let f1_1 = 2.0 * 0.5 / 1.5;
        assert!(close(summary.precision, 0.75));
        assert!(close(summary.recall, (2.0 / 3.0 + 1.0) / 2.0));
        assert!(close(summary.f1, (f1_0 + f1_1) / 2.0));
        assert!(close(summary.accuracy, 0.75));
        assert_eq!(summary.samples, 4);
    }

    #[test]
    fn zero_division_contributes_zero() {
        let mut metrics = MetricAggregator::new(3, AverageMode::Macro);
        metrics.record(&[2, 2], &[0, 1]).unwrap();
        let summary = metrics.summarize();
        assert_eq!(summary.precision, 0.0);
        assert_eq!(summary.recall, 0.0);
        assert_eq!(summary.f1, 0.0);
        assert!(summary.f1.is_finite());

        let empty = MetricAggregator::new(3, AverageMode::Weighted).summarize();
        assert_eq!(empty.f1, 0.0);
        assert_eq!(empty.mean_loss, 0.0);
    }

    #[test]
    fn micro_and_weighted_modes() {
        let predictions = [0, 0, 1, 2, 2, 2];
        let labels = [0, 1, 1, 2, 2, 0];

        let mut micro = MetricAggregator::new(3, AverageMode::Micro);
        micro.record(&predictions, &labels).unwrap();
        let summary = micro.summarize();
        assert!(close(summary.f1, 4.0 / 6.0));
        assert!(close(summary.precision, summary.accuracy));

        let mut weighted = MetricAggregator::new(3, AverageMode::Weighted);
        weighted.record(&predictions, &labels).unwrap();
        let summary = weighted.summarize();
        // Every class has support 2 so weighted recall is the mean recall.
        assert!(close(summary.recall, (0.5 + 0.5 + 1.0) / 3.0));
    }

    #[test]
    fn loss_is_weighted_by_samples() {
        let mut metrics = MetricAggregator::new(2, AverageMode::Macro);
        metrics.record_loss(1.0, 3);
        metrics.record_loss(2.0, 1);
        assert!(close(metrics.summarize().mean_loss, 1.25));

        metrics.reset(2, Split::Train);
        assert_eq!(metrics.summarize().mean_loss, 0.0);
        assert_eq!(metrics.summarize().epoch, 2);
    }

    #[test]
    fn out_of_range_labels_are_rejected() {
        let mut metrics = MetricAggregator::new(2, AverageMode::Macro);
        assert!(metrics.record(&[0], &[2]).is_err());
        assert!(metrics.record(&[0, 1], &[0]).is_err());
    }

    #[test]
    fn reduction_sums_counts_before_computing_rates() {
        // Rank 0 sees mostly class 0, rank 1 mostly class 1.
        let shards: [(&[u32], &[u32]); 2] = [
            (&[0, 0, 0, 1], &[0, 0, 1, 1]),
            (&[1, 1, 0, 1, 1, 1], &[1, 1, 1, 1, 0, 1]),
        ];

        let per_rank: Vec<f64> = shards
            .iter()
            .map(|(pred, label)| {
                let mut local = MetricAggregator::new(2, AverageMode::Macro);
                local.record(pred, label).unwrap();
                local.summarize().f1
            })
            .collect();
        let averaged = per_rank.iter().sum::<f64>() / per_rank.len() as f64;

        let reduced = launch(vec![Device::Cpu; 2], |ctx| {
            let (pred, label) = shards[ctx.group.rank()];
            let mut metrics = MetricAggregator::new(2, AverageMode::Macro);
            metrics.record(pred, label)?;
            metrics.record_loss(ctx.group.rank() as f64, pred.len());
            metrics.reduce(&ctx.group)?;
            Ok(metrics.summarize())
        })
        .unwrap();

        let mut global = MetricAggregator::new(2, AverageMode::Macro);
        for (pred, label) in shards {
            global.record(pred, label).unwrap();
        }
        let expected = global.summarize().f1;

        for summary in &reduced {
            assert!(close(summary.f1, expected));
            assert_eq!(summary.samples, 10);
            assert!(close(summary.mean_loss, 6.0 / 10.0));
        }
        assert!((expected - averaged).abs() > 1e-3);
    }

    #[test]
    fn predictions_take_the_arg_max() {
        let logits = Tensor::from_slice(
            &[0.1f32, 2.0, -1.0, 3.0, 0.0, 0.5],
            (2, 3),
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(predictions_from_logits(&logits).unwrap(), vec![1, 0]);
    }

    #[test]
    fn moving_average_starts_at_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.value(), None);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(2.0), 3.0);
    }
}
