//! Accuracy/loss accumulation and the per-epoch report.

use std::fmt;

use candle_core::{Tensor, D};

use crate::error::TrainResult;

/// Argmax-vs-label hits of a `[Q, C]` prediction against `Q` labels.
pub fn correct_predictions(log_probs: &Tensor, labels: &Tensor) -> TrainResult<usize> {
    let hits = log_probs
        .argmax(D::Minus1)?
        .eq(labels)?
        .to_dtype(candle_core::DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(hits as usize)
}

/// Fraction of correct predictions; an empty set counts as fully correct.
pub fn accuracy(correct: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        correct as f64 / total as f64
    }
}

/// Accumulates batch results into split-level accuracy and mean loss.
#[derive(Debug, Default, Clone)]
pub struct MetricAccumulator {
    correct: usize,
    total: usize,
    loss_sum: f64,
}

impl MetricAccumulator {
    /// Record one batch: `loss` is the batch mean over `count` rows.
    pub fn record(&mut self, correct: usize, count: usize, loss: f64) {
        self.correct += correct;
        self.total += count;
        self.loss_sum += loss * count as f64;
    }

    /// Split-level metrics; both values are NaN when nothing was recorded.
    pub fn finish(&self) -> SplitMetrics {
        if self.total == 0 {
            return SplitMetrics::empty();
        }
        SplitMetrics {
            accuracy: accuracy(self.correct, self.total),
            loss: self.loss_sum / self.total as f64,
            count: self.total,
        }
    }
}

/// Accuracy and mean NLL over one split.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitMetrics {
    pub accuracy: f64,
    pub loss: f64,
    pub count: usize,
}

impl SplitMetrics {
    /// A split without any rows. Accuracy and loss are undefined.
    pub fn empty() -> Self {
        Self {
            accuracy: f64::NAN,
            loss: f64::NAN,
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Evaluation result of one epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub train: SplitMetrics,
    pub validation: SplitMetrics,
    pub test: SplitMetrics,
}

impl fmt::Display for EpochReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Epoch: {}  Train acc: {:.4} loss: {:.4}  Val acc: {:.4} loss: {:.4}  Test acc: {:.4} loss: {:.4}",
            self.epoch,
            self.train.accuracy,
            self.train.loss,
            self.validation.accuracy,
            self.validation.loss,
            self.test.accuracy,
            self.test.loss
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_correct_predictions() {
        let log_probs = Tensor::new(&[[0.1f32, 0.9], [0.8, 0.2], [0.3, 0.7]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[1u32, 1, 1], &Device::Cpu).unwrap();
        assert_eq!(correct_predictions(&log_probs, &labels).unwrap(), 2);
    }

    #[test]
    fn test_empty_accuracy_is_one() {
        assert_eq!(accuracy(0, 0), 1.0);
        assert_eq!(accuracy(1, 4), 0.25);
    }

    #[test]
    fn test_accumulator_weights_loss_by_rows() {
        let mut acc = MetricAccumulator::default();
        acc.record(3, 3, 1.0);
        acc.record(0, 1, 5.0);
        let metrics = acc.finish();
        assert_eq!(metrics.accuracy, 0.75);
        assert!((metrics.loss - 2.0).abs() < 1e-12);
        assert_eq!(metrics.count, 4);
    }

    #[test]
    fn test_empty_split_is_undefined() {
        let metrics = MetricAccumulator::default().finish();
        assert!(metrics.is_empty());
        assert!(metrics.accuracy.is_nan());
        assert!(metrics.loss.is_nan());
    }

    #[test]
    fn test_report_line() {
        let split = SplitMetrics {
            accuracy: 0.5,
            loss: 0.69314,
            count: 2,
        };
        let report = EpochReport {
            epoch: 3,
            train: split,
            validation: split,
            test: split,
        };
        assert_eq!(
            report.to_string(),
            "Epoch: 3  Train acc: 0.5000 loss: 0.6931  Val acc: 0.5000 loss: 0.6931  Test acc: 0.5000 loss: 0.6931"
        );
    }
}
