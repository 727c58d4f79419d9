//! Per-batch metrics and their epoch-level aggregation
//!
//! Every pass over a data source produces one [`BatchMetrics`] per batch. A
//! [`MetricAccumulator`] sums them field by field and divides by the batch
//! count at the end of the pass, yielding the [`EpochMetrics`] that go into
//! the [`ResultStore`].

pub mod results;

pub use results::{EpochRecord, Phase, ResultStore};

use std::fmt;

use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::TaskOutputs;
use crate::training::data::BatchTargets;
use crate::training::task::{Task, NUM_TASKS};

/// Scalar metrics of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    /// Weighted sum of the task losses
    pub combined_loss: f64,

    /// Unweighted loss per task
    pub task_losses: [f64; NUM_TASKS],

    /// Top-1 BS selection accuracy
    pub bs_accuracy: f64,

    /// Top-1 beam accuracy
    pub beam_accuracy: f64,

    /// Received power of the predicted beam over that of the optimal beam
    pub beam_gain: f64,

    /// Euclidean distance between predicted and true relative position
    pub distance_error: f64,
}

/// Epoch means share the per-batch layout
pub type EpochMetrics = BatchMetrics;

impl BatchMetrics {
    /// Evaluate accuracies, beam gain and distance error for one batch
    ///
    /// The beam gain is read from the ground-truth BS row of the power map.
    pub fn compute(
        outputs: &TaskOutputs,
        targets: &BatchTargets,
        task_losses: [f64; NUM_TASKS],
        combined_loss: f64,
    ) -> Result<Self> {
        let bs_pred = outputs.bs_logits.argmax(D::Minus1)?;
        let beam_pred = outputs.beam_logits.argmax(D::Minus1)?;

        let bs_accuracy = mean_scalar(&bs_pred.eq(&targets.bs_label)?)?;
        let beam_accuracy = mean_scalar(&beam_pred.eq(&targets.beam_label)?)?;
        let beam_gain = beam_gain(&targets.beam_power, &targets.bs_label, &beam_pred, &targets.beam_label)?;
        let distance_error = distance_error(&outputs.position, &targets.position)?;

        Ok(Self {
            combined_loss,
            task_losses,
            bs_accuracy,
            beam_accuracy,
            beam_gain,
            distance_error,
        })
    }

    /// Unweighted loss of one task
    pub fn task_loss(&self, task: Task) -> f64 {
        self.task_losses[task.index()]
    }

    /// `[combined, BS, beam, position]`
    pub fn losses(&self) -> [f64; NUM_TASKS + 1] {
        let [bs, beam, position] = self.task_losses;
        [self.combined_loss, bs, beam, position]
    }

    fn add(&mut self, other: &Self) {
        self.combined_loss += other.combined_loss;
        for (sum, value) in self.task_losses.iter_mut().zip(other.task_losses) {
            *sum += value;
        }
        self.bs_accuracy += other.bs_accuracy;
        self.beam_accuracy += other.beam_accuracy;
        self.beam_gain += other.beam_gain;
        self.distance_error += other.distance_error;
    }

    fn scale(&self, factor: f64) -> Self {
        Self {
            combined_loss: self.combined_loss * factor,
            task_losses: self.task_losses.map(|l| l * factor),
            bs_accuracy: self.bs_accuracy * factor,
            beam_accuracy: self.beam_accuracy * factor,
            beam_gain: self.beam_gain * factor,
            distance_error: self.distance_error * factor,
        }
    }
}

impl fmt::Display for BatchMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [bs, beam, position] = self.task_losses;
        write!(
            f,
            "loss {:.4} (Bs {:.4}, bt {:.4}, Up {:.4}), acc Bs {:.4} bt {:.4}, gain {:.4}, dist {:.4}",
            self.combined_loss,
            bs,
            beam,
            position,
            self.bs_accuracy,
            self.beam_accuracy,
            self.beam_gain,
            self.distance_error
        )
    }
}

/// Running totals over one pass
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    totals: BatchMetrics,
    batches: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch to the running totals
    pub fn accumulate(&mut self, batch: &BatchMetrics) {
        self.totals.add(batch);
        self.batches += 1;
    }

    /// Number of batches accumulated so far
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Running totals divided by `batch_count`
    ///
    /// Callers pass the number of batches the pass produced, which is never 0.
    pub fn finalize(&self, batch_count: usize) -> EpochMetrics {
        debug_assert!(batch_count > 0);
        self.totals.scale(1.0 / batch_count as f64)
    }
}

fn mean_scalar(tensor: &Tensor) -> Result<f64> {
    Ok(tensor.to_dtype(DType::F64)?.mean_all()?.to_scalar::<f64>()?)
}

/// Mean of `power[bs*, beam_pred] / power[bs*, beam*]` over the batch
fn beam_gain(
    beam_power: &Tensor,
    bs_label: &Tensor,
    beam_pred: &Tensor,
    beam_label: &Tensor,
) -> Result<f64> {
    let (batch, _, beam_num) = beam_power.dims3()?;

    let bs_index = bs_label
        .reshape((batch, 1, 1))?
        .broadcast_as((batch, 1, beam_num))?
        .contiguous()?;
    let serving_row = beam_power.contiguous()?.gather(&bs_index, 1)?.squeeze(1)?;

    let achieved = serving_row.gather(&beam_pred.reshape((batch, 1))?.contiguous()?, 1)?;
    let optimal = serving_row.gather(&beam_label.reshape((batch, 1))?.contiguous()?, 1)?;

    mean_scalar(&achieved.div(&optimal)?)
}

/// Mean Euclidean distance between two (batch, 2) position tensors
fn distance_error(predicted: &Tensor, target: &Tensor) -> Result<f64> {
    let distance = predicted.sub(target)?.sqr()?.sum(D::Minus1)?.sqrt()?;
    mean_scalar(&distance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn batch(value: f64) -> BatchMetrics {
        BatchMetrics {
            combined_loss: 3.0 * value,
            task_losses: [value, 2.0 * value, 0.5 * value],
            bs_accuracy: value / 10.0,
            beam_accuracy: value / 20.0,
            beam_gain: value / 4.0,
            distance_error: value + 1.0,
        }
    }

    #[test]
    fn test_finalize_is_elementwise_mean() {
        let values = [1.0, 2.5, 4.0, 0.5];
        let mut accumulator = MetricAccumulator::new();
        for v in values {
            accumulator.accumulate(&batch(v));
        }
        assert_eq!(accumulator.batches(), 4);

        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let expected = batch(mean);
        let finalized = accumulator.finalize(values.len());

        assert_relative_eq!(finalized.combined_loss, expected.combined_loss, epsilon = 1e-12);
        for task in Task::ALL {
            assert_relative_eq!(finalized.task_loss(task), expected.task_loss(task), epsilon = 1e-12);
        }
        assert_relative_eq!(finalized.bs_accuracy, expected.bs_accuracy, epsilon = 1e-12);
        assert_relative_eq!(finalized.beam_accuracy, expected.beam_accuracy, epsilon = 1e-12);
        assert_relative_eq!(finalized.beam_gain, expected.beam_gain, epsilon = 1e-12);
        assert_relative_eq!(finalized.distance_error, expected.distance_error, epsilon = 1e-12);
    }

    #[test]
    fn test_single_batch_finalize_is_identity() {
        let mut accumulator = MetricAccumulator::new();
        accumulator.accumulate(&batch(0.7));
        assert_eq!(accumulator.finalize(1), batch(0.7));
    }

    #[test]
    fn test_batch_metrics_compute() -> Result<()> {
        let device = Device::Cpu;
        let outputs = TaskOutputs {
            // predicts BS 1 then BS 0
            bs_logits: Tensor::new(&[[0f32, 1.], [1., 0.]], &device)?,
            // predicts beam 2 then beam 0
            beam_logits: Tensor::new(&[[0f32, 0., 5.], [5., 0., 0.]], &device)?,
            position: Tensor::new(&[[3f32, 4.], [1., 1.]], &device)?,
        };
        let beam_power = Tensor::new(
            &[
                [[1f32, 1., 1.], [1., 2., 4.]],
                [[2f32, 8., 1.], [9., 9., 9.]],
            ],
            &device,
        )?;
        let targets = BatchTargets {
            channel_history: Tensor::zeros((2, 2, 1, 2, 3), DType::F32, &device)?,
            bs_label: Tensor::new(&[1u32, 1], &device)?,
            beam_label: Tensor::new(&[2u32, 1], &device)?,
            beam_power,
            position: Tensor::new(&[[0f32, 0.], [1., 1.]], &device)?,
        };

        let metrics = BatchMetrics::compute(&outputs, &targets, [1.0, 2.0, 3.0], 6.0)?;

        assert_relative_eq!(metrics.bs_accuracy, 0.5);
        assert_relative_eq!(metrics.beam_accuracy, 0.5);
        // sample 0: 4 / 4 on BS 1; sample 1: 9 / 9 on BS 1
        assert_relative_eq!(metrics.beam_gain, 1.0, epsilon = 1e-6);
        // distances 5 and 0
        assert_relative_eq!(metrics.distance_error, 2.5, epsilon = 1e-6);
        assert_eq!(metrics.losses(), [6.0, 1.0, 2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_beam_gain_uses_serving_row() -> Result<()> {
        let device = Device::Cpu;
        let beam_power = Tensor::new(&[[[10f32, 0.], [1., 4.]]], &device)?;
        let gain = beam_gain(
            &beam_power,
            &Tensor::new(&[1u32], &device)?,
            &Tensor::new(&[0u32], &device)?,
            &Tensor::new(&[1u32], &device)?,
        )?;
        assert_relative_eq!(gain, 0.25, epsilon = 1e-6);
        Ok(())
    }
}
