//! Task losses and the dynamic multi-task weighting scheme
//!
//! # Key Components
//!
//! - **TaskLosses**: cross-entropy for BS selection and beam tracking, MSE for
//!   UE positioning, kept as graph-connected scalars
//! - **LossHistory / TaskHistories**: two-step EMA of every task's epoch loss
//! - **WeightController**: loss-descending-rate weights, or uniform
//! - **GradientCorrelationAnalyzer**: optional per-task gradient instrumentation
//!
//! ```rust,ignore
//! let weights = controller.compute_weights(epoch, &histories);
//! let losses = TaskLosses::compute(&outputs, &targets)?;
//! let grads = losses.combined(&weights)?.backward()?;
//! ```

pub mod correlation;
pub mod history;
pub mod weighting;

pub use correlation::{CorrelationReport, GradientCorrelationAnalyzer, GradientSnapshot};
pub use history::{LossHistory, TaskHistories};
pub use weighting::{descending_rate_weights, TaskWeights, WeightController};

use candle_core::{DType, Tensor};

use crate::error::Result;
use crate::models::TaskOutputs;
use crate::training::data::BatchTargets;
use crate::training::task::{Task, NUM_TASKS};

/// Per-task scalar losses of one batch, still attached to the graph
#[derive(Debug, Clone)]
pub struct TaskLosses {
    losses: [Tensor; NUM_TASKS],
}

impl TaskLosses {
    /// Compute all three task losses
    pub fn compute(outputs: &TaskOutputs, targets: &BatchTargets) -> Result<Self> {
        let bs = candle_nn::loss::cross_entropy(&outputs.bs_logits, &targets.bs_label)?;
        let beam = candle_nn::loss::cross_entropy(&outputs.beam_logits, &targets.beam_label)?;
        let position = candle_nn::loss::mse(&outputs.position, &targets.position)?;
        Ok(Self {
            losses: [bs, beam, position],
        })
    }

    /// Loss of one task
    pub fn get(&self, task: Task) -> &Tensor {
        &self.losses[task.index()]
    }

    /// `w_i * loss_i` for every task
    pub fn weighted(&self, weights: &TaskWeights) -> Result<[Tensor; NUM_TASKS]> {
        let [bs, beam, position] = &self.losses;
        Ok([
            (bs * weights.get(Task::BsSelection))?,
            (beam * weights.get(Task::BeamTracking))?,
            (position * weights.get(Task::UePositioning))?,
        ])
    }

    /// Weighted sum used for the parameter-updating backward pass
    pub fn combined(&self, weights: &TaskWeights) -> Result<Tensor> {
        let [bs, beam, position] = self.weighted(weights)?;
        Ok(((bs + beam)? + position)?)
    }

    /// Host-side values in task order
    pub fn values(&self) -> Result<[f64; NUM_TASKS]> {
        let mut values = [0.0; NUM_TASKS];
        for (value, loss) in values.iter_mut().zip(&self.losses) {
            *value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn outputs_and_targets() -> Result<(TaskOutputs, BatchTargets)> {
        let device = Device::Cpu;
        let outputs = TaskOutputs {
            bs_logits: Tensor::new(&[[0f32, 0.], [0., 0.]], &device)?,
            beam_logits: Tensor::new(&[[10f32, 0., 0.], [0., 0., 10.]], &device)?,
            position: Tensor::new(&[[1f32, 1.], [0., 0.]], &device)?,
        };
        let targets = BatchTargets {
            channel_history: Tensor::zeros((2, 2, 1, 2, 3), DType::F32, &device)?,
            bs_label: Tensor::new(&[0u32, 1], &device)?,
            beam_label: Tensor::new(&[0u32, 2], &device)?,
            beam_power: Tensor::ones((2, 2, 3), DType::F32, &device)?,
            position: Tensor::new(&[[0f32, 1.], [0., 2.]], &device)?,
        };
        Ok((outputs, targets))
    }

    #[test]
    fn test_task_losses() -> Result<()> {
        let (outputs, targets) = outputs_and_targets()?;
        let losses = TaskLosses::compute(&outputs, &targets)?;
        let [bs, beam, position] = losses.values()?;

        assert_relative_eq!(bs, std::f64::consts::LN_2, epsilon = 1e-6);
        assert!(beam < 1e-3);
        // squared errors 1, 0, 0, 4 over four elements
        assert_relative_eq!(position, 1.25, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_combined_loss_uses_weights() -> Result<()> {
        let (outputs, targets) = outputs_and_targets()?;
        let losses = TaskLosses::compute(&outputs, &targets)?;
        let values = losses.values()?;

        let weights = TaskWeights::new([2.0, 0.5, 0.5]);
        let combined = losses
            .combined(&weights)?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;
        assert_relative_eq!(combined, weights.combine(values), epsilon = 1e-5);
        Ok(())
    }
}
