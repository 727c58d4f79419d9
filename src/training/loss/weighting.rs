//! Per-epoch task weights from loss-descending rates
//!
//! After a warmup of uniform weighting, each task's weight is a softmax over
//! the descending rates `L(t-2) / L(t-1)` with temperature `beta`, rescaled so
//! the three weights sum to 3. Tasks whose loss is still falling quickly get
//! up-weighted. Weights are plain `f64` values: they enter the combined loss as
//! constants, so no gradient ever flows into the weighting decision.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::history::TaskHistories;
use crate::training::config::{WeightingConfig, WeightingMethod};
use crate::training::task::{Task, NUM_TASKS};

/// Weight applied to each task loss for one epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskWeights([f64; NUM_TASKS]);

impl TaskWeights {
    /// `(1, 1, 1)`
    pub fn uniform() -> Self {
        Self([1.0; NUM_TASKS])
    }

    /// Wrap explicit weights
    pub fn new(weights: [f64; NUM_TASKS]) -> Self {
        Self(weights)
    }

    /// Weight of one task
    pub fn get(&self, task: Task) -> f64 {
        self.0[task.index()]
    }

    /// Weights in task order
    pub fn as_array(&self) -> [f64; NUM_TASKS] {
        self.0
    }

    /// Sum of the weights
    pub fn sum(&self) -> f64 {
        self.0.iter().sum()
    }

    /// Weighted sum of three scalar losses
    pub fn combine(&self, losses: [f64; NUM_TASKS]) -> f64 {
        self.0.iter().zip(losses).map(|(w, l)| w * l).sum()
    }
}

impl Default for TaskWeights {
    fn default() -> Self {
        Self::uniform()
    }
}

/// Turns loss histories into the weights for the coming epoch
#[derive(Debug, Clone)]
pub struct WeightController {
    method: WeightingMethod,
    warmup_epochs: usize,
    beta: f64,
}

impl WeightController {
    /// Create a controller from the weighting configuration
    pub fn new(config: &WeightingConfig) -> Self {
        Self {
            method: config.method,
            warmup_epochs: config.warmup_epochs,
            beta: config.beta,
        }
    }

    /// Weighting method in use
    pub fn method(&self) -> WeightingMethod {
        self.method
    }

    /// Weights for `epoch` given the histories at its start
    pub fn compute_weights(&self, epoch: usize, histories: &TaskHistories) -> TaskWeights {
        if epoch < self.warmup_epochs {
            return TaskWeights::uniform();
        }

        match self.method {
            WeightingMethod::Uniform => TaskWeights::uniform(),
            WeightingMethod::LossDescendingRate => {
                descending_rate_weights(histories.descending_rates(), self.beta)
            }
        }
    }
}

/// `w_i = 3 * exp(s_i / beta) / sum_j exp(s_j / beta)`
///
/// Evaluated with the largest rate subtracted first; the ratio is unchanged
/// and the exponentials stay finite for any rate spread.
pub fn descending_rate_weights(rates: [f64; NUM_TASKS], beta: f64) -> TaskWeights {
    let max_rate = rates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let raw = rates.map(|rate| ((rate - max_rate) / beta).exp());
    let total: f64 = raw.iter().sum();

    if !total.is_finite() || total <= 0.0 {
        warn!(
            "Non-finite descending rates {:?}, falling back to uniform weights",
            rates
        );
        return TaskWeights::uniform();
    }

    TaskWeights(raw.map(|r| NUM_TASKS as f64 * r / total))
}
