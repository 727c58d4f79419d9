//! Optimizer and learning-rate scheduling for the multi-task trainer
//!
//! Parameters are updated with Adam (candle's AdamW with zero decoupled weight
//! decay unless configured otherwise). The learning rate is decayed by a
//! plateau policy monitoring the evaluation loss once per epoch.

pub mod adamw;
pub mod schedulers;

pub use adamw::AdamOptimizer;
pub use schedulers::ReduceOnPlateauScheduler;

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::training::config::{OptimizerConfig, PlateauConfig};

/// Trait for optimizers
pub trait Optimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Apply one update from the gradients of a backward pass
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Number of updates applied so far
    fn step_count(&self) -> usize;
}

/// Trait for learning rate schedulers
pub trait Scheduler {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Step the scheduler with the monitored metric
    fn step(&mut self, metric: Option<f64>);

    /// Get current learning rate
    fn get_lr(&self) -> f64;

    /// Get scheduler state for checkpointing
    fn state_dict(&self) -> SchedulerStateDict;

    /// Load scheduler state from checkpoint
    fn load_state_dict(&mut self, state: &SchedulerStateDict) -> Result<()>;

    /// Reset scheduler to initial state
    fn reset(&mut self);
}

/// Scheduler state dictionary for checkpointing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStateDict {
    /// Scheduler type
    pub scheduler_type: String,

    /// Current step count
    pub step_count: usize,

    /// Current learning rate
    pub current_lr: f64,

    /// Base learning rate
    pub base_lr: f64,

    /// Scheduler-specific state
    pub state: HashMap<String, f64>,

    /// Hyperparameters
    pub hyperparameters: HashMap<String, f64>,
}

/// Create the Adam optimizer over every variable in `var_map`
pub fn create_optimizer(config: &OptimizerConfig, var_map: &VarMap) -> Result<AdamOptimizer> {
    AdamOptimizer::new(var_map, config)
}

/// Create the plateau scheduler starting from `base_lr`
pub fn create_scheduler(config: &PlateauConfig, base_lr: f64) -> ReduceOnPlateauScheduler {
    ReduceOnPlateauScheduler::new(config, base_lr)
}
