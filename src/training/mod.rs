//! Training infrastructure for the multi-task mmWave model
//!
//! # Main Components
//!
//! - **Configuration**: loop, optimizer, scheduler and weighting knobs
//! - **Data**: data-source trait, target extraction and the shard loader
//! - **Loss**: task losses, loss histories, adaptive weights, gradient correlation
//! - **Metrics**: per-batch metrics, epoch means and the persisted result store
//! - **Optimizers**: Adam and plateau-triggered learning-rate decay
//! - **Checkpoints**: checkpoint-on-improvement per repetition
//! - **Trainer**: the train/eval loop driver
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use mmwave_mtl::{Config, MultiTaskTrainer};
//!
//! let config = Config::from_file("run.json")?;
//! let mut trainer = MultiTaskTrainer::from_config(config)?;
//! let result = trainer.train()?;
//! ```

pub mod checkpoints;
pub mod config;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod optimizers;
pub mod task;
pub mod trainer;

// Tests module
#[cfg(test)]
pub mod tests;

// Configuration re-exports
pub use config::{
    CorrelationMeasure, GradientAnalysisConfig, OptimizerConfig, PlateauConfig, PositionTarget,
    TrainingConfig, WeightingConfig, WeightingMethod,
};

// Trainer re-exports
pub use trainer::{MultiTaskTrainer, TrainingResult, TrainingState, TrainingStatus};

// Data re-exports
pub use data::{BatchTargets, DataSource, RawBatch, ShardDataLoader};

// Checkpoint re-exports
pub use checkpoints::{CheckpointManager, CheckpointMetadata};

// Metrics re-exports
pub use metrics::{BatchMetrics, EpochMetrics, EpochRecord, MetricAccumulator, Phase, ResultStore};

// Optimizer re-exports
pub use optimizers::{
    create_optimizer, create_scheduler, AdamOptimizer, Optimizer, ReduceOnPlateauScheduler,
    Scheduler, SchedulerStateDict,
};

// Loss re-exports
pub use loss::{
    GradientCorrelationAnalyzer, LossHistory, TaskHistories, TaskLosses, TaskWeights,
    WeightController,
};

pub use task::{Task, NUM_TASKS};
