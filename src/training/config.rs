//! Training configuration for the multi-task loop
//!
//! Holds the repetition/epoch structure, Adam and plateau-decay settings, the
//! task-weighting knobs and the gradient-analysis switch.

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Independent training repetitions (fresh model each)
    pub repetitions: usize,

    /// Epochs per repetition
    pub epochs: usize,

    /// Batch size
    pub batch_size: usize,

    /// Optimizer configuration
    pub optimizer: OptimizerConfig,

    /// Plateau-triggered learning-rate decay
    pub scheduler: PlateauConfig,

    /// Task weighting
    pub weighting: WeightingConfig,

    /// Gradient correlation instrumentation
    pub gradient_analysis: GradientAnalysisConfig,

    /// Which timestep the positioning target is taken from
    pub position_target: PositionTarget,

    /// Seed for data shuffling
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            repetitions: 3,
            epochs: 100,
            batch_size: 64,
            optimizer: OptimizerConfig::default(),
            scheduler: PlateauConfig::default(),
            weighting: WeightingConfig::default(),
            gradient_analysis: GradientAnalysisConfig::default(),
            position_target: PositionTarget::Predicted,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Validate training configuration
    pub fn validate(&self) -> Result<()> {
        if self.repetitions == 0 {
            return Err(Error::config("Number of repetitions must be greater than 0"));
        }

        if self.epochs == 0 {
            return Err(Error::config("Number of epochs must be greater than 0"));
        }

        if self.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }

        self.optimizer.validate()?;
        self.scheduler.validate(self.optimizer.learning_rate)?;
        self.weighting.validate()?;

        if self.gradient_analysis.eps <= 0.0 {
            return Err(Error::config("Gradient analysis eps must be positive"));
        }

        Ok(())
    }
}

/// Adam optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Base learning rate
    pub learning_rate: f64,

    /// First-moment decay
    pub beta1: f64,

    /// Second-moment decay
    pub beta2: f64,

    /// Epsilon for numerical stability
    pub epsilon: f64,

    /// Decoupled weight decay, zero for plain Adam
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 {
            return Err(Error::config("Learning rate must be positive"));
        }

        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(Error::config(format!("{} must be in [0.0, 1.0)", name)));
            }
        }

        if self.weight_decay < 0.0 {
            return Err(Error::config("Weight decay must be non-negative"));
        }

        Ok(())
    }
}

/// Plateau-triggered learning-rate decay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauConfig {
    /// Multiplier applied on a plateau
    pub factor: f64,

    /// Epochs without improvement tolerated before decaying
    pub patience: usize,

    /// Relative improvement required to count as better
    pub threshold: f64,

    /// Epochs to wait after a decay before counting again
    pub cooldown: usize,

    /// Learning-rate floor
    pub min_lr: f64,

    /// Smallest change worth applying
    pub eps: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 2,
            threshold: 1e-4,
            cooldown: 0,
            min_lr: 1e-9,
            eps: 1e-8,
        }
    }
}

impl PlateauConfig {
    fn validate(&self, learning_rate: f64) -> Result<()> {
        if self.factor <= 0.0 || self.factor >= 1.0 {
            return Err(Error::config("Plateau factor must be in (0.0, 1.0)"));
        }

        if self.min_lr < 0.0 || self.min_lr > learning_rate {
            return Err(Error::config("min_lr must be in [0.0, learning_rate]"));
        }

        if self.threshold < 0.0 {
            return Err(Error::config("Plateau threshold must be non-negative"));
        }

        Ok(())
    }
}

/// Task-weighting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightingConfig {
    /// Weighting method
    pub method: WeightingMethod,

    /// Epochs of uniform weighting before adaptation starts
    pub warmup_epochs: usize,

    /// Softmax temperature over descending rates
    pub beta: f64,

    /// EMA smoothing constant for the loss history
    pub mu: f64,
}

impl Default for WeightingConfig {
    fn default() -> Self {
        Self {
            method: WeightingMethod::LossDescendingRate,
            warmup_epochs: 10,
            beta: 5e-2,
            mu: 25e-2,
        }
    }
}

impl WeightingConfig {
    fn validate(&self) -> Result<()> {
        if self.beta <= 0.0 {
            return Err(Error::config("beta must be positive"));
        }

        if self.mu <= 0.0 || self.mu > 1.0 {
            return Err(Error::config("mu must be in (0.0, 1.0]"));
        }

        Ok(())
    }
}

/// Gradient correlation instrumentation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GradientAnalysisConfig {
    /// Whether to run the analyzer on every training batch
    pub enabled: bool,

    /// Correlation measure
    pub measure: CorrelationMeasure,

    /// Denominator guard
    pub eps: f64,
}

impl Default for GradientAnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            measure: CorrelationMeasure::CosineSimilarity,
            eps: 1e-6,
        }
    }
}

/// How per-epoch task weights are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum WeightingMethod {
    /// Softmax over loss-descending rates after warmup
    #[value(name = "loss_descending_rate_based_weighting")]
    #[serde(rename = "loss_descending_rate_based_weighting")]
    LossDescendingRate,
    /// Always (1, 1, 1)
    #[value(name = "uniform_weighting")]
    #[serde(rename = "uniform_weighting")]
    Uniform,
}

impl WeightingMethod {
    /// Compact tag used in output file names
    pub fn short_name(&self) -> &'static str {
        match self {
            WeightingMethod::LossDescendingRate => "ldr",
            WeightingMethod::Uniform => "uniform",
        }
    }
}

/// Scalar task-correlation measure computed from per-task gradients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum CorrelationMeasure {
    /// Cosine similarity on the filter row with the largest positioning gradient
    #[value(name = "cossim")]
    #[serde(rename = "cossim")]
    CosineSimilarity,
    /// Learning-rate scaled sum of the elementwise gradient ratio
    #[value(name = "ratio")]
    #[serde(rename = "ratio")]
    Ratio,
}

/// Timestep the UE-positioning regression target is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PositionTarget {
    /// One step ahead of the history window, like the classification labels
    Predicted,
    /// Last timestep inside the history window
    LastObserved,
}

impl PositionTarget {
    /// Sequence index of the target for a history of `his_len` steps
    pub fn index(&self, his_len: usize) -> usize {
        match self {
            PositionTarget::Predicted => his_len,
            PositionTarget::LastObserved => his_len.saturating_sub(1),
        }
    }
}

impl fmt::Display for WeightingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightingMethod::LossDescendingRate => f.write_str("loss_descending_rate_based_weighting"),
            WeightingMethod::Uniform => f.write_str("uniform_weighting"),
        }
    }
}

impl fmt::Display for CorrelationMeasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationMeasure::CosineSimilarity => f.write_str("cossim"),
            CorrelationMeasure::Ratio => f.write_str("ratio"),
        }
    }
}
